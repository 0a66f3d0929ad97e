//! Bounded FIFO queues shared between the audio callback, the decode
//! worker and the network loops.
//!
//! A [`ChunkQueue`] is lock-free on the push and non-blocking pop paths
//! (safe to call from the real-time audio callback). Consumers that are
//! allowed to park, like the decode worker, use [`ChunkQueue::pop_timeout`].

use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What to do when a push hits a full queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict the oldest queued item to make room for the new one
    #[default]
    DropOldest,
    /// Reject the new item, keep what is queued
    DropNewest,
}

/// Bounded multi-producer FIFO with one logical consumer
pub struct ChunkQueue<T> {
    queue: ArrayQueue<T>,
    policy: DropPolicy,
    dropped: AtomicUsize,
    underruns: AtomicUsize,
    wait_lock: Mutex<()>,
    available: Condvar,
}

impl<T> ChunkQueue<T> {
    /// Create a new queue. `capacity` must be non-zero.
    pub fn new(capacity: usize, policy: DropPolicy) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            policy,
            dropped: AtomicUsize::new(0),
            underruns: AtomicUsize::new(0),
            wait_lock: Mutex::new(()),
            available: Condvar::new(),
        }
    }

    /// Push an item without blocking.
    ///
    /// Returns `false` if an item was lost to the drop policy (either the
    /// evicted oldest item or `item` itself).
    pub fn push(&self, item: T) -> bool {
        let lossless = match self.policy {
            DropPolicy::DropOldest => self.queue.force_push(item).is_none(),
            DropPolicy::DropNewest => self.queue.push(item).is_ok(),
        };
        if !lossless {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.available.notify_one();
        lossless
    }

    /// Pop the oldest item without blocking
    pub fn try_pop(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Pop the oldest item, counting an underrun when empty
    pub fn pop_or_underrun(&self) -> Option<T> {
        let item = self.queue.pop();
        if item.is_none() {
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Pop the oldest item, waiting at most `timeout` for one to arrive.
    ///
    /// Producers notify without taking `wait_lock`, so a wakeup can be
    /// missed; the wait is then bounded by `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        if let Some(item) = self.queue.pop() {
            return Some(item);
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self.wait_lock.lock();
        loop {
            if let Some(item) = self.queue.pop() {
                return Some(item);
            }
            if self.available.wait_until(&mut guard, deadline).timed_out() {
                return self.queue.pop();
            }
        }
    }

    /// Discard everything queued; returns how many items were discarded
    pub fn clear(&self) -> usize {
        let mut discarded = 0;
        while self.queue.pop().is_some() {
            discarded += 1;
        }
        discarded
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Items lost to the drop policy since creation
    pub fn dropped_count(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> usize {
        self.underruns.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a queue
pub type SharedQueue<T> = Arc<ChunkQueue<T>>;

/// Create a new shared queue
pub fn create_shared_queue<T>(capacity: usize, policy: DropPolicy) -> SharedQueue<T> {
    Arc::new(ChunkQueue::new(capacity, policy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = ChunkQueue::new(4, DropPolicy::DropOldest);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(queue.push(3));
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_drop_oldest_keeps_freshest() {
        let queue = ChunkQueue::new(2, DropPolicy::DropOldest);
        queue.push("a");
        queue.push("b");
        assert!(!queue.push("c"));

        assert_eq!(queue.dropped_count(), 1);
        assert_eq!(queue.try_pop(), Some("b"));
        assert_eq!(queue.try_pop(), Some("c"));
    }

    #[test]
    fn test_drop_newest_keeps_queued() {
        let queue = ChunkQueue::new(2, DropPolicy::DropNewest);
        queue.push("a");
        queue.push("b");
        assert!(!queue.push("c"));

        assert_eq!(queue.dropped_count(), 1);
        assert_eq!(queue.try_pop(), Some("a"));
        assert_eq!(queue.try_pop(), Some("b"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear_reports_discarded() {
        let queue = ChunkQueue::new(8, DropPolicy::DropOldest);
        for i in 0..5 {
            queue.push(i);
        }
        assert_eq!(queue.clear(), 5);
        assert!(queue.is_empty());
        assert_eq!(queue.clear(), 0);
    }

    #[test]
    fn test_underrun_counting() {
        let queue: ChunkQueue<u8> = ChunkQueue::new(2, DropPolicy::DropOldest);
        assert!(queue.pop_or_underrun().is_none());
        assert!(queue.try_pop().is_none());
        assert_eq!(queue.underrun_count(), 1);
    }

    #[test]
    fn test_pop_timeout_expires_when_empty() {
        let queue: ChunkQueue<u8> = ChunkQueue::new(2, DropPolicy::DropOldest);
        let start = Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_pop_timeout_wakes_on_push() {
        let queue = create_shared_queue(4, DropPolicy::DropOldest);
        let producer = queue.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.push(42u32);
        });

        assert_eq!(queue.pop_timeout(Duration::from_secs(2)), Some(42));
        handle.join().unwrap();
    }
}
