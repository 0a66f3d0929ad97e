//! Cooperative lifecycle state shared between a loop and its controller
//!
//! Every long-running loop in the crate (audio bridge decode worker,
//! client network link, relay) owns one [`SharedRunState`]. The controller
//! only ever *requests* transitions; the loop polls the state once per
//! iteration and performs the terminal transition itself.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle of a subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    /// Never started, or fully reset after a previous run
    Idle = 0,
    /// Loop is executing
    Running = 1,
    /// Controller asked the loop to exit
    StopRequested = 2,
    /// Loop exited because the remote end went away
    Disconnected = 3,
    /// Loop exited after a stop request
    Stopped = 4,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RunState::Running,
            2 => RunState::StopRequested,
            3 => RunState::Disconnected,
            4 => RunState::Stopped,
            _ => RunState::Idle,
        }
    }
}

/// Thread-safe handle to a [`RunState`]
#[derive(Debug, Clone)]
pub struct SharedRunState {
    inner: Arc<AtomicU8>,
}

impl SharedRunState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AtomicU8::new(RunState::Idle as u8)),
        }
    }

    pub fn get(&self) -> RunState {
        RunState::from_u8(self.inner.load(Ordering::Acquire))
    }

    pub fn set(&self, state: RunState) {
        self.inner.store(state as u8, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.get() == RunState::Running
    }

    /// Request a running loop to stop.
    ///
    /// Returns `false` if the loop was not running, in which case the
    /// state is left untouched.
    pub fn request_stop(&self) -> bool {
        self.transition(RunState::Running, RunState::StopRequested)
    }

    /// Atomically move from `from` to `to`; returns whether it happened.
    pub fn transition(&self, from: RunState, to: RunState) -> bool {
        self.inner
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for SharedRunState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_only_from_running() {
        let state = SharedRunState::new();
        assert!(!state.request_stop());
        assert_eq!(state.get(), RunState::Idle);

        state.set(RunState::Running);
        assert!(state.request_stop());
        assert_eq!(state.get(), RunState::StopRequested);

        // Second request is a no-op
        assert!(!state.request_stop());
    }

    #[test]
    fn test_disconnect_does_not_overwrite_stop() {
        let state = SharedRunState::new();
        state.set(RunState::Running);
        assert!(state.request_stop());
        assert!(!state.transition(RunState::Running, RunState::Disconnected));
        assert_eq!(state.get(), RunState::StopRequested);
    }

    #[test]
    fn test_clones_share_state() {
        let a = SharedRunState::new();
        let b = a.clone();
        a.set(RunState::Running);
        assert!(b.is_running());
    }
}
