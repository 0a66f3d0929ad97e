//! Audio subsystem module

pub mod bridge;
pub mod device;
pub mod frame;

pub use bridge::{AudioBridge, AudioPath, BridgeStats};
pub use device::{list_devices, AudioDevice, AudioDeviceInfo, CpalDevice, NullDevice};
pub use frame::AudioFrame;
