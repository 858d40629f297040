//! Device registry
//!
//! Tracks every device heard on the bus and whether it is still alive

pub mod registry;
pub mod types;

pub use registry::DeviceRegistry;
pub use types::{DeviceRecord, IgnoreReason, LivenessTransition, RegistryUpdate};
