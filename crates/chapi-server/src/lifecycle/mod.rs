//! Per-client connection lifecycle.

pub mod controller;
pub mod registry;

pub use controller::{BroadcastReport, LifecycleController};
pub use registry::{ConnectionInfo, ConnectionRegistry, HeldConnection};
