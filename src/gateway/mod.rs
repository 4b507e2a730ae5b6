//! Gateway assembly and lifecycle

pub mod lifecycle;

pub use lifecycle::{GatewayLifecycle, GatewayState, LifecycleTimeouts, ShutdownReport};
