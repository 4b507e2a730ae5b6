//! The two directions of the fog bridge
//!
//! - cloud → broker: [`CloudConnectionHandler`] republishes fleet changes
//!   through the [`MessagePublisher`];
//! - broker → cloud: [`MessageHandler`] validates inbound commands and
//!   dispatches them to the [`crate::cloud::CloudConnector`].
//!
//! Both directions share the [`DeviceRegistry`] and keep per-device ordering
//! with [`KeyedWorkers`].

pub mod cloud_handler;
pub mod devices;
pub mod message_handler;
pub mod publisher;
pub mod workers;

pub use cloud_handler::{CloudConnectionHandler, ForwardingPolicy};
pub use devices::DeviceRegistry;
pub use message_handler::{DispatchPolicy, MessageHandler};
pub use publisher::MessagePublisher;
pub use workers::{DrainReport, KeyedWorkers, SubmitError};
