//! Fog connector
//!
//! A fog gateway bridging an on-premises MQTT broker and a cloud IoT
//! platform. Device fleet changes flow from the cloud to the broker; device
//! commands flow from the broker to the cloud.
//!
//! # Overview
//!
//! - [`transport`]: one logical broker connection with reconnection,
//!   resubscription and a bounded outbox
//! - [`bridge`]: the message publisher and the two directions of the bridge
//! - [`cloud`]: the cloud connector capability and its HTTP adapter
//! - [`gateway`]: startup and ordered shutdown of the whole
//!
//! # Quick Start
//!
//! ```rust
//! use fog_connector::protocol::{OutboundEvent, RouteKey, RouteTable};
//! use fog_connector::config::RoutesSection;
//!
//! let routes = RouteTable::from_config(&RoutesSection::default());
//! let event = OutboundEvent::DeviceRemoved { device_id: "d1".into() };
//!
//! let route = routes.resolve(event.route_key(), event.device_id()).unwrap();
//! assert_eq!(route.topic, "fog/devices/d1/unregistered");
//! assert_eq!(event.route_key(), RouteKey::DeviceRemoved);
//! ```

pub mod auth;
pub mod bridge;
pub mod cloud;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod observability;
pub mod privileges;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use gateway::{GatewayLifecycle, ShutdownReport};
