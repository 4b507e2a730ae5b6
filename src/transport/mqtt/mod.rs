//! MQTT v5 broker sessions
//!
//! - [`options`] - client options from configuration
//! - [`event_router`] - pure translation of rumqttc events
//! - [`session`] - the [`MqttSession`] I/O tasks
//!
//! # Usage
//!
//! ```rust,no_run
//! use fog_connector::config::BrokerSection;
//! use fog_connector::transport::{mqtt::MqttSession, BrokerConnection, ReconnectConfig};
//!
//! # tokio_test::block_on(async {
//! let config = BrokerSection {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     username_env: None,
//!     password_env: None,
//!     token_env: Some("FOG_TOKEN".to_string()),
//!     token_file: None,
//!     token_ttl_secs: None,
//!     buffer_capacity: 256,
//!     keep_alive_secs: 60,
//!     reconnect: Default::default(),
//! };
//!
//! let reconnect = ReconnectConfig::from(&config.reconnect);
//! let capacity = config.buffer_capacity;
//! let broker = BrokerConnection::new(MqttSession::new("fog-01", config), reconnect, capacity);
//! broker.start().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod event_router;
pub mod options;
pub mod session;

pub use event_router::{route_mqtt_event, EventRoute};
pub use options::configure_mqtt_options;
pub use session::MqttSession;
