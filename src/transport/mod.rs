//! Broker transport layer
//!
//! [`BrokerConnection`] keeps one logical connection to the on-premises broker
//! alive across physical sessions. Sessions come from a [`BrokerSession`]
//! implementation: [`mqtt::MqttSession`] in production, the loopback double in
//! tests.

use crate::protocol::{Frame, Message, Route};
use tokio::sync::mpsc;

pub mod broker;
pub mod connection;
pub mod health_monitor;
pub mod mqtt;
pub mod outbox;
pub mod session;
pub mod subscriptions;

pub use broker::BrokerConnection;
pub use connection::{BrokerError, ConnectionState, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
pub use outbox::Outbox;
pub use session::{BrokerSession, SessionCommand, SessionEvent, SessionLink};
pub use subscriptions::{DedupeWindow, SubscriptionRegistry, DEDUPE_WINDOW};

/// Broker operations used by the bridge
///
/// Abstracts [`BrokerConnection`] so publishers and handlers can be tested
/// against scripted transports.
#[async_trait::async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Publish a message on a route; resolves once the broker acknowledges it
    async fn publish(&self, route: &Route, message: &Message) -> Result<(), BrokerError>;

    /// Deliver every frame arriving on `route` to `sender`, in broker order
    async fn subscribe(&self, route: &Route, sender: mpsc::Sender<Frame>)
        -> Result<(), BrokerError>;

    /// Current connection state
    fn connection_state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), ConnectionState::Connected)
    }
}
