//! A single physical session with the broker
//!
//! [`BrokerSession::open`] performs one connection attempt. The returned
//! [`SessionLink`] carries commands into the session and events out of it;
//! once the session dies it emits [`SessionEvent::Closed`] and every pending
//! acknowledgment sender is dropped. Reconnection is the caller's job.

use super::connection::BrokerError;
use crate::protocol::Frame;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

/// Result delivered to a publisher once the broker answers
pub type PublishAck = oneshot::Sender<Result<(), BrokerError>>;

/// Requests accepted by a live session
#[derive(Debug)]
pub enum SessionCommand {
    /// Publish a frame at least once; `ack` resolves on broker acknowledgment
    Publish { frame: Frame, ack: PublishAck },
    /// Subscribe to a topic filter; `ack` resolves on broker confirmation
    Subscribe {
        filter: String,
        ack: oneshot::Sender<Result<(), BrokerError>>,
    },
    /// Disconnect cleanly
    Close,
}

/// Notifications emitted by a live session, in broker order
#[derive(Debug)]
pub enum SessionEvent {
    Delivery(Frame),
    Closed { reason: String },
}

/// Handles to a freshly opened session
#[derive(Debug)]
pub struct SessionLink {
    pub commands: mpsc::Sender<SessionCommand>,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// Factory for broker sessions
#[async_trait]
pub trait BrokerSession: Send + Sync + 'static {
    /// Open one session
    ///
    /// Fails with [`BrokerError::AuthRejected`] when the broker refuses the
    /// credentials and [`BrokerError::ConnectionFailed`] for everything else.
    async fn open(&self) -> Result<SessionLink, BrokerError>;
}
