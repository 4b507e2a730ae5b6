//! MQTT v5 implementation of [`BrokerSession`]
//!
//! Each `open` creates a fresh rumqttc client and event loop, waits for the
//! ConnAck and then runs two tasks: one forwarding commands into the client,
//! one polling the event loop. Acknowledgments are matched to requests through
//! packet ids announced by outgoing events, which rumqttc emits in request
//! order.

use super::event_router::{
    classify_connection_error, publish_properties, rejected_publish, route_mqtt_event, EventRoute,
};
use super::options::configure_mqtt_options;
use crate::config::BrokerSection;
use crate::transport::connection::BrokerError;
use crate::transport::session::{
    BrokerSession, PublishAck, SessionCommand, SessionEvent, SessionLink,
};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop, StateError};
use rumqttc::Outgoing;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

/// Time allowed for the broker to answer CONNECT
pub const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for the DISCONNECT to go out when closing
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

type SubscribeAck = oneshot::Sender<Result<(), BrokerError>>;

/// Acknowledgment senders waiting for their packet id or their ack
#[derive(Default)]
struct PendingAcks {
    queued_publishes: VecDeque<PublishAck>,
    /// In send order; brokers acknowledge QoS 1 publishes in this order
    inflight_publishes: VecDeque<(u16, PublishAck)>,
    queued_subscribes: VecDeque<(String, SubscribeAck)>,
    inflight_subscribes: HashMap<u16, (String, SubscribeAck)>,
}

impl PendingAcks {
    fn publish_sent(&mut self, pkid: u16) {
        if let Some(ack) = self.queued_publishes.pop_front() {
            self.inflight_publishes.push_back((pkid, ack));
        }
    }

    fn publish_acknowledged(&mut self, pkid: u16, result: Result<(), BrokerError>) {
        match self.inflight_publishes.iter().position(|(id, _)| *id == pkid) {
            Some(index) => {
                if let Some((_, ack)) = self.inflight_publishes.remove(index) {
                    let _ = ack.send(result);
                }
            }
            None => debug!(pkid, "Acknowledgment for unknown publish"),
        }
    }

    fn subscribe_sent(&mut self, pkid: u16) {
        if let Some(entry) = self.queued_subscribes.pop_front() {
            self.inflight_subscribes.insert(pkid, entry);
        }
    }

    fn subscription_confirmed(&mut self, pkid: u16, result: Result<(), String>) {
        if let Some((filter, ack)) = self.inflight_subscribes.remove(&pkid) {
            let _ = ack.send(result.map_err(|reason| BrokerError::SubscriptionFailed {
                topic: filter,
                reason,
            }));
        }
    }

    /// Answer the oldest unacknowledged publish with `error`
    ///
    /// Later publishes stay pending; the session teardown drops them so the
    /// connection re-submits them on the next session.
    fn reject_oldest_publish(&mut self, error: BrokerError) {
        if let Some((pkid, ack)) = self.inflight_publishes.pop_front() {
            debug!(pkid, error = %error, "Publish rejected by broker");
            let _ = ack.send(Err(error));
        }
    }

    fn fail_inflight_subscribes(&mut self, reason: &str) {
        for (_, (filter, ack)) in self.inflight_subscribes.drain() {
            let _ = ack.send(Err(BrokerError::SubscriptionFailed {
                topic: filter,
                reason: reason.to_string(),
            }));
        }
    }
}

fn lock(pending: &Mutex<PendingAcks>) -> MutexGuard<'_, PendingAcks> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Opens MQTT v5 sessions to the configured broker
#[derive(Debug, Clone)]
pub struct MqttSession {
    gateway_id: String,
    config: BrokerSection,
    channel_capacity: usize,
}

impl MqttSession {
    pub fn new(gateway_id: &str, config: BrokerSection) -> Self {
        Self {
            gateway_id: gateway_id.to_string(),
            channel_capacity: config.buffer_capacity.max(16),
            config,
        }
    }

    /// Poll until the broker confirms the session or refuses it
    async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), BrokerError> {
        let result = tokio::time::timeout(CONNACK_TIMEOUT, async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(other) => trace!("MQTT event before ConnAck: {:?}", other),
                    Err(e) => return Err(classify_connection_error(&e)),
                }
            }
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(BrokerError::ConnectionFailed(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn open(&self) -> Result<SessionLink, BrokerError> {
        let options = configure_mqtt_options(&self.gateway_id, &self.config)?;
        let (client, mut event_loop) = AsyncClient::new(options, self.channel_capacity);

        Self::wait_for_connack(&mut event_loop).await?;
        info!(broker = %self.config.broker_url, "MQTT session established");

        let pending = Arc::new(Mutex::new(PendingAcks::default()));
        let (commands_tx, commands_rx) = mpsc::channel(self.channel_capacity);
        let (events_tx, events_rx) = mpsc::channel(self.channel_capacity);
        let (closing_tx, closing_rx) = oneshot::channel();
        let (dead_tx, dead_rx) = watch::channel(false);

        tokio::spawn(run_commands(
            client,
            commands_rx,
            Arc::clone(&pending),
            closing_tx,
            dead_rx,
        ));
        tokio::spawn(run_events(event_loop, events_tx, pending, closing_rx, dead_tx));

        Ok(SessionLink {
            commands: commands_tx,
            events: events_rx,
        })
    }
}

/// Forward session commands into the rumqttc client
async fn run_commands(
    client: AsyncClient,
    mut commands: mpsc::Receiver<SessionCommand>,
    pending: Arc<Mutex<PendingAcks>>,
    _closing: oneshot::Sender<()>,
    mut dead: watch::Receiver<bool>,
) {
    loop {
        let command = tokio::select! {
            _ = dead.changed() => break,
            command = commands.recv() => command,
        };

        match command {
            Some(SessionCommand::Publish { frame, ack }) => {
                let properties = publish_properties(&frame);
                lock(&pending).queued_publishes.push_back(ack);
                let sent = client
                    .publish_with_properties(
                        frame.topic.clone(),
                        QoS::AtLeastOnce,
                        false,
                        frame.body.clone(),
                        properties,
                    )
                    .await;
                if let Err(e) = sent {
                    if let Some(ack) = lock(&pending).queued_publishes.pop_back() {
                        let _ = ack.send(Err(BrokerError::PublishFailed(e.to_string())));
                    }
                }
            }
            Some(SessionCommand::Subscribe { filter, ack }) => {
                lock(&pending)
                    .queued_subscribes
                    .push_back((filter.clone(), ack));
                if let Err(e) = client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
                    if let Some((topic, ack)) = lock(&pending).queued_subscribes.pop_back() {
                        let _ = ack.send(Err(BrokerError::SubscriptionFailed {
                            topic,
                            reason: e.to_string(),
                        }));
                    }
                }
            }
            Some(SessionCommand::Close) | None => {
                if let Err(e) = client.disconnect().await {
                    debug!("MQTT disconnect request failed: {}", e);
                }
                break;
            }
        }
    }
    // Dropping `_closing` tells the event task to wind down
}

/// Poll the event loop until the session ends
async fn run_events(
    mut event_loop: EventLoop,
    events: mpsc::Sender<SessionEvent>,
    pending: Arc<Mutex<PendingAcks>>,
    mut closing: oneshot::Receiver<()>,
    dead: watch::Sender<bool>,
) {
    let reason = loop {
        tokio::select! {
            _ = &mut closing => {
                flush_disconnect(&mut event_loop).await;
                break "closed by gateway".to_string();
            }
            polled = event_loop.poll() => match polled {
                Ok(event) => match route_mqtt_event(&event) {
                    EventRoute::MessageReceived(frame) => {
                        trace!(topic = %frame.topic, "MQTT message received");
                        if events.send(SessionEvent::Delivery(frame)).await.is_err() {
                            break "event receiver dropped".to_string();
                        }
                    }
                    EventRoute::PublishSent(pkid) => lock(&pending).publish_sent(pkid),
                    EventRoute::PublishAcknowledged { pkid, result } => {
                        lock(&pending).publish_acknowledged(pkid, result)
                    }
                    EventRoute::SubscribeSent(pkid) => lock(&pending).subscribe_sent(pkid),
                    EventRoute::SubscriptionConfirmed { pkid, result } => {
                        lock(&pending).subscription_confirmed(pkid, result)
                    }
                    EventRoute::Disconnected(reason) => break reason,
                    EventRoute::ConnectionAcknowledged => debug!("Unexpected ConnAck mid-session"),
                    EventRoute::InfrastructureEvent(event) => trace!("MQTT event: {}", event),
                    EventRoute::OutgoingEvent => {}
                },
                Err(e) => {
                    record_session_error(&pending, &e);
                    break e.to_string();
                }
            }
        }
    };

    let _ = dead.send(true);
    {
        // Unanswered acknowledgments are dropped so publishers re-submit
        let mut pending = lock(&pending);
        pending.queued_publishes.clear();
        pending.inflight_publishes.clear();
        pending.queued_subscribes.clear();
        pending.inflight_subscribes.clear();
    }
    warn!(reason = %reason, "MQTT session ended");
    let _ = events.send(SessionEvent::Closed { reason }).await;
}

/// Answer requests that rumqttc rejected by tearing down the session
///
/// rumqttc ends the session on a non-success PubAck without naming the
/// packet id, so a stale token always costs a session cycle. Brokers
/// acknowledge QoS 1 publishes in the order received, which makes the oldest
/// in-flight publish the rejected one.
fn record_session_error(pending: &Mutex<PendingAcks>, error: &ConnectionError) {
    if let Some(rejection) = rejected_publish(error) {
        lock(pending).reject_oldest_publish(rejection);
    }
    if let ConnectionError::MqttState(StateError::SubFail { reason }) = error {
        lock(pending).fail_inflight_subscribes(&format!("{reason:?}"));
    }
}

async fn flush_disconnect(event_loop: &mut EventLoop) {
    let _ = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::PubAckReason;

    #[tokio::test]
    async fn test_pending_acks_match_packet_ids_in_order() {
        let mut pending = PendingAcks::default();
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        pending.queued_publishes.push_back(first_tx);
        pending.queued_publishes.push_back(second_tx);

        pending.publish_sent(1);
        pending.publish_sent(2);
        pending.publish_acknowledged(2, Err(BrokerError::TokenRejected));
        pending.publish_acknowledged(1, Ok(()));

        assert_eq!(first_rx.await.unwrap(), Ok(()));
        assert_eq!(second_rx.await.unwrap(), Err(BrokerError::TokenRejected));
    }

    #[tokio::test]
    async fn test_subscription_failure_reports_topic() {
        let mut pending = PendingAcks::default();
        let (tx, rx) = oneshot::channel();
        pending.queued_subscribes.push_back(("a/b".to_string(), tx));
        pending.subscribe_sent(9);
        pending.subscription_confirmed(9, Err("NotAuthorized".to_string()));

        assert_eq!(
            rx.await.unwrap(),
            Err(BrokerError::SubscriptionFailed {
                topic: "a/b".to_string(),
                reason: "NotAuthorized".to_string(),
            })
        );
    }

    fn two_inflight_publishes() -> (
        Mutex<PendingAcks>,
        oneshot::Receiver<Result<(), BrokerError>>,
        oneshot::Receiver<Result<(), BrokerError>>,
    ) {
        let mut pending = PendingAcks::default();
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        pending.queued_publishes.push_back(first_tx);
        pending.queued_publishes.push_back(second_tx);
        pending.publish_sent(7);
        pending.publish_sent(3);
        (Mutex::new(pending), first_rx, second_rx)
    }

    #[tokio::test]
    async fn test_stale_token_rejects_only_oldest_inflight_publish() {
        let (pending, first_rx, mut second_rx) = two_inflight_publishes();
        let error = ConnectionError::MqttState(StateError::PubAckFail {
            reason: PubAckReason::NotAuthorized,
        });

        record_session_error(&pending, &error);

        assert_eq!(first_rx.await.unwrap(), Err(BrokerError::TokenRejected));
        assert!(second_rx.try_recv().is_err());
        assert_eq!(lock(&pending).inflight_publishes.len(), 1);

        // Teardown drops the rest so the connection re-submits them
        lock(&pending).inflight_publishes.clear();
        assert!(second_rx.await.is_err());
    }

    #[tokio::test]
    async fn test_broker_nack_becomes_publish_failure() {
        let (pending, first_rx, _second_rx) = two_inflight_publishes();
        let error = ConnectionError::MqttState(StateError::PubAckFail {
            reason: PubAckReason::QuotaExceeded,
        });

        record_session_error(&pending, &error);

        assert!(matches!(
            first_rx.await.unwrap(),
            Err(BrokerError::PublishFailed(_))
        ));
    }

    #[test]
    fn test_unrelated_session_error_leaves_publishes_pending() {
        let (pending, mut first_rx, _second_rx) = two_inflight_publishes();

        record_session_error(&pending, &ConnectionError::RequestsDone);

        assert!(first_rx.try_recv().is_err());
        assert_eq!(lock(&pending).inflight_publishes.len(), 2);
    }

    #[tokio::test]
    async fn test_open_unreachable_broker_fails() {
        let config = BrokerSection {
            broker_url: "mqtt://127.0.0.1:1".to_string(),
            username_env: None,
            password_env: None,
            token_env: Some("FOG_TOKEN".to_string()),
            token_file: None,
            token_ttl_secs: None,
            buffer_capacity: 16,
            keep_alive_secs: 5,
            reconnect: Default::default(),
        };
        let session = MqttSession::new("gw", config);
        assert!(matches!(
            session.open().await,
            Err(BrokerError::ConnectionFailed(_))
        ));
    }
}
