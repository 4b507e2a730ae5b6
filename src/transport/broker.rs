//! Logical broker connection with a reconnection supervisor
//!
//! [`BrokerConnection`] owns one session at a time. When the session dies the
//! supervisor moves the connection to `Reconnecting`, opens new sessions with
//! capped exponential backoff, re-establishes every subscription and flushes
//! publishes parked in the outbox, in order, before new ones go through.

use super::connection::{BrokerError, ConnectionState, ReconnectConfig};
use super::health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
use super::outbox::Outbox;
use super::session::{BrokerSession, PublishAck, SessionCommand, SessionEvent};
use super::subscriptions::SubscriptionRegistry;
use super::BrokerTransport;
use crate::observability::metrics::metrics;
use crate::protocol::{Frame, Message, Route};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// How long `close` waits for the supervisor before aborting it
const SUPERVISOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// A publish waiting for the session to come back
struct Parked {
    frame: Frame,
    ack: PublishAck,
}

/// Session command channel plus the outbox, guarded together so that parked
/// publishes are flushed before any new publish reaches a restored session.
struct Slot {
    commands: Option<mpsc::Sender<SessionCommand>>,
    outbox: Outbox<Parked>,
}

struct Inner<S> {
    session: S,
    reconnect: ReconnectConfig,
    slot: Mutex<Slot>,
    subscriptions: std::sync::Mutex<SubscriptionRegistry>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
    connect_time: std::sync::Mutex<Option<Instant>>,
    reconnect_count: AtomicU32,
}

/// Single logical connection to the on-premises broker
pub struct BrokerConnection<S: BrokerSession> {
    inner: Arc<Inner<S>>,
}

impl<S: BrokerSession> Clone for BrokerConnection<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<S: BrokerSession> BrokerConnection<S> {
    pub fn new(session: S, reconnect: ReconnectConfig, buffer_capacity: usize) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                session,
                reconnect,
                slot: Mutex::new(Slot {
                    commands: None,
                    outbox: Outbox::new(buffer_capacity),
                }),
                subscriptions: std::sync::Mutex::new(SubscriptionRegistry::new()),
                state_tx,
                shutdown_tx,
                supervisor: std::sync::Mutex::new(None),
                connect_time: std::sync::Mutex::new(None),
                reconnect_count: AtomicU32::new(0),
            }),
        }
    }

    /// Establish the first session and start the reconnection supervisor
    ///
    /// Returns once the broker has confirmed the session. A refused or
    /// unreachable endpoint leaves the connection `Disconnected`.
    pub async fn start(&self) -> Result<(), BrokerError> {
        {
            let _slot = self.inner.slot.lock().await;
            let state = self.connection_state();
            if state != ConnectionState::Disconnected {
                return Err(BrokerError::ConnectionFailed(format!(
                    "cannot start while {state}"
                )));
            }
            self.inner
                .set_state(HealthMonitor::determine_next_state(ConnectionEvent::ConnectStarted));
        }

        metrics().broker_connection_attempt();
        let link = match self.inner.session.open().await {
            Ok(link) => link,
            Err(e) => {
                metrics().broker_connection_failed();
                error!(error = %e, "Failed to connect to broker");
                self.inner.set_state(HealthMonitor::determine_next_state(
                    ConnectionEvent::ConnectFailed(e.to_string()),
                ));
                return Err(e);
            }
        };

        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        {
            let mut slot = self.inner.slot.lock().await;
            if *shutdown_rx.borrow() {
                let _ = link.commands.send(SessionCommand::Close).await;
                return Err(BrokerError::Closed);
            }
            let pending = self.inner.send_subscriptions(&link.commands).await;
            Inner::<S>::confirm_subscriptions(pending);
            slot.commands = Some(link.commands);
            *lock(&self.inner.connect_time) = Some(Instant::now());
            self.inner
                .set_state(HealthMonitor::determine_next_state(ConnectionEvent::SessionOpened));
        }
        metrics().broker_connection_established();

        let span = crate::broker_span!(role = "supervisor");
        let handle = tokio::spawn(
            Arc::clone(&self.inner)
                .supervise(link.events, shutdown_rx)
                .instrument(span),
        );
        *lock(&self.inner.supervisor) = Some(handle);
        Ok(())
    }

    /// Stop reconnecting, disconnect and drop anything still parked
    pub async fn close(&self) -> Result<(), BrokerError> {
        let _ = self.inner.shutdown_tx.send(true);

        {
            let mut slot = self.inner.slot.lock().await;
            if let Some(commands) = slot.commands.take() {
                let _ = commands.send(SessionCommand::Close).await;
            }
            let dropped = slot.outbox.clear();
            if dropped > 0 {
                warn!(dropped, "Discarding publishes buffered while reconnecting");
            }
            self.inner
                .set_state(HealthMonitor::determine_next_state(ConnectionEvent::CloseRequested));
        }

        let handle = lock(&self.inner.supervisor).take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            match tokio::time::timeout(SUPERVISOR_SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!("Broker supervisor shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Broker supervisor ended with error: {}", e),
                Err(_) => {
                    warn!("Broker supervisor didn't shut down gracefully, aborting");
                    abort.abort();
                }
                _ => {}
            }
        }

        info!("Broker connection closed");
        Ok(())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Watch state transitions
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        HealthMonitor::calculate_health_metrics(
            *lock(&self.inner.connect_time),
            self.inner.reconnect_count.load(Ordering::Relaxed),
            &self.connection_state(),
        )
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.subscriptions).len()
    }
}

impl<S: BrokerSession> Inner<S> {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next.clone());
        HealthMonitor::log_state_transition(&previous, &next);
    }

    /// Hand a frame to the live session, or park it while reconnecting
    async fn submit(
        &self,
        frame: Frame,
    ) -> Result<oneshot::Receiver<Result<(), BrokerError>>, BrokerError> {
        let (ack, ack_rx) = oneshot::channel();
        let mut slot = self.slot.lock().await;

        let state = self.state_tx.borrow().clone();
        match state {
            ConnectionState::Connected | ConnectionState::Reconnecting(_) => {}
            ConnectionState::Closed => return Err(BrokerError::Closed),
            other => return Err(BrokerError::NotConnected { state: other }),
        }

        let (frame, ack) = match slot.commands.clone() {
            Some(commands) if HealthMonitor::can_publish(&state) => {
                match commands.send(SessionCommand::Publish { frame, ack }).await {
                    Ok(()) => return Ok(ack_rx),
                    // Session task is gone; the supervisor will notice shortly
                    Err(mpsc::error::SendError(SessionCommand::Publish { frame, ack })) => {
                        (frame, ack)
                    }
                    Err(_) => return Err(BrokerError::Closed),
                }
            }
            _ => (frame, ack),
        };

        let capacity = slot.outbox.capacity();
        slot.outbox.push(Parked { frame, ack }).map_err(|_| {
            metrics().backpressure_rejected();
            BrokerError::Backpressure { capacity }
        })?;
        Ok(ack_rx)
    }

    async fn send_subscriptions(
        &self,
        commands: &mpsc::Sender<SessionCommand>,
    ) -> Vec<(String, oneshot::Receiver<Result<(), BrokerError>>)> {
        let filters = lock(&self.subscriptions).filters();
        let mut pending = Vec::with_capacity(filters.len());
        for filter in filters {
            let (ack, ack_rx) = oneshot::channel();
            let command = SessionCommand::Subscribe {
                filter: filter.clone(),
                ack,
            };
            if commands.send(command).await.is_err() {
                break;
            }
            pending.push((filter, ack_rx));
        }
        pending
    }

    /// Log subscription confirmations without holding up the supervisor
    fn confirm_subscriptions(pending: Vec<(String, oneshot::Receiver<Result<(), BrokerError>>)>) {
        if pending.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for (filter, ack_rx) in pending {
                match ack_rx.await {
                    Ok(Ok(())) => debug!(topic = %filter, "Subscription confirmed"),
                    Ok(Err(e)) => error!(topic = %filter, error = %e, "Re-subscription failed"),
                    Err(_) => debug!(topic = %filter, "Session ended before subscription was confirmed"),
                }
            }
        });
    }

    async fn supervise(
        self: Arc<Self>,
        mut events: mpsc::Receiver<SessionEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Starting broker supervisor");
        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping broker supervisor");
                        break;
                    }
                }

                event = events.recv() => {
                    let reason = match event {
                        Some(SessionEvent::Delivery(frame)) => {
                            self.dispatch(frame).await;
                            continue;
                        }
                        Some(SessionEvent::Closed { reason }) => reason,
                        None => "session event stream ended".to_string(),
                    };

                    match self.reconnect(reason, shutdown_rx.clone()).await {
                        Some(next_events) => events = next_events,
                        None => break,
                    }
                }
            }
        }
        info!("Broker supervisor stopped");
    }

    /// Deliver an inbound frame to every matching subscription, in arrival order
    async fn dispatch(&self, frame: Frame) {
        let routed = lock(&self.subscriptions).route(&frame);
        for _ in 0..routed.duplicates {
            metrics().redelivery_dropped();
        }
        if routed.targets.is_empty() && routed.duplicates == 0 {
            debug!(topic = %frame.topic, "No subscriber for inbound frame");
        }
        for target in routed.targets {
            if target.send(frame.clone()).await.is_err() {
                debug!(topic = %frame.topic, "Subscriber went away");
            }
        }
    }

    /// Reconnect until a session is restored, shutdown is requested or the
    /// broker keeps rejecting our credentials
    async fn reconnect(
        &self,
        reason: String,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Option<mpsc::Receiver<SessionEvent>> {
        {
            let mut slot = self.slot.lock().await;
            slot.commands = None;
            if *shutdown_rx.borrow() {
                return None;
            }
            self.set_state(HealthMonitor::determine_next_state(ConnectionEvent::SessionLost(
                reason.clone(),
            )));
        }
        metrics().broker_connection_lost();
        warn!(reason = %reason, "Broker session lost");

        let mut attempts = 0u32;
        let mut auth_failures = 0u32;
        loop {
            let decision = HealthMonitor::should_attempt_reconnection(
                attempts,
                auth_failures,
                &self.reconnect,
                *shutdown_rx.borrow(),
            );

            match decision {
                ReconnectionDecision::Proceed { attempt, delay_ms } => {
                    attempts = attempt;
                    self.set_state(HealthMonitor::determine_next_state(
                        ConnectionEvent::ReconnectionStarted(attempt),
                    ));
                    info!(attempt, delay_ms, "Attempting broker reconnection");

                    if !interruptible_sleep(shutdown_rx.clone(), delay_ms).await {
                        return None;
                    }

                    metrics().broker_connection_attempt();
                    match self.session.open().await {
                        Ok(link) => {
                            if self.restore(link.commands, &shutdown_rx).await {
                                return Some(link.events);
                            }
                        }
                        Err(e) if e.is_auth() => {
                            auth_failures += 1;
                            metrics().broker_connection_failed();
                            warn!(
                                failures = auth_failures,
                                limit = self.reconnect.max_auth_failures,
                                "Broker rejected credentials during reconnection"
                            );
                        }
                        Err(e) => {
                            auth_failures = 0;
                            metrics().broker_connection_failed();
                            warn!(attempt, error = %e, "Broker reconnection attempt failed");
                        }
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => {
                    info!("Shutdown signal received, stopping reconnection");
                    return None;
                }
                ReconnectionDecision::AbortAuthRejected { failures } => {
                    error!(
                        alert = true,
                        failures,
                        "Broker keeps rejecting credentials, giving up reconnection"
                    );
                    let mut slot = self.slot.lock().await;
                    let dropped = slot.outbox.clear();
                    if dropped > 0 {
                        warn!(dropped, "Discarding publishes buffered while reconnecting");
                    }
                    self.set_state(HealthMonitor::determine_next_state(
                        ConnectionEvent::AuthEscalated(format!("{failures} auth rejections")),
                    ));
                    return None;
                }
            }
        }
    }

    /// Re-subscribe and flush the outbox on a fresh session
    ///
    /// Returns false if the session died before it could be installed.
    async fn restore(
        &self,
        commands: mpsc::Sender<SessionCommand>,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> bool {
        let mut slot = self.slot.lock().await;
        if *shutdown_rx.borrow() {
            let _ = commands.send(SessionCommand::Close).await;
            return false;
        }

        let pending = self.send_subscriptions(&commands).await;
        let resubscribed = pending.len();
        Self::confirm_subscriptions(pending);

        let mut flushed = 0usize;
        while let Some(parked) = slot.outbox.pop_front() {
            let command = SessionCommand::Publish {
                frame: parked.frame,
                ack: parked.ack,
            };
            match commands.send(command).await {
                Ok(()) => flushed += 1,
                Err(mpsc::error::SendError(SessionCommand::Publish { frame, ack })) => {
                    slot.outbox.push_front(Parked { frame, ack });
                    return false;
                }
                Err(_) => return false,
            }
        }

        slot.commands = Some(commands);
        *lock(&self.connect_time) = Some(Instant::now());
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
        self.set_state(HealthMonitor::determine_next_state(ConnectionEvent::SessionOpened));
        metrics().broker_connection_established();
        info!(
            subscriptions = resubscribed,
            flushed, "Broker session restored"
        );
        true
    }
}

/// Sleep unless shutdown is requested first; returns false on shutdown
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!("Shutdown signal received during reconnection delay, stopping");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

#[async_trait]
impl<S: BrokerSession> BrokerTransport for BrokerConnection<S> {
    /// Publish at least once
    ///
    /// If the session dies before the broker acknowledges the frame, the same
    /// frame (same message id) is submitted again on the next session.
    async fn publish(&self, route: &Route, message: &Message) -> Result<(), BrokerError> {
        let frame = Frame::encode(route, message)
            .map_err(|e| BrokerError::PublishFailed(format!("serialization error: {e}")))?;

        loop {
            let ack_rx = match self.inner.submit(frame.clone()).await {
                Ok(ack_rx) => ack_rx,
                Err(e) => {
                    metrics().publish_failed();
                    return Err(e);
                }
            };

            match ack_rx.await {
                Ok(Ok(())) => {
                    metrics().message_published();
                    debug!(topic = %route.topic, message_id = %message.id, "Published");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    metrics().publish_failed();
                    return Err(e);
                }
                Err(_) => {
                    debug!(
                        topic = %route.topic,
                        message_id = %message.id,
                        "Session lost before acknowledgment, re-submitting"
                    );
                }
            }
        }
    }

    async fn subscribe(&self, route: &Route, sender: mpsc::Sender<Frame>) -> Result<(), BrokerError> {
        match self.connection_state() {
            ConnectionState::Connected | ConnectionState::Reconnecting(_) => {}
            ConnectionState::Closed => return Err(BrokerError::Closed),
            state => return Err(BrokerError::NotConnected { state }),
        }

        lock(&self.inner.subscriptions).register(&route.topic, sender);

        let commands = self.inner.slot.lock().await.commands.clone();
        let Some(commands) = commands else {
            debug!(topic = %route.topic, "Subscription registered, will be established on reconnect");
            return Ok(());
        };

        let (ack, ack_rx) = oneshot::channel();
        let command = SessionCommand::Subscribe {
            filter: route.topic.clone(),
            ack,
        };
        if commands.send(command).await.is_err() {
            return Ok(());
        }

        match ack_rx.await {
            Ok(Ok(())) => {
                info!(route = %route.name, topic = %route.topic, "Subscribed");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            // Session lost mid-subscribe; restored with the others on reconnect
            Err(_) => Ok(()),
        }
    }

    fn connection_state(&self) -> ConnectionState {
        BrokerConnection::connection_state(self)
    }
}
