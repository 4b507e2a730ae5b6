//! In-memory doubles for the broker, the cloud platform and token sources
//!
//! - [`MockTransport`]: a [`BrokerTransport`] that records frames and lets
//!   tests script failures and push inbound deliveries.
//! - [`LoopbackBroker`]: a [`BrokerSession`] factory for driving a real
//!   [`crate::transport::BrokerConnection`] through drops, outages and auth
//!   rejections.
//! - [`MockCloudConnector`]: a [`CloudConnector`] with scripted events and
//!   failures plus a call log.
//! - [`SequenceTokenProvider`]: hands out a fixed sequence of tokens.

use crate::auth::{Token, TokenError, TokenProvider};
use crate::cloud::{CloudConnector, CloudError, CloudEvent};
use crate::protocol::{
    topic_matches, DeviceCommand, DeviceRecord, Frame, Message, Route, JSON_CONTENT_TYPE,
    MESSAGE_ID_HEADER,
};
use crate::transport::{
    BrokerError, BrokerSession, BrokerTransport, ConnectionState, SessionCommand, SessionEvent,
    SessionLink,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Build an inbound frame with a fresh message id
pub fn inbound_frame(topic: &str, payload: Value) -> Frame {
    inbound_frame_with_id(topic, payload, Uuid::new_v4())
}

/// Build an inbound frame carrying a given message id
pub fn inbound_frame_with_id(topic: &str, payload: Value, id: Uuid) -> Frame {
    Frame {
        topic: topic.to_string(),
        body: Bytes::from(serde_json::to_vec(&payload).unwrap_or_default()),
        content_type: Some(JSON_CONTENT_TYPE.to_string()),
        correlation_id: None,
        headers: vec![(MESSAGE_ID_HEADER.to_string(), id.to_string())],
    }
}

/// Scripted broker transport
#[derive(Debug)]
pub struct MockTransport {
    state: Mutex<ConnectionState>,
    published: Mutex<Vec<Frame>>,
    attempts: AtomicUsize,
    rejected_tokens: Mutex<HashSet<String>>,
    failures: Mutex<VecDeque<BrokerError>>,
    device_delays: Mutex<HashMap<String, Duration>>,
    subscribers: Mutex<Vec<(Route, mpsc::Sender<Frame>)>>,
    subscribe_error: Mutex<Option<BrokerError>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Connected),
            published: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            rejected_tokens: Mutex::new(HashSet::new()),
            failures: Mutex::new(VecDeque::new()),
            device_delays: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            subscribe_error: Mutex::new(None),
        }
    }

    /// Frames acknowledged so far, in acknowledgment order
    pub fn published_frames(&self) -> Vec<Frame> {
        lock(&self.published).clone()
    }

    /// Acknowledged frames decoded as JSON
    pub fn published_bodies(&self) -> Vec<(String, Value)> {
        self.published_frames()
            .into_iter()
            .map(|frame| {
                let body = serde_json::from_slice(&frame.body).unwrap_or(Value::Null);
                (frame.topic, body)
            })
            .collect()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Value> {
        self.published_bodies()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, body)| body)
            .collect()
    }

    /// Publish calls, including rejected ones
    pub fn publish_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Answer publishes stamped with any of these tokens with `TokenRejected`
    pub fn reject_tokens<I, S>(&self, tokens: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.rejected_tokens).extend(tokens.into_iter().map(Into::into));
    }

    /// Fail the next publish with `error`; queued failures apply in order
    pub fn fail_next_publish(&self, error: BrokerError) {
        lock(&self.failures).push_back(error);
    }

    /// Hold publishes for `device_id` before acknowledging them
    pub fn delay_device(&self, device_id: &str, delay: Duration) {
        lock(&self.device_delays).insert(device_id.to_string(), delay);
    }

    pub fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    pub fn fail_subscribe(&self, error: BrokerError) {
        *lock(&self.subscribe_error) = Some(error);
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        lock(&self.subscribers)
            .iter()
            .map(|(route, _)| route.topic.clone())
            .collect()
    }

    /// Push a frame to every subscriber whose filter matches its topic;
    /// returns how many received it
    pub async fn deliver(&self, frame: Frame) -> usize {
        let targets: Vec<mpsc::Sender<Frame>> = lock(&self.subscribers)
            .iter()
            .filter(|(route, _)| topic_matches(&route.topic, &frame.topic))
            .map(|(_, sender)| sender.clone())
            .collect();

        let mut delivered = 0;
        for target in targets {
            if target.send(frame.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn publish(&self, route: &Route, message: &Message) -> Result<(), BrokerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }
        match self.connection_state() {
            ConnectionState::Connected => {}
            ConnectionState::Closed => return Err(BrokerError::Closed),
            state => return Err(BrokerError::NotConnected { state }),
        }
        if let Some(token) = &message.token {
            if lock(&self.rejected_tokens).contains(token) {
                return Err(BrokerError::TokenRejected);
            }
        }

        let frame = Frame::encode(route, message)
            .map_err(|e| BrokerError::PublishFailed(e.to_string()))?;
        let delay = lock(&self.device_delays).get(&message.device_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.published).push(frame);
        Ok(())
    }

    async fn subscribe(&self, route: &Route, sender: mpsc::Sender<Frame>) -> Result<(), BrokerError> {
        if let Some(error) = lock(&self.subscribe_error).clone() {
            return Err(error);
        }
        lock(&self.subscribers).push((route.clone(), sender));
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        lock(&self.state).clone()
    }
}

/// A session currently open on the loopback broker
struct LiveSession {
    events: mpsc::Sender<SessionEvent>,
    filters: Arc<Mutex<Vec<String>>>,
    kill: Option<oneshot::Sender<String>>,
}

#[derive(Default)]
struct LoopbackShared {
    offline: AtomicBool,
    reject_auth: AtomicBool,
    hold_acks: AtomicBool,
    opens: AtomicUsize,
    subscribes: AtomicUsize,
    rejected_tokens: Mutex<HashSet<String>>,
    published: Mutex<Vec<Frame>>,
    live: Mutex<Option<LiveSession>>,
}

/// In-memory broker that hands out loopback sessions
///
/// Publishes are acknowledged and echoed back to the same session when one of
/// its subscriptions matches. Clones share the same broker.
#[derive(Clone, Default)]
pub struct LoopbackBroker {
    shared: Arc<LoopbackShared>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse new sessions as unreachable
    pub fn set_online(&self, online: bool) {
        self.shared.offline.store(!online, Ordering::SeqCst);
    }

    /// Refuse new sessions with an auth rejection
    pub fn set_reject_auth(&self, reject: bool) {
        self.shared.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Keep publishes unacknowledged until the session dies
    pub fn hold_acks(&self, hold: bool) {
        self.shared.hold_acks.store(hold, Ordering::SeqCst);
    }

    pub fn reject_tokens<I, S>(&self, tokens: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.shared.rejected_tokens).extend(tokens.into_iter().map(Into::into));
    }

    /// Kill the current session as if the socket closed
    pub fn drop_session(&self) -> bool {
        let kill = lock(&self.shared.live)
            .take()
            .and_then(|mut live| live.kill.take());
        match kill {
            Some(kill) => kill.send("connection reset".to_string()).is_ok(),
            None => false,
        }
    }

    /// Deliver a frame from another client to the current session
    pub async fn inject(&self, frame: Frame) -> bool {
        let events = {
            let live = lock(&self.shared.live);
            match live.as_ref() {
                Some(live)
                    if lock(&live.filters)
                        .iter()
                        .any(|filter| topic_matches(filter, &frame.topic)) =>
                {
                    live.events.clone()
                }
                _ => return false,
            }
        };
        events.send(SessionEvent::Delivery(frame)).await.is_ok()
    }

    /// Frames acknowledged by the broker, in order
    pub fn published(&self) -> Vec<Frame> {
        lock(&self.shared.published).clone()
    }

    /// Sessions opened so far
    pub fn opens(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Subscribe commands received across all sessions
    pub fn subscribes(&self) -> usize {
        self.shared.subscribes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerSession for LoopbackBroker {
    async fn open(&self) -> Result<SessionLink, BrokerError> {
        if self.shared.offline.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionFailed("connection refused".to_string()));
        }
        if self.shared.reject_auth.load(Ordering::SeqCst) {
            return Err(BrokerError::AuthRejected("not authorized".to_string()));
        }

        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (kill_tx, kill_rx) = oneshot::channel();
        let filters = Arc::new(Mutex::new(Vec::new()));

        *lock(&self.shared.live) = Some(LiveSession {
            events: event_tx.clone(),
            filters: Arc::clone(&filters),
            kill: Some(kill_tx),
        });
        self.shared.opens.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(run_loopback_session(
            Arc::clone(&self.shared),
            command_rx,
            event_tx,
            kill_rx,
            filters,
        ));

        Ok(SessionLink {
            commands: command_tx,
            events: event_rx,
        })
    }
}

async fn run_loopback_session(
    shared: Arc<LoopbackShared>,
    mut commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::Sender<SessionEvent>,
    mut kill: oneshot::Receiver<String>,
    filters: Arc<Mutex<Vec<String>>>,
) {
    // Unacknowledged publishes; dropped with the session
    let mut held = Vec::new();

    loop {
        tokio::select! {
            reason = &mut kill => {
                let reason = reason.unwrap_or_else(|_| "session dropped".to_string());
                let _ = events.send(SessionEvent::Closed { reason }).await;
                break;
            }

            command = commands.recv() => match command {
                Some(SessionCommand::Publish { frame, ack }) => {
                    let rejected = frame
                        .token()
                        .is_some_and(|token| lock(&shared.rejected_tokens).contains(token));
                    if rejected {
                        let _ = ack.send(Err(BrokerError::TokenRejected));
                        continue;
                    }
                    if shared.hold_acks.load(Ordering::SeqCst) {
                        held.push(ack);
                        continue;
                    }

                    lock(&shared.published).push(frame.clone());
                    let _ = ack.send(Ok(()));

                    let echo = lock(&filters)
                        .iter()
                        .any(|filter| topic_matches(filter, &frame.topic));
                    if echo {
                        let _ = events.send(SessionEvent::Delivery(frame)).await;
                    }
                }
                Some(SessionCommand::Subscribe { filter, ack }) => {
                    shared.subscribes.fetch_add(1, Ordering::SeqCst);
                    let mut filters = lock(&filters);
                    if !filters.contains(&filter) {
                        filters.push(filter);
                    }
                    let _ = ack.send(Ok(()));
                }
                Some(SessionCommand::Close) | None => break,
            }
        }
    }

    drop(held);
}

/// A call received by [`MockCloudConnector`]
#[derive(Debug, Clone, PartialEq)]
pub enum CloudCall {
    ListDevices,
    SendCommand {
        device_id: String,
        command: DeviceCommand,
    },
    UpdateState {
        device_id: String,
        state: Value,
    },
}

impl CloudCall {
    pub fn device_id(&self) -> Option<&str> {
        match self {
            CloudCall::ListDevices => None,
            CloudCall::SendCommand { device_id, .. } | CloudCall::UpdateState { device_id, .. } => {
                Some(device_id)
            }
        }
    }
}

/// Scripted cloud platform
pub struct MockCloudConnector {
    devices: Mutex<Vec<DeviceRecord>>,
    events_tx: mpsc::Sender<CloudEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<CloudEvent>>>,
    connected: AtomicBool,
    connect_on_start: AtomicBool,
    start_error: Mutex<Option<CloudError>>,
    list_failures: Mutex<VecDeque<CloudError>>,
    command_failures: Mutex<VecDeque<CloudError>>,
    failing_devices: Mutex<HashMap<String, CloudError>>,
    device_delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<CloudCall>>,
    stops: AtomicUsize,
}

impl Default for MockCloudConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCloudConnector {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            devices: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            connected: AtomicBool::new(false),
            connect_on_start: AtomicBool::new(true),
            start_error: Mutex::new(None),
            list_failures: Mutex::new(VecDeque::new()),
            command_failures: Mutex::new(VecDeque::new()),
            failing_devices: Mutex::new(HashMap::new()),
            device_delays: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        }
    }

    /// Connector whose inventory holds the given device ids
    pub fn with_devices<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let connector = Self::new();
        connector.set_devices(ids.into_iter().map(DeviceRecord::new).collect());
        connector
    }

    pub fn set_devices(&self, devices: Vec<DeviceRecord>) {
        *lock(&self.devices) = devices;
    }

    /// Don't emit `Connected` from `start`; tests emit it themselves
    pub fn stay_offline_on_start(&self) {
        self.connect_on_start.store(false, Ordering::SeqCst);
    }

    pub fn fail_start(&self, error: CloudError) {
        *lock(&self.start_error) = Some(error);
    }

    /// Fail the next inventory read
    pub fn fail_next_list(&self, error: CloudError) {
        lock(&self.list_failures).push_back(error);
    }

    /// Fail the next command or state update, whatever its device
    pub fn fail_next_command(&self, error: CloudError) {
        lock(&self.command_failures).push_back(error);
    }

    /// Fail every command and state update for `device_id`
    pub fn fail_device(&self, device_id: &str, error: CloudError) {
        lock(&self.failing_devices).insert(device_id.to_string(), error);
    }

    /// Slow down commands and state updates for `device_id`
    pub fn delay_device(&self, device_id: &str, delay: Duration) {
        lock(&self.device_delays).insert(device_id.to_string(), delay);
    }

    /// Emit an event on the connector's stream
    pub async fn emit(&self, event: CloudEvent) {
        match &event {
            CloudEvent::Connected => self.connected.store(true, Ordering::SeqCst),
            CloudEvent::Disconnected { .. } => self.connected.store(false, Ordering::SeqCst),
            _ => {}
        }
        let _ = self.events_tx.send(event).await;
    }

    pub fn calls(&self) -> Vec<CloudCall> {
        lock(&self.calls).clone()
    }

    /// Command and state calls for one device, in call order
    pub fn calls_for(&self, device_id: &str) -> Vec<CloudCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.device_id() == Some(device_id))
            .collect()
    }

    pub fn list_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, CloudCall::ListDevices))
            .count()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    async fn device_call(&self, call: CloudCall) -> Result<(), CloudError> {
        let device_id = call.device_id().unwrap_or_default().to_string();
        lock(&self.calls).push(call);

        let delay = lock(&self.device_delays).get(&device_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = lock(&self.command_failures).pop_front() {
            return Err(error);
        }
        if let Some(error) = lock(&self.failing_devices).get(&device_id).cloned() {
            return Err(error);
        }
        Ok(())
    }
}

#[async_trait]
impl CloudConnector for MockCloudConnector {
    fn name(&self) -> &str {
        "mock"
    }

    async fn start(&self) -> Result<(), CloudError> {
        if let Some(error) = lock(&self.start_error).clone() {
            return Err(error);
        }
        if self.connect_on_start.load(Ordering::SeqCst) {
            self.emit(CloudEvent::Connected).await;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), CloudError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, CloudError> {
        lock(&self.calls).push(CloudCall::ListDevices);
        if let Some(error) = lock(&self.list_failures).pop_front() {
            return Err(error);
        }
        Ok(lock(&self.devices).clone())
    }

    async fn send_command(
        &self,
        device_id: &str,
        command: &DeviceCommand,
    ) -> Result<(), CloudError> {
        self.device_call(CloudCall::SendCommand {
            device_id: device_id.to_string(),
            command: command.clone(),
        })
        .await
    }

    async fn update_state(&self, device_id: &str, state: &Value) -> Result<(), CloudError> {
        self.device_call(CloudCall::UpdateState {
            device_id: device_id.to_string(),
            state: state.clone(),
        })
        .await
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<CloudEvent>, CloudError> {
        lock(&self.events_rx).take().ok_or(CloudError::EventsTaken)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Token provider that walks through a fixed list, then repeats the last one
#[derive(Debug)]
pub struct SequenceTokenProvider {
    tokens: Vec<String>,
    fetches: AtomicUsize,
}

impl SequenceTokenProvider {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for SequenceTokenProvider {
    fn name(&self) -> &str {
        "sequence"
    }

    async fn fetch(&self) -> Result<Token, TokenError> {
        let index = self.fetches.fetch_add(1, Ordering::SeqCst);
        let value = self
            .tokens
            .get(index)
            .or_else(|| self.tokens.last())
            .ok_or(TokenError::Empty)?;
        Token::new(value.clone(), None)
    }
}
