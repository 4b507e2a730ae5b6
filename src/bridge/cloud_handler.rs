//! Cloud-to-broker direction
//!
//! [`CloudConnectionHandler`] consumes the connector's event stream and
//! republishes fleet changes through the [`MessagePublisher`]:
//!
//! - device events are forwarded per device, in the order received;
//! - a cloud disconnect produces one connectivity-loss notice, after which
//!   device events are suppressed until the cloud reconnects;
//! - every (re)connect re-reads the inventory and forwards it once; a failed
//!   read keeps device events suppressed and is retried;
//! - device events accepted after a (re)connect are held until the inventory
//!   of that connect has reached the broker.
//!
//! The handler is ready once the first inventory has reached the broker.

use super::devices::DeviceRegistry;
use super::publisher::MessagePublisher;
use super::workers::{DrainReport, KeyedWorkers, SubmitError};
use crate::cloud::{CloudConnector, CloudError, CloudEvent};
use crate::observability::metrics::metrics;
use crate::protocol::{DeviceRecord, OutboundEvent};
use crate::transport::{BrokerTransport, ConnectionState};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Retry policy for inventory reads and publishes
#[derive(Debug, Clone, Copy)]
pub struct ForwardingPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    /// Events queued per device
    pub queue_capacity: usize,
}

impl Default for ForwardingPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(200),
            queue_capacity: 64,
        }
    }
}

struct Core<T: BrokerTransport> {
    connector: Arc<dyn CloudConnector>,
    publisher: Arc<MessagePublisher<T>>,
    registry: DeviceRegistry,
    workers: KeyedWorkers,
    policy: ForwardingPolicy,
    state_tx: watch::Sender<ConnectionState>,
    ready_tx: watch::Sender<bool>,
    /// Latest inventory generation acknowledged by the broker
    inventory_tx: watch::Sender<u64>,
}

/// Link bookkeeping owned by the event loop
#[derive(Debug, Default)]
struct Link {
    loss_notified: bool,
    disconnects: u32,
    /// Inventory generation device events are ordered behind
    generation: u64,
    inventory_retry: Option<Instant>,
}

pub struct CloudConnectionHandler<T: BrokerTransport + 'static> {
    core: Arc<Core<T>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: BrokerTransport + 'static> CloudConnectionHandler<T> {
    pub fn new(
        connector: Arc<dyn CloudConnector>,
        publisher: Arc<MessagePublisher<T>>,
        registry: DeviceRegistry,
        policy: ForwardingPolicy,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (ready_tx, _) = watch::channel(false);
        let (inventory_tx, _) = watch::channel(0);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            core: Arc::new(Core {
                connector,
                publisher,
                registry,
                workers: KeyedWorkers::new("cloud-events", policy.queue_capacity),
                policy,
                state_tx,
                ready_tx,
                inventory_tx,
            }),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Start consuming `events` and wait until the first inventory has been
    /// forwarded
    ///
    /// Waits for as long as the cloud stays unreachable; callers bound it
    /// with a timeout.
    pub async fn start(&self, events: mpsc::Receiver<CloudEvent>) {
        {
            let mut task = lock(&self.task);
            if task.is_some() {
                warn!("Cloud connection handler already started");
            } else {
                self.core.set_state(ConnectionState::Connecting);
                let core = Arc::clone(&self.core);
                let shutdown_rx = self.shutdown_tx.subscribe();
                let span = crate::bridge_span!(direction = "outbound");
                *task = Some(tokio::spawn(core.run(events, shutdown_rx).instrument(span)));
            }
        }

        let mut ready_rx = self.core.ready_tx.subscribe();
        if ready_rx.wait_for(|ready| *ready).await.is_ok() {
            info!(devices = self.core.registry.len(), "Cloud bridge ready");
        }
    }

    /// Stop consuming cloud events; queued forwards still run
    pub async fn stop(&self) {
        self.core.workers.stop_accepting();
        let _ = self.shutdown_tx.send(true);

        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Cloud event loop ended abnormally");
                }
            }
        }
        self.core.set_state(ConnectionState::Closed);
    }

    /// Wait for queued forwards, up to `timeout`
    pub async fn drain(&self, timeout: Duration) -> DrainReport {
        self.core.workers.drain(timeout).await
    }

    /// Cloud session state as seen through its events
    pub fn state(&self) -> ConnectionState {
        self.core.state_tx.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.core.ready_tx.borrow()
    }

    /// Watch readiness (inventory forwarded at least once)
    pub fn ready_watch(&self) -> watch::Receiver<bool> {
        self.core.ready_tx.subscribe()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.core.state_tx.subscribe()
    }

    pub fn pending(&self) -> usize {
        self.core.workers.pending()
    }
}

impl<T: BrokerTransport + 'static> Core<T> {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            debug!(from = %previous, to = %next, "Cloud session state changed");
        }
    }

    async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<CloudEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut link = Link::default();
        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Cloud event loop stopping");
                        break;
                    }
                }

                event = events.recv() => match event {
                    Some(event) => self.handle(event, &mut link).await,
                    None => {
                        warn!("Cloud event stream ended");
                        break;
                    }
                },

                _ = retry_at(link.inventory_retry), if link.inventory_retry.is_some() => {
                    link.inventory_retry = None;
                    self.on_connected(&mut link).await;
                }
            }
        }
    }

    async fn handle(self: &Arc<Self>, event: CloudEvent, link: &mut Link) {
        match event {
            CloudEvent::Connected => self.on_connected(link).await,
            CloudEvent::Disconnected { reason } => self.on_disconnected(reason, link),
            device_event => self.on_device_event(device_event, link.generation),
        }
    }

    /// Device events stay suppressed until the inventory has been read
    async fn on_connected(self: &Arc<Self>, link: &mut Link) {
        let devices = match self.read_inventory().await {
            Ok(devices) => devices,
            Err(e) => {
                let delay = self.policy.backoff * self.policy.attempts.max(1);
                error!(
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Could not read cloud inventory, device events stay suppressed"
                );
                link.inventory_retry = Some(Instant::now() + delay);
                return;
            }
        };
        link.inventory_retry = None;
        link.generation += 1;
        self.registry.replace(&devices);
        self.set_state(ConnectionState::Connected);
        metrics().set_cloud_connected(true);

        if link.loss_notified {
            link.loss_notified = false;
            info!(disconnects = link.disconnects, "Cloud connection restored");
            self.forward(
                self.publisher.gateway_id().to_string(),
                OutboundEvent::CloudConnectivity {
                    connected: true,
                    reason: None,
                },
            );
        }
        self.forward_inventory(devices, link.generation);
    }

    fn on_disconnected(&self, reason: String, link: &mut Link) {
        link.inventory_retry = None;
        if link.loss_notified {
            debug!(reason = %reason, "Cloud still disconnected");
            return;
        }

        link.loss_notified = true;
        link.disconnects += 1;
        self.set_state(ConnectionState::Reconnecting(link.disconnects));
        metrics().set_cloud_connected(false);
        warn!(reason = %reason, "Cloud connection lost, suppressing device events");

        self.forward(
            self.publisher.gateway_id().to_string(),
            OutboundEvent::CloudConnectivity {
                connected: false,
                reason: Some(reason),
            },
        );
    }

    fn on_device_event(&self, event: CloudEvent, generation: u64) {
        if *self.state_tx.borrow() != ConnectionState::Connected {
            metrics().cloud_event_suppressed();
            debug!(device_id = ?event.device_id(), "Cloud disconnected, suppressing device event");
            return;
        }

        let (device_id, outbound) = match event {
            CloudEvent::DeviceAdded(device) => {
                self.registry.insert(device.clone());
                (device.id.clone(), OutboundEvent::DeviceAdded { device })
            }
            CloudEvent::DeviceRemoved { device_id } => {
                self.registry.remove(&device_id);
                (
                    device_id.clone(),
                    OutboundEvent::DeviceRemoved { device_id },
                )
            }
            CloudEvent::DeviceStateChanged { device_id, state } => {
                self.registry.update_state(&device_id, state.clone());
                (
                    device_id.clone(),
                    OutboundEvent::DeviceStateChanged { device_id, state },
                )
            }
            CloudEvent::Connected | CloudEvent::Disconnected { .. } => return,
        };
        self.forward_after_inventory(device_id, outbound, generation);
    }

    async fn read_inventory(&self) -> Result<Vec<DeviceRecord>, CloudError> {
        let mut attempt = 1;
        loop {
            match self.connector.list_devices().await {
                Ok(devices) => return Ok(devices),
                Err(e) if e.is_retryable() && attempt < self.policy.attempts => {
                    debug!(attempt, error = %e, "Inventory read failed, retrying");
                    tokio::time::sleep(self.policy.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Publish the inventory under the gateway key
    ///
    /// Retries until the broker takes it or the handler shuts down. Success
    /// marks the handler ready and releases device events of `generation`.
    fn forward_inventory(self: &Arc<Self>, devices: Vec<DeviceRecord>, generation: u64) {
        let core = Arc::clone(self);
        let key = self.publisher.gateway_id().to_string();
        let count = devices.len();
        let event = OutboundEvent::Inventory { devices };

        let job = async move {
            let mut attempt = 1;
            loop {
                match core.publisher.publish(&event).await {
                    Ok(_) => {
                        metrics().inventory_forwarded();
                        info!(devices = count, generation, "Cloud inventory forwarded");
                        core.inventory_tx.send_modify(|done| *done = (*done).max(generation));
                        core.ready_tx.send_replace(true);
                        return;
                    }
                    Err(e) if core.workers.is_accepting() => {
                        warn!(attempt, error = %e.sanitized(), "Inventory publish failed, retrying");
                        tokio::time::sleep(core.policy.backoff * attempt.min(core.policy.attempts.max(1))).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        error!(error = %e.sanitized(), "Shutting down, giving up on inventory publish");
                        return;
                    }
                }
            }
        };
        self.submit(&key, job);
    }

    /// Like [`Self::forward`], but published only once the inventory of
    /// `generation` is on the broker
    fn forward_after_inventory(&self, key: String, event: OutboundEvent, generation: u64) {
        let publisher = Arc::clone(&self.publisher);
        let mut inventory_rx = self.inventory_tx.subscribe();
        let job = async move {
            if inventory_rx.wait_for(|done| *done >= generation).await.is_err() {
                return;
            }
            publish_event(&publisher, &event).await;
        };
        self.submit(&key, job);
    }

    /// Fire-and-forget publish, ordered behind earlier events for `key`
    fn forward(&self, key: String, event: OutboundEvent) {
        let publisher = Arc::clone(&self.publisher);
        let job = async move { publish_event(&publisher, &event).await };
        self.submit(&key, job);
    }

    fn submit<F>(&self, key: &str, job: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match self.workers.submit(key, job) {
            Ok(()) => {}
            Err(SubmitError::QueueFull { capacity, .. }) => {
                warn!(key = %key, capacity, "Cloud event queue full, dropping event");
            }
            Err(SubmitError::Stopped) => {
                debug!(key = %key, "Shutting down, dropping cloud event");
            }
        }
    }
}

async fn publish_event<T: BrokerTransport>(publisher: &MessagePublisher<T>, event: &OutboundEvent) {
    match publisher.publish(event).await {
        Ok(_) => metrics().cloud_event_forwarded(),
        Err(e) => warn!(
            device_id = ?event.device_id(),
            error = %e.sanitized(),
            "Dropping cloud event that could not be published"
        ),
    }
}

async fn retry_at(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
