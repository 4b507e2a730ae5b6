//! Broker-to-cloud direction
//!
//! [`MessageHandler`] owns one broker subscription per command route. Each
//! delivery is decoded, schema-checked and matched against the device
//! registry synchronously on the route's task; dispatch to the cloud runs on
//! a per-device worker so a slow or failing device never stalls a route.
//! Bad messages are logged and dropped, never fatal.

use super::devices::DeviceRegistry;
use super::publisher::MessagePublisher;
use super::workers::{DrainReport, KeyedWorkers, SubmitError};
use crate::cloud::{CloudConnector, CloudError};
use crate::error::GatewayError;
use crate::observability::metrics::metrics;
use crate::protocol::{
    CommandKind, CommandRoute, CommandStatus, DecodedCommand, Frame, InboundCommand,
    OutboundEvent, PayloadDecoder,
};
use crate::transport::BrokerTransport;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Bounded retry and queueing for inbound dispatch
#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    /// Total attempts per command, first one included
    pub attempts: u32,
    /// Retry n waits `backoff * n`
    pub backoff: Duration,
    /// Commands queued per device
    pub queue_capacity: usize,
    /// Deliveries buffered per subscription
    pub subscriber_capacity: usize,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(200),
            queue_capacity: 64,
            subscriber_capacity: 128,
        }
    }
}

struct Core<T: BrokerTransport> {
    connector: Arc<dyn CloudConnector>,
    publisher: Arc<MessagePublisher<T>>,
    registry: DeviceRegistry,
    decoder: PayloadDecoder,
    workers: KeyedWorkers,
    policy: DispatchPolicy,
}

pub struct MessageHandler<T: BrokerTransport + 'static> {
    transport: Arc<T>,
    routes: Vec<CommandRoute>,
    core: Arc<Core<T>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    live_tx: watch::Sender<bool>,
}

impl<T: BrokerTransport + 'static> MessageHandler<T> {
    pub fn new(
        transport: Arc<T>,
        connector: Arc<dyn CloudConnector>,
        publisher: Arc<MessagePublisher<T>>,
        registry: DeviceRegistry,
        routes: Vec<CommandRoute>,
        policy: DispatchPolicy,
    ) -> Result<Self, GatewayError> {
        let decoder = PayloadDecoder::new()?;
        let (live_tx, _) = watch::channel(false);

        Ok(Self {
            transport,
            routes,
            core: Arc::new(Core {
                connector,
                publisher,
                registry,
                decoder,
                workers: KeyedWorkers::new("commands", policy.queue_capacity),
                policy,
            }),
            tasks: Mutex::new(Vec::new()),
            live_tx,
        })
    }

    /// Subscribe to every command route
    ///
    /// Fails if the broker refuses any subscription.
    pub async fn start(&self) -> Result<(), GatewayError> {
        for command_route in &self.routes {
            let (tx, rx) = mpsc::channel(self.core.policy.subscriber_capacity.max(1));
            self.transport.subscribe(&command_route.route, tx).await?;

            let core = Arc::clone(&self.core);
            let span = crate::bridge_span!(direction = "inbound", route = %command_route.route.name);
            let handle = tokio::spawn(core.consume(command_route.clone(), rx).instrument(span));
            lock(&self.tasks).push(handle);
            info!(
                route = %command_route.route.name,
                topic = %command_route.route.topic,
                kind = ?command_route.kind,
                "Listening for commands"
            );
        }

        self.live_tx.send_replace(true);
        Ok(())
    }

    /// Drop new deliveries from now on; queued dispatches continue
    pub fn stop_accepting(&self) {
        self.core.workers.stop_accepting();
    }

    /// Wait for in-flight dispatches, up to `timeout`
    pub async fn drain(&self, timeout: Duration) -> DrainReport {
        self.core.workers.drain(timeout).await
    }

    /// Tear down the route tasks; their subscriptions lapse with them
    pub fn stop(&self) {
        self.stop_accepting();
        for handle in lock(&self.tasks).drain(..) {
            handle.abort();
        }
        self.live_tx.send_replace(false);
    }

    /// True while every command route has a running consumer
    pub fn subscriptions_live(&self) -> bool {
        *self.live_tx.borrow() && lock(&self.tasks).iter().all(|task| !task.is_finished())
    }

    pub fn live_watch(&self) -> watch::Receiver<bool> {
        self.live_tx.subscribe()
    }

    pub fn pending(&self) -> usize {
        self.core.workers.pending()
    }
}

impl<T: BrokerTransport + 'static> Core<T> {
    async fn consume(self: Arc<Self>, command_route: CommandRoute, mut rx: mpsc::Receiver<Frame>) {
        while let Some(frame) = rx.recv().await {
            self.accept(command_route.kind, frame);
        }
        debug!(route = %command_route.route.name, "Command subscription closed");
    }

    /// Validate one delivery and queue it for its device
    fn accept(self: &Arc<Self>, kind: CommandKind, frame: Frame) {
        metrics().inbound_received();
        if !self.workers.is_accepting() {
            debug!(topic = %frame.topic, "Shutting down, ignoring inbound message");
            return;
        }

        let command = match self.decoder.decode(kind, &frame) {
            Ok(command) => command,
            Err(e) => {
                metrics().decode_failed();
                warn!(topic = %frame.topic, error = %GatewayError::from(e), "Dropping malformed message");
                return;
            }
        };

        if !self.registry.contains(&command.device_id) {
            metrics().unknown_device_dropped();
            let error = GatewayError::UnknownDevice {
                device_id: command.device_id.clone(),
            };
            warn!(topic = %frame.topic, error = %error, "Dropping command");
            return;
        }

        let device_id = command.device_id.clone();
        let core = Arc::clone(self);
        match self.workers.submit(&device_id, core.dispatch(command)) {
            Ok(()) => {}
            Err(SubmitError::QueueFull { capacity, .. }) => {
                warn!(device_id = %device_id, capacity, "Device command queue full, dropping command");
            }
            Err(SubmitError::Stopped) => {
                debug!(device_id = %device_id, "Shutting down, dropping command");
            }
        }
    }

    async fn dispatch(self: Arc<Self>, command: DecodedCommand) {
        let started = Instant::now();
        let outcome = self.dispatch_with_retry(&command).await;

        let (status, error) = match &outcome {
            Ok(()) => {
                metrics().dispatch_succeeded(started.elapsed());
                debug!(
                    device_id = %command.device_id,
                    message_id = ?command.message_id,
                    "Command dispatched"
                );
                (CommandStatus::Delivered, None)
            }
            Err(e) => {
                metrics().dispatch_failed(started.elapsed());
                error!(device_id = %command.device_id, error = %e.sanitized(), "Dropping command");
                (CommandStatus::Failed, Some(e.sanitized()))
            }
        };

        let Some(correlation_id) = command.correlation_id.clone() else {
            return;
        };
        let result = OutboundEvent::CommandResult {
            device_id: command.device_id.clone(),
            correlation_id: Some(correlation_id),
            status,
            error,
        };
        if let Err(e) = self.publisher.publish(&result).await {
            warn!(device_id = %command.device_id, error = %e.sanitized(), "Could not publish command result");
        }
    }

    async fn dispatch_with_retry(&self, command: &DecodedCommand) -> Result<(), GatewayError> {
        let mut attempt = 1;
        loop {
            match self.invoke(command).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.policy.attempts => {
                    metrics().dispatch_retried();
                    let delay = self.policy.backoff * attempt;
                    debug!(device_id = %command.device_id, attempt, error = %e, "Dispatch failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(GatewayError::Dispatch {
                        device_id: command.device_id.clone(),
                        attempts: attempt,
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    async fn invoke(&self, command: &DecodedCommand) -> Result<(), CloudError> {
        match &command.command {
            InboundCommand::SendCommand(device_command) => {
                self.connector
                    .send_command(&command.device_id, device_command)
                    .await
            }
            InboundCommand::UpdateState(state) => {
                self.connector.update_state(&command.device_id, state).await
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
