//! Gateway startup and shutdown orchestration
//!
//! Startup:
//! 1. take the cloud event stream so no event is missed;
//! 2. start the broker connection and the cloud connector concurrently;
//! 3. start the cloud handler and wait, bounded, for the first inventory;
//! 4. subscribe the message handler to every command route.
//!
//! Shutdown stops accepting inbound work, drains both directions with a
//! timeout, then closes the cloud session and the broker session.

use crate::auth::TokenCache;
use crate::bridge::{
    CloudConnectionHandler, DeviceRegistry, DispatchPolicy, ForwardingPolicy, MessageHandler,
    MessagePublisher,
};
use crate::cloud::CloudConnector;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::health::{BrokerHealthCheck, CloudHealthCheck, HealthCheckManager, InboundHealthCheck};
use crate::observability::metrics::metrics;
use crate::protocol::RouteTable;
use crate::transport::{BrokerConnection, BrokerSession, BrokerTransport, ReconnectConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn, Instrument};

/// Where the gateway is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Created,
    Starting,
    Running,
    Draining,
    Stopped,
    Failed,
}

impl GatewayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayState::Created => "created",
            GatewayState::Starting => "starting",
            GatewayState::Running => "running",
            GatewayState::Draining => "draining",
            GatewayState::Stopped => "stopped",
            GatewayState::Failed => "failed",
        }
    }
}

/// Startup and drain bounds
#[derive(Debug, Clone, Copy)]
pub struct LifecycleTimeouts {
    /// How long startup waits for the first inventory to reach the broker
    pub startup: Duration,
    pub drain: Duration,
}

impl Default for LifecycleTimeouts {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(60),
            drain: Duration::from_secs(10),
        }
    }
}

/// What shutdown left behind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Inbound commands abandoned by the drain
    pub inbound_undelivered: usize,
    /// Cloud events abandoned by the drain
    pub outbound_undelivered: usize,
    pub timed_out: bool,
}

impl ShutdownReport {
    pub fn undelivered(&self) -> usize {
        self.inbound_undelivered + self.outbound_undelivered
    }
}

type Broker<S> = BrokerConnection<S>;

/// The assembled gateway
pub struct GatewayLifecycle<S: BrokerSession> {
    gateway_id: String,
    broker: Arc<Broker<S>>,
    connector: Arc<dyn CloudConnector>,
    publisher: Arc<MessagePublisher<Broker<S>>>,
    registry: DeviceRegistry,
    cloud_handler: CloudConnectionHandler<Broker<S>>,
    message_handler: MessageHandler<Broker<S>>,
    timeouts: LifecycleTimeouts,
    state_tx: watch::Sender<GatewayState>,
}

impl<S: BrokerSession> GatewayLifecycle<S> {
    /// Wire every component from configuration and injected collaborators
    pub fn new(
        config: &GatewayConfig,
        session: S,
        connector: Arc<dyn CloudConnector>,
        tokens: Arc<TokenCache>,
    ) -> Result<Self, GatewayError> {
        let bridge = &config.bridge;
        let backoff = Duration::from_millis(bridge.retry_backoff_ms);

        let broker = Arc::new(BrokerConnection::new(
            session,
            ReconnectConfig::from(&config.broker.reconnect),
            config.broker.buffer_capacity,
        ));
        let routes = Arc::new(RouteTable::from_config(&config.routes));
        let publisher = Arc::new(MessagePublisher::new(
            Arc::clone(&broker),
            tokens,
            Arc::clone(&routes),
            config.gateway.id.clone(),
        ));
        let registry = DeviceRegistry::new();

        let cloud_handler = CloudConnectionHandler::new(
            Arc::clone(&connector),
            Arc::clone(&publisher),
            registry.clone(),
            ForwardingPolicy {
                attempts: bridge.dispatch_attempts,
                backoff,
                queue_capacity: bridge.device_queue_capacity,
            },
        );
        let message_handler = MessageHandler::new(
            Arc::clone(&broker),
            Arc::clone(&connector),
            Arc::clone(&publisher),
            registry.clone(),
            routes.command_routes().to_vec(),
            DispatchPolicy {
                attempts: bridge.dispatch_attempts,
                backoff,
                queue_capacity: bridge.device_queue_capacity,
                subscriber_capacity: bridge.subscriber_capacity,
            },
        )?;

        let (state_tx, _) = watch::channel(GatewayState::Created);
        Ok(Self {
            gateway_id: config.gateway.id.clone(),
            broker,
            connector,
            publisher,
            registry,
            cloud_handler,
            message_handler,
            timeouts: LifecycleTimeouts {
                startup: Duration::from_secs(bridge.startup_timeout_secs),
                drain: Duration::from_secs(bridge.drain_timeout_secs),
            },
            state_tx,
        })
    }

    pub fn with_timeouts(mut self, timeouts: LifecycleTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Bring both sessions up and start both directions of the bridge
    ///
    /// Any failure tears down what was started and is fatal for the process.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let span = crate::lifecycle_span!(gateway_id = %self.gateway_id, phase = "startup");
        async {
            self.set_state(GatewayState::Starting);
            match self.start_components().await {
                Ok(()) => {
                    self.set_state(GatewayState::Running);
                    info!(devices = self.registry.len(), "Gateway running");
                    Ok(())
                }
                Err(e) => {
                    error!(error = %e.sanitized(), "Gateway startup failed");
                    self.teardown().await;
                    self.set_state(GatewayState::Failed);
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn start_components(&self) -> Result<(), GatewayError> {
        let events = self.connector.subscribe()?;

        info!(cloud = self.connector.name(), "Connecting to broker and cloud");
        let (broker, cloud) = tokio::join!(self.broker.start(), self.connector.start());
        broker?;
        cloud?;
        info!("Broker connected, cloud connector started");

        tokio::time::timeout(self.timeouts.startup, self.cloud_handler.start(events))
            .await
            .map_err(|_| {
                GatewayError::Startup(format!(
                    "cloud inventory not forwarded within {}s",
                    self.timeouts.startup.as_secs()
                ))
            })?;

        self.message_handler.start().await?;
        Ok(())
    }

    /// Release everything a failed startup may have opened
    async fn teardown(&self) {
        self.message_handler.stop();
        self.cloud_handler.stop().await;
        if let Err(e) = self.connector.stop().await {
            warn!(error = %e, "Cloud connector stop failed");
        }
        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "Broker close failed");
        }
    }

    /// Ordered shutdown; returns the counts of abandoned work
    pub async fn shutdown(&self) -> ShutdownReport {
        let span = crate::lifecycle_span!(gateway_id = %self.gateway_id, phase = "shutdown");
        async {
            self.set_state(GatewayState::Draining);
            info!(drain_timeout_secs = self.timeouts.drain.as_secs(), "Shutting down gateway");

            self.message_handler.stop_accepting();
            self.cloud_handler.stop().await;

            let (inbound, outbound) = tokio::join!(
                self.message_handler.drain(self.timeouts.drain),
                self.cloud_handler.drain(self.timeouts.drain),
            );
            self.message_handler.stop();

            if let Err(e) = self.connector.stop().await {
                warn!(error = %e, "Cloud connector stop failed");
            }
            if let Err(e) = self.broker.close().await {
                warn!(error = %e, "Broker close failed");
            }

            let report = ShutdownReport {
                inbound_undelivered: inbound.undelivered,
                outbound_undelivered: outbound.undelivered,
                timed_out: inbound.timed_out || outbound.timed_out,
            };
            if report.timed_out {
                warn!(
                    inbound_undelivered = report.inbound_undelivered,
                    outbound_undelivered = report.outbound_undelivered,
                    "Drain timed out, undelivered messages dropped"
                );
            }
            self.set_state(GatewayState::Stopped);
            info!("Gateway stopped");
            report
        }
        .instrument(span)
        .await
    }

    /// Both directions live
    pub fn is_ready(&self) -> bool {
        self.broker.is_connected()
            && self.cloud_handler.is_ready()
            && self.cloud_handler.state() == crate::transport::ConnectionState::Connected
            && self.message_handler.subscriptions_live()
    }

    /// Health checks over the broker session and both bridge directions
    pub fn health_checks(&self) -> HealthCheckManager {
        let mut manager = HealthCheckManager::new();
        manager.add_health_check(Box::new(BrokerHealthCheck::new(Arc::clone(&self.broker))));
        manager.add_health_check(Box::new(CloudHealthCheck::new(
            self.cloud_handler.state_watch(),
            self.cloud_handler.ready_watch(),
        )));
        manager.add_health_check(Box::new(InboundHealthCheck::new(
            self.message_handler.live_watch(),
        )));
        manager
    }

    pub fn state(&self) -> GatewayState {
        *self.state_tx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<GatewayState> {
        self.state_tx.subscribe()
    }

    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    pub fn broker(&self) -> &Arc<BrokerConnection<S>> {
        &self.broker
    }

    pub fn publisher(&self) -> &Arc<MessagePublisher<BrokerConnection<S>>> {
        &self.publisher
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn cloud_handler(&self) -> &CloudConnectionHandler<BrokerConnection<S>> {
        &self.cloud_handler
    }

    pub fn message_handler(&self) -> &MessageHandler<BrokerConnection<S>> {
        &self.message_handler
    }

    fn set_state(&self, state: GatewayState) {
        self.state_tx.send_replace(state);
        metrics().set_gateway_state(state.as_str());
    }
}
