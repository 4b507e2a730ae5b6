//! Component health checks
//!
//! The gateway is ready only when both directions of the bridge are live:
//! the broker session is connected, the cloud bridge has forwarded its
//! inventory over a connected cloud session, and every command subscription
//! has a running consumer.

use crate::transport::{BrokerTransport, ConnectionState};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Health check result
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub component: String,
    pub healthy: bool,
    pub message: Option<String>,
    pub response_time_ms: Option<u64>,
}

impl HealthCheckResult {
    fn new(component: &str, healthy: bool, message: String, started: std::time::Instant) -> Self {
        Self {
            component: component.to_string(),
            healthy,
            message: Some(message),
            response_time_ms: Some(started.elapsed().as_millis() as u64),
        }
    }
}

/// Trait for components that can be health checked
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Perform health check on this component
    async fn health_check(&self) -> HealthCheckResult;

    /// Get the component name for reporting
    fn component_name(&self) -> &str;
}

/// Broker session health
pub struct BrokerHealthCheck<T: BrokerTransport> {
    transport: Arc<T>,
}

impl<T: BrokerTransport> BrokerHealthCheck<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl<T: BrokerTransport> HealthCheck for BrokerHealthCheck<T> {
    async fn health_check(&self) -> HealthCheckResult {
        let start = std::time::Instant::now();
        let state = self.transport.connection_state();
        let healthy = state == ConnectionState::Connected;

        let message = match &state {
            ConnectionState::Connected => "Broker connection healthy".to_string(),
            ConnectionState::Closed => "Broker connection closed".to_string(),
            other => format!("Broker not connected - state: {other}"),
        };
        debug!(healthy, state = %state, "Broker health check");

        HealthCheckResult::new(self.component_name(), healthy, message, start)
    }

    fn component_name(&self) -> &str {
        "broker"
    }
}

/// Cloud direction health: session connected and inventory forwarded
pub struct CloudHealthCheck {
    state: watch::Receiver<ConnectionState>,
    ready: watch::Receiver<bool>,
}

impl CloudHealthCheck {
    pub fn new(state: watch::Receiver<ConnectionState>, ready: watch::Receiver<bool>) -> Self {
        Self { state, ready }
    }
}

#[async_trait]
impl HealthCheck for CloudHealthCheck {
    async fn health_check(&self) -> HealthCheckResult {
        let start = std::time::Instant::now();
        let state = self.state.borrow().clone();
        let ready = *self.ready.borrow();
        let healthy = ready && state == ConnectionState::Connected;

        let message = if healthy {
            "Cloud bridge healthy".to_string()
        } else if !ready {
            format!("Cloud inventory not yet forwarded - state: {state}")
        } else {
            format!("Cloud not connected - state: {state}")
        };

        HealthCheckResult::new(self.component_name(), healthy, message, start)
    }

    fn component_name(&self) -> &str {
        "cloud"
    }
}

/// Inbound direction health: command subscriptions are being consumed
pub struct InboundHealthCheck {
    live: watch::Receiver<bool>,
}

impl InboundHealthCheck {
    pub fn new(live: watch::Receiver<bool>) -> Self {
        Self { live }
    }
}

#[async_trait]
impl HealthCheck for InboundHealthCheck {
    async fn health_check(&self) -> HealthCheckResult {
        let start = std::time::Instant::now();
        let healthy = *self.live.borrow();
        let message = if healthy {
            "Command subscriptions live"
        } else {
            "Command subscriptions not established"
        };

        HealthCheckResult::new(self.component_name(), healthy, message.to_string(), start)
    }

    fn component_name(&self) -> &str {
        "inbound"
    }
}

/// Aggregated health check manager
pub struct HealthCheckManager {
    health_checks: Vec<Box<dyn HealthCheck>>,
}

impl HealthCheckManager {
    pub fn new() -> Self {
        Self {
            health_checks: Vec::new(),
        }
    }

    /// Add a health check to the manager
    pub fn add_health_check(&mut self, health_check: Box<dyn HealthCheck>) {
        self.health_checks.push(health_check);
    }

    /// Run all health checks and return aggregated results
    pub async fn run_health_checks(&self) -> Vec<HealthCheckResult> {
        let mut results = Vec::with_capacity(self.health_checks.len());
        for health_check in &self.health_checks {
            results.push(health_check.health_check().await);
        }
        results
    }

    /// True when every component is healthy
    pub async fn calculate_overall_health(&self) -> bool {
        let results = self.run_health_checks().await;

        if results.is_empty() {
            warn!("No health checks configured - assuming healthy");
            return true;
        }

        let healthy_count = results.iter().filter(|r| r.healthy).count();
        let overall_healthy = healthy_count == results.len();

        debug!(
            "Overall health check: {}/{} components healthy, overall={}",
            healthy_count,
            results.len(),
            overall_healthy
        );

        overall_healthy
    }
}

impl Default for HealthCheckManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockTransport;

    #[tokio::test]
    async fn test_broker_health_check_healthy() {
        let transport = Arc::new(MockTransport::new());
        let result = BrokerHealthCheck::new(transport).health_check().await;

        assert_eq!(result.component, "broker");
        assert!(result.healthy);
        assert!(result.response_time_ms.is_some());
    }

    #[tokio::test]
    async fn test_broker_health_check_reconnecting() {
        let transport = Arc::new(MockTransport::new());
        transport.set_state(ConnectionState::Reconnecting(2));

        let result = BrokerHealthCheck::new(transport).health_check().await;

        assert!(!result.healthy);
        assert!(result.message.unwrap().contains("reconnecting"));
    }

    #[tokio::test]
    async fn test_cloud_health_requires_inventory_and_connection() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let (ready_tx, ready_rx) = watch::channel(false);
        let check = CloudHealthCheck::new(state_rx, ready_rx);

        assert!(!check.health_check().await.healthy);

        ready_tx.send_replace(true);
        assert!(check.health_check().await.healthy);

        state_tx.send_replace(ConnectionState::Reconnecting(1));
        let result = check.health_check().await;
        assert!(!result.healthy);
        assert!(result.message.unwrap().contains("not connected"));
    }

    #[tokio::test]
    async fn test_health_check_manager() {
        let (live_tx, live_rx) = watch::channel(true);
        let mut manager = HealthCheckManager::new();
        manager.add_health_check(Box::new(BrokerHealthCheck::new(Arc::new(MockTransport::new()))));
        manager.add_health_check(Box::new(InboundHealthCheck::new(live_rx)));

        let results = manager.run_health_checks().await;
        assert_eq!(results.len(), 2);
        assert!(manager.calculate_overall_health().await);

        live_tx.send_replace(false);
        assert!(!manager.calculate_overall_health().await);
    }

    #[tokio::test]
    async fn test_empty_manager_is_healthy() {
        assert!(HealthCheckManager::new().calculate_overall_health().await);
    }
}
