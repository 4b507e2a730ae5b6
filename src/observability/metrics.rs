//! Thread-safe metrics collection system
//!
//! Provides atomic counters and mutex-protected collections for tracking
//! operational statistics across the broker session, both bridge directions
//! and the gateway lifecycle.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Dispatch latencies kept for percentiles
const MAX_DISPATCH_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Broker session
    broker_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    connection_start_time: AtomicU64,

    // Outbound direction (cloud -> broker)
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    backpressure_rejections: AtomicU64,
    token_refreshes: AtomicU64,
    cloud_events_forwarded: AtomicU64,
    cloud_events_suppressed: AtomicU64,
    inventories_forwarded: AtomicU64,

    // Inbound direction (broker -> cloud)
    inbound_received: AtomicU64,
    redeliveries_dropped: AtomicU64,
    decode_failures: AtomicU64,
    unknown_device_drops: AtomicU64,
    dispatches_succeeded: AtomicU64,
    dispatch_retries: AtomicU64,
    dispatch_failures: AtomicU64,
    dispatch_times: Mutex<Vec<u64>>, // in milliseconds

    // Cloud session
    cloud_connected: AtomicBool,
    cloud_disconnects: AtomicU64,

    // Lifecycle
    gateway_state: Mutex<String>,
    uptime_start: AtomicU64,
    health_status: AtomicBool,
    last_health_check: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let now = current_timestamp();
        Self {
            broker_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            backpressure_rejections: AtomicU64::new(0),
            token_refreshes: AtomicU64::new(0),
            cloud_events_forwarded: AtomicU64::new(0),
            cloud_events_suppressed: AtomicU64::new(0),
            inventories_forwarded: AtomicU64::new(0),
            inbound_received: AtomicU64::new(0),
            redeliveries_dropped: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            unknown_device_drops: AtomicU64::new(0),
            dispatches_succeeded: AtomicU64::new(0),
            dispatch_retries: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            dispatch_times: Mutex::new(Vec::new()),
            cloud_connected: AtomicBool::new(false),
            cloud_disconnects: AtomicU64::new(0),
            gateway_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(now),
            health_status: AtomicBool::new(false),
            last_health_check: AtomicU64::new(now),
        }
    }

    // Broker session metrics
    pub fn broker_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broker_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.broker_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn broker_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.broker_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn broker_connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.broker_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    // Outbound metrics
    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backpressure_rejected(&self) {
        self.backpressure_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn token_refreshed(&self) {
        self.token_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cloud_event_forwarded(&self) {
        self.cloud_events_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cloud_event_suppressed(&self) {
        self.cloud_events_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inventory_forwarded(&self) {
        self.inventories_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    // Inbound metrics
    pub fn inbound_received(&self) {
        self.inbound_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn redelivery_dropped(&self) {
        self.redeliveries_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_failed(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unknown_device_dropped(&self) {
        self.unknown_device_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dispatch_retried(&self) {
        self.dispatch_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dispatch_succeeded(&self, duration: Duration) {
        self.dispatches_succeeded.fetch_add(1, Ordering::Relaxed);
        self.record_dispatch_time(duration);
    }

    pub fn dispatch_failed(&self, duration: Duration) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
        self.record_dispatch_time(duration);
    }

    fn record_dispatch_time(&self, duration: Duration) {
        if let Ok(mut times) = self.dispatch_times.lock() {
            times.push(duration.as_millis() as u64);

            if times.len() > MAX_DISPATCH_SAMPLES {
                times.remove(0);
            }
        }
    }

    // Cloud session metrics
    pub fn set_cloud_connected(&self, connected: bool) {
        let was_connected = self.cloud_connected.swap(connected, Ordering::Relaxed);
        if was_connected && !connected {
            self.cloud_disconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    // Lifecycle metrics
    pub fn set_gateway_state(&self, state: &str) {
        if let Ok(mut current_state) = self.gateway_state.lock() {
            if *current_state != state {
                *current_state = state.to_string();
            }
        }
    }

    pub fn update_health_status(&self, healthy: bool) {
        self.health_status.store(healthy, Ordering::Relaxed);
        self.last_health_check
            .store(current_timestamp(), Ordering::Relaxed);
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        let now = current_timestamp();
        for counter in [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.connections_lost,
            &self.connection_start_time,
            &self.messages_published,
            &self.publish_failures,
            &self.backpressure_rejections,
            &self.token_refreshes,
            &self.cloud_events_forwarded,
            &self.cloud_events_suppressed,
            &self.inventories_forwarded,
            &self.inbound_received,
            &self.redeliveries_dropped,
            &self.decode_failures,
            &self.unknown_device_drops,
            &self.dispatches_succeeded,
            &self.dispatch_retries,
            &self.dispatch_failures,
            &self.cloud_disconnects,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.broker_connected.store(false, Ordering::Relaxed);
        self.cloud_connected.store(false, Ordering::Relaxed);
        self.health_status.store(false, Ordering::Relaxed);
        self.uptime_start.store(now, Ordering::Relaxed);
        self.last_health_check.store(now, Ordering::Relaxed);
        if let Ok(mut times) = self.dispatch_times.lock() {
            times.clear();
        }
        if let Ok(mut state) = self.gateway_state.lock() {
            *state = "initializing".to_string();
        }
    }

    /// Calculate dispatch time statistics (pure function)
    fn calculate_dispatch_time_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(times) = self.dispatch_times.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted_times = times.clone();
        sorted_times.sort_unstable();

        let avg = sorted_times.iter().sum::<u64>() as f64 / sorted_times.len() as f64;
        (
            avg,
            percentile(&sorted_times, 50.0),
            percentile(&sorted_times, 95.0),
            percentile(&sorted_times, 99.0),
        )
    }

    fn calculate_connection_duration(&self, now: u64) -> u64 {
        if !self.broker_connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start_time = self.connection_start_time.load(Ordering::Relaxed);
        if start_time > 0 {
            now.saturating_sub(start_time)
        } else {
            0
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_dispatch_time_ms, p50, p95, p99) = self.calculate_dispatch_time_statistics();
        let current_state = self
            .gateway_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string());

        MetricsSnapshot {
            broker: BrokerMetrics {
                connected: self.broker_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                connection_duration_seconds: self.calculate_connection_duration(now),
            },
            outbound: OutboundMetrics {
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                backpressure_rejections: self.backpressure_rejections.load(Ordering::Relaxed),
                token_refreshes: self.token_refreshes.load(Ordering::Relaxed),
                cloud_events_forwarded: self.cloud_events_forwarded.load(Ordering::Relaxed),
                cloud_events_suppressed: self.cloud_events_suppressed.load(Ordering::Relaxed),
                inventories_forwarded: self.inventories_forwarded.load(Ordering::Relaxed),
            },
            inbound: InboundMetrics {
                messages_received: self.inbound_received.load(Ordering::Relaxed),
                redeliveries_dropped: self.redeliveries_dropped.load(Ordering::Relaxed),
                decode_failures: self.decode_failures.load(Ordering::Relaxed),
                unknown_device_drops: self.unknown_device_drops.load(Ordering::Relaxed),
                dispatches_succeeded: self.dispatches_succeeded.load(Ordering::Relaxed),
                dispatch_retries: self.dispatch_retries.load(Ordering::Relaxed),
                dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
                avg_dispatch_time_ms,
                dispatch_time_p50_ms: p50,
                dispatch_time_p95_ms: p95,
                dispatch_time_p99_ms: p99,
            },
            cloud: CloudMetrics {
                connected: self.cloud_connected.load(Ordering::Relaxed),
                disconnects: self.cloud_disconnects.load(Ordering::Relaxed),
            },
            lifecycle: LifecycleMetrics {
                current_state,
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                healthy: self.health_status.load(Ordering::Relaxed),
                last_health_check: self.last_health_check.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub broker: BrokerMetrics,
    pub outbound: OutboundMetrics,
    pub inbound: InboundMetrics,
    pub cloud: CloudMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct BrokerMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct OutboundMetrics {
    pub messages_published: u64,
    pub publish_failures: u64,
    pub backpressure_rejections: u64,
    pub token_refreshes: u64,
    pub cloud_events_forwarded: u64,
    pub cloud_events_suppressed: u64,
    pub inventories_forwarded: u64,
}

#[derive(Debug, Serialize)]
pub struct InboundMetrics {
    pub messages_received: u64,
    pub redeliveries_dropped: u64,
    pub decode_failures: u64,
    pub unknown_device_drops: u64,
    pub dispatches_succeeded: u64,
    pub dispatch_retries: u64,
    pub dispatch_failures: u64,
    pub avg_dispatch_time_ms: f64,
    pub dispatch_time_p50_ms: f64,
    pub dispatch_time_p95_ms: f64,
    pub dispatch_time_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct CloudMetrics {
    pub connected: bool,
    pub disconnects: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub healthy: bool,
    pub last_health_check: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;
        lower_value + (upper_value - lower_value) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_broker_metrics() {
        let collector = MetricsCollector::new();

        collector.broker_connection_attempt();
        collector.broker_connection_established();
        collector.message_published();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.broker.connection_attempts, 1);
        assert_eq!(metrics.broker.connections_established, 1);
        assert_eq!(metrics.outbound.messages_published, 1);
        assert!(metrics.broker.connected);

        collector.broker_connection_lost();
        let metrics = collector.get_metrics();
        assert!(!metrics.broker.connected);
        assert_eq!(metrics.broker.connections_lost, 1);
    }

    #[test]
    fn test_inbound_metrics() {
        let collector = MetricsCollector::new();

        collector.inbound_received();
        collector.inbound_received();
        collector.decode_failed();
        collector.dispatch_retried();
        collector.dispatch_succeeded(Duration::from_millis(40));

        let metrics = collector.get_metrics();
        assert_eq!(metrics.inbound.messages_received, 2);
        assert_eq!(metrics.inbound.decode_failures, 1);
        assert_eq!(metrics.inbound.dispatch_retries, 1);
        assert_eq!(metrics.inbound.dispatches_succeeded, 1);
        assert!(metrics.inbound.avg_dispatch_time_ms >= 40.0);
    }

    #[test]
    fn test_cloud_disconnects_counted_on_transition() {
        let collector = MetricsCollector::new();

        collector.set_cloud_connected(false);
        collector.set_cloud_connected(true);
        collector.set_cloud_connected(false);
        collector.set_cloud_connected(false);

        assert_eq!(collector.get_metrics().cloud.disconnects, 1);
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector.inbound_received();
                        collector.message_published();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.get_metrics();
        assert_eq!(metrics.inbound.messages_received, 1000);
        assert_eq!(metrics.outbound.messages_published, 1000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        let p50 = percentile(&data, 50.0);
        let p95 = percentile(&data, 95.0);

        assert!((p50 - 5.5).abs() < 0.1, "P50: expected ~5.5, got {p50}");
        assert!((p95 - 9.5).abs() < 0.1, "P95: expected ~9.5, got {p95}");
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_dispatch_samples_bounded() {
        let collector = MetricsCollector::new();
        for i in 0..1500 {
            collector.dispatch_failed(Duration::from_millis(i));
        }

        assert_eq!(
            collector.dispatch_times.lock().unwrap().len(),
            MAX_DISPATCH_SAMPLES
        );
        assert_eq!(collector.get_metrics().inbound.dispatch_failures, 1500);
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::new();

        collector.inbound_received();
        collector.broker_connection_established();
        collector.set_gateway_state("running");

        collector.reset();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.inbound.messages_received, 0);
        assert!(!metrics.broker.connected);
        assert_eq!(metrics.lifecycle.current_state, "initializing");
    }
}
