//! Health check HTTP server
//!
//! Endpoints for operators and orchestration platforms:
//!
//! - `GET /health` per-component status, 503 when any component is unhealthy
//! - `GET /ready` 200 only when both directions of the bridge are live
//! - `GET /live` always 200 while the process runs
//! - `GET /metrics` the process-wide metrics snapshot

use crate::health::{HealthCheckManager, HealthCheckResult};
use crate::observability::metrics::metrics;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::info;
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    gateway_id: String,
    port: u16,
    checks: Arc<HealthCheckManager>,
}

impl HealthServer {
    pub fn new(gateway_id: impl Into<String>, port: u16, checks: Arc<HealthCheckManager>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            port,
            checks,
        }
    }

    /// All endpoints as one filter
    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let health_server = Arc::clone(self);
        let ready_server = Arc::clone(self);

        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = Arc::clone(&health_server);
                async move {
                    let status = server.health_status().await;
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
                }
            });

        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = Arc::clone(&ready_server);
                async move {
                    let ready = server.checks.calculate_overall_health().await;
                    let response = ReadinessResponse {
                        ready,
                        timestamp: current_timestamp(),
                    };
                    let code = if ready {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
                }
            });

        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints: HashMap<&str, &str> = [
                ("/health", "Per-component health status"),
                ("/ready", "Readiness: both bridge directions live"),
                ("/live", "Liveness"),
                ("/metrics", "Gateway metrics"),
            ]
            .into_iter()
            .collect();
            warp::reply::json(&endpoints)
        });

        health_route
            .or(ready_route)
            .or(live_route)
            .or(metrics_route)
            .or(root_route)
    }

    /// Serve until `shutdown` turns true
    pub async fn serve(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), warp::Error> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let signal = async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        };

        let (bound, server) = warp::serve(self.routes()).try_bind_with_graceful_shutdown(addr, signal)?;
        info!(addr = %bound, "Health server listening");
        server.await;
        info!("Health server stopped");
        Ok(())
    }

    async fn health_status(&self) -> HealthStatus {
        let results = self.checks.run_health_checks().await;
        let healthy = results.iter().all(|r| r.healthy);
        metrics().update_health_status(healthy);

        let snapshot = metrics().get_metrics();
        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: current_timestamp(),
            gateway_id: self.gateway_id.clone(),
            state: snapshot.lifecycle.current_state,
            uptime_seconds: snapshot.lifecycle.uptime_seconds,
            checks: results
                .into_iter()
                .map(|r| (r.component.clone(), ComponentStatus::from(r)))
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ComponentStatus {
    status: &'static str,
    message: Option<String>,
    response_time_ms: Option<u64>,
}

impl From<HealthCheckResult> for ComponentStatus {
    fn from(result: HealthCheckResult) -> Self {
        Self {
            status: if result.healthy { "healthy" } else { "unhealthy" },
            message: result.message,
            response_time_ms: result.response_time_ms,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    gateway_id: String,
    state: String,
    uptime_seconds: u64,
    checks: HashMap<String, ComponentStatus>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
