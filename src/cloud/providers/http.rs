//! REST-polling cloud connector
//!
//! Polls `GET {base_url}/devices` and turns successive inventories into
//! [`CloudEvent`]s. The first successful poll after a failure emits
//! `Connected`; a failed poll while connected emits `Disconnected`.

use crate::cloud::{CloudConnector, CloudError, CloudEvent};
use crate::protocol::{DeviceCommand, DeviceRecord};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use url::Url;

/// Events buffered for the consumer before polling waits
const EVENT_BUFFER: usize = 1024;

/// HTTP connector configuration
#[derive(Debug, Clone)]
pub struct HttpCloudConfig {
    pub base_url: String,
    /// Bearer token, if the platform needs one
    pub token: Option<String>,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

struct HttpInner {
    base_url: Url,
    token: Option<String>,
    poll_interval: Duration,
    client: Client,
    events_tx: mpsc::Sender<CloudEvent>,
    connected: AtomicBool,
    known: tokio::sync::Mutex<HashMap<String, DeviceRecord>>,
}

/// Cloud connector for platforms exposing a small REST API
pub struct HttpCloudConnector {
    inner: Arc<HttpInner>,
    events_rx: Mutex<Option<mpsc::Receiver<CloudEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl HttpCloudConnector {
    pub fn new(config: HttpCloudConfig) -> Result<Self, CloudError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| CloudError::Connection(format!("invalid base url '{}': {e}", config.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(CloudError::Connection(format!(
                "invalid base url '{}'",
                config.base_url
            )));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CloudError::Connection(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(HttpInner {
                base_url,
                token: config.token,
                poll_interval: config.poll_interval.max(Duration::from_millis(1)),
                client,
                events_tx,
                connected: AtomicBool::new(false),
                known: tokio::sync::Mutex::new(HashMap::new()),
            }),
            events_rx: Mutex::new(Some(events_rx)),
            shutdown_tx,
            poller: Mutex::new(None),
        })
    }
}

#[async_trait]
impl CloudConnector for HttpCloudConnector {
    fn name(&self) -> &str {
        "http"
    }

    async fn start(&self) -> Result<(), CloudError> {
        if lock(&self.poller).is_some() {
            return Err(CloudError::AlreadyStarted);
        }

        // Bad credentials are fatal; anything else is retried by the poller
        if let Err(e) = self.inner.poll_once().await {
            if matches!(e, CloudError::Auth(_)) {
                return Err(e);
            }
            warn!(error = %e, "Cloud platform unreachable at startup, will keep polling");
        }

        let inner = Arc::clone(&self.inner);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let span = crate::cloud_span!(provider = "http");
        let handle = tokio::spawn(inner.poll_loop(shutdown_rx).instrument(span));
        *lock(&self.poller) = Some(handle);
        info!(base_url = %self.inner.base_url, "HTTP cloud connector started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), CloudError> {
        let _ = self.shutdown_tx.send(true);
        let handle = lock(&self.poller).take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                warn!("Cloud poller didn't stop in time, aborting");
                abort.abort();
            }
        }
        self.inner.connected.store(false, Ordering::Relaxed);
        info!("HTTP cloud connector stopped");
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, CloudError> {
        self.inner.fetch_devices().await
    }

    async fn send_command(
        &self,
        device_id: &str,
        command: &DeviceCommand,
    ) -> Result<(), CloudError> {
        let url = self.inner.endpoint(&["devices", device_id, "commands"])?;
        let request = self.inner.client.post(url).json(command);
        self.inner.execute(request, Some(device_id)).await?;
        debug!(device_id = %device_id, command = %command.name, "Command sent to cloud");
        Ok(())
    }

    async fn update_state(&self, device_id: &str, state: &Value) -> Result<(), CloudError> {
        let url = self.inner.endpoint(&["devices", device_id, "state"])?;
        let request = self.inner.client.put(url).json(state);
        self.inner.execute(request, Some(device_id)).await?;
        debug!(device_id = %device_id, "Device state updated in cloud");
        Ok(())
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<CloudEvent>, CloudError> {
        lock(&self.events_rx).take().ok_or(CloudError::EventsTaken)
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Relaxed)
    }
}

impl HttpInner {
    async fn poll_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately and start() already polled
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Cloud poller shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        debug!(error = %e, "Cloud poll failed");
                    }
                }
            }
        }
    }

    /// Fetch the inventory and emit whatever changed since the last poll
    async fn poll_once(&self) -> Result<(), CloudError> {
        let devices = match self.fetch_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                if self.connected.swap(false, Ordering::Relaxed) {
                    warn!(error = %e, "Lost cloud connection");
                    self.emit(CloudEvent::Disconnected {
                        reason: e.to_string(),
                    })
                    .await;
                }
                return Err(e);
            }
        };

        let mut known = self.known.lock().await;
        let current: HashMap<String, DeviceRecord> = devices
            .into_iter()
            .map(|device| (device.id.clone(), device))
            .collect();

        if !self.connected.swap(true, Ordering::Relaxed) {
            // Consumers re-read the full inventory on connect
            *known = current;
            info!(devices = known.len(), "Cloud connection established");
            self.emit(CloudEvent::Connected).await;
            return Ok(());
        }

        for event in diff_inventories(&known, &current) {
            self.emit(event).await;
        }
        *known = current;
        Ok(())
    }

    async fn emit(&self, event: CloudEvent) {
        if self.events_tx.send(event).await.is_err() {
            debug!("No consumer for cloud events");
        }
    }

    async fn fetch_devices(&self) -> Result<Vec<DeviceRecord>, CloudError> {
        let url = self.endpoint(&["devices"])?;
        let response = self.execute(self.client.get(url), None).await?;
        response
            .json::<Vec<DeviceRecord>>()
            .await
            .map_err(|e| CloudError::InvalidResponse(e.to_string()))
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, CloudError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CloudError::Connection(format!("invalid base url '{}'", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn execute(
        &self,
        request: RequestBuilder,
        device_id: Option<&str>,
    ) -> Result<Response, CloudError> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|e| CloudError::Connection(e.without_url().to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let error = classify_status(status, device_id, body);
        if status.is_server_error() {
            error!(status = status.as_u16(), "Cloud platform error");
        }
        Err(error)
    }
}

/// Map a non-success HTTP status onto the cloud error taxonomy
fn classify_status(status: StatusCode, device_id: Option<&str>, body: String) -> CloudError {
    match (status, device_id) {
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => {
            CloudError::Auth(format!("HTTP {}", status.as_u16()))
        }
        (StatusCode::NOT_FOUND, Some(device_id)) => CloudError::UnknownDevice(device_id.to_string()),
        _ => CloudError::Request {
            status: status.as_u16(),
            message: body,
        },
    }
}

/// Events turning `previous` into `current`
///
/// Removals come first, then additions, then state changes, each sorted by
/// device id so the output is deterministic.
pub fn diff_inventories(
    previous: &HashMap<String, DeviceRecord>,
    current: &HashMap<String, DeviceRecord>,
) -> Vec<CloudEvent> {
    let mut removed: Vec<&String> = previous.keys().filter(|id| !current.contains_key(*id)).collect();
    removed.sort();

    let mut added: Vec<&DeviceRecord> = current
        .values()
        .filter(|device| !previous.contains_key(&device.id))
        .collect();
    added.sort_by(|a, b| a.id.cmp(&b.id));

    let mut changed: Vec<&DeviceRecord> = current
        .values()
        .filter(|device| {
            previous
                .get(&device.id)
                .is_some_and(|before| before.state != device.state)
        })
        .collect();
    changed.sort_by(|a, b| a.id.cmp(&b.id));

    removed
        .into_iter()
        .map(|id| CloudEvent::DeviceRemoved {
            device_id: id.clone(),
        })
        .chain(added.into_iter().cloned().map(CloudEvent::DeviceAdded))
        .chain(changed.into_iter().map(|device| CloudEvent::DeviceStateChanged {
            device_id: device.id.clone(),
            state: device.state.clone(),
        }))
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn device(id: &str, state: Value) -> DeviceRecord {
        DeviceRecord {
            state,
            ..DeviceRecord::new(id)
        }
    }

    fn inventory(devices: Vec<DeviceRecord>) -> HashMap<String, DeviceRecord> {
        devices.into_iter().map(|d| (d.id.clone(), d)).collect()
    }

    #[test]
    fn test_diff_inventories() {
        let previous = inventory(vec![
            device("a", json!({"on": true})),
            device("b", json!({"on": false})),
        ]);
        let current = inventory(vec![
            device("b", json!({"on": true})),
            device("c", Value::Null),
        ]);

        let events = diff_inventories(&previous, &current);
        assert_eq!(
            events,
            vec![
                CloudEvent::DeviceRemoved {
                    device_id: "a".to_string()
                },
                CloudEvent::DeviceAdded(device("c", Value::Null)),
                CloudEvent::DeviceStateChanged {
                    device_id: "b".to_string(),
                    state: json!({"on": true}),
                },
            ]
        );
    }

    #[test]
    fn test_diff_unchanged_inventory_is_empty() {
        let snapshot = inventory(vec![device("a", json!(1))]);
        assert!(diff_inventories(&snapshot, &snapshot.clone()).is_empty());
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, Some("d1"), String::new()),
            CloudError::Auth(_)
        ));
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, Some("d1"), String::new()),
            CloudError::UnknownDevice("d1".to_string())
        );
        assert!(classify_status(StatusCode::BAD_GATEWAY, None, String::new()).is_retryable());
        assert!(!classify_status(StatusCode::NOT_FOUND, None, String::new()).is_retryable());
    }

    #[test]
    fn test_endpoint_encodes_device_id() {
        let connector = HttpCloudConnector::new(HttpCloudConfig {
            base_url: "http://cloud.local/api/".to_string(),
            token: None,
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
        })
        .unwrap();

        let url = connector
            .inner
            .endpoint(&["devices", "a b/c", "commands"])
            .unwrap();
        assert_eq!(url.as_str(), "http://cloud.local/api/devices/a%20b%2Fc/commands");
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        let result = HttpCloudConnector::new(HttpCloudConfig {
            base_url: "not a url".to_string(),
            token: None,
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_events_taken_once() {
        let connector = HttpCloudConnector::new(HttpCloudConfig {
            base_url: "http://cloud.local".to_string(),
            token: None,
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
        })
        .unwrap();

        assert!(connector.subscribe().is_ok());
        assert_eq!(connector.subscribe().unwrap_err(), CloudError::EventsTaken);
    }
}
