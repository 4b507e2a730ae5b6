//! End-to-end gateway startup and shutdown over in-memory broker and cloud


use fog_connector::cloud::{CloudConnector, CloudError};
use fog_connector::config::GatewayConfig;
use fog_connector::gateway::{GatewayLifecycle, GatewayState, LifecycleTimeouts};
use fog_connector::testing::mocks::{inbound_frame, LoopbackBroker, MockCloudConnector};
use fog_connector::transport::ConnectionState;
use fog_connector::GatewayError;
use gateway_test_helpers::{static_tokens, wait_until, wait_until_async};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> GatewayConfig {
    GatewayConfig::from_toml_str(
        r#"
[gateway]
id = "gw-1"

[broker]
broker_url = "mqtt://localhost:1883"
token_env = "FOG_TEST_TOKEN"

[broker.reconnect]
initial_delay_ms = 10
max_delay_ms = 50

[cloud]
provider = "http"
base_url = "http://localhost:9000/api"

[bridge]
retry_backoff_ms = 10
"#,
    )
    .unwrap()
}

fn gateway(
    broker: &LoopbackBroker,
    cloud: &Arc<MockCloudConnector>,
) -> GatewayLifecycle<LoopbackBroker> {
    GatewayLifecycle::new(
        &config(),
        broker.clone(),
        Arc::clone(cloud) as Arc<dyn CloudConnector>,
        static_tokens("tok-1"),
    )
    .unwrap()
    .with_timeouts(LifecycleTimeouts {
        startup: Duration::from_secs(2),
        drain: Duration::from_secs(2),
    })
}

fn topics(broker: &LoopbackBroker) -> Vec<String> {
    broker.published().into_iter().map(|frame| frame.topic).collect()
}

#[tokio::test]
async fn test_start_forwards_inventory_and_dispatches_commands() {
    let broker = LoopbackBroker::new();
    let cloud = Arc::new(MockCloudConnector::with_devices(["d1", "d2"]));
    let gw = gateway(&broker, &cloud);

    gw.start().await.unwrap();

    assert_eq!(gw.state(), GatewayState::Running);
    assert!(gw.is_ready());
    assert!(gw.health_checks().calculate_overall_health().await);
    assert_eq!(topics(&broker), vec!["fog/cloud/inventory".to_string()]);
    assert_eq!(broker.published()[0].token(), Some("tok-1"));
    assert_eq!(gw.registry().len(), 2);

    let frame = inbound_frame(
        "fog/commands/send",
        json!({"device_id": "d2", "command": {"name": "reboot"}, "correlation_id": "req-1"}),
    );
    assert!(broker.inject(frame).await);

    assert!(wait_until(WAIT, || cloud.calls_for("d2").len() == 1).await);
    assert!(wait_until(WAIT, || topics(&broker).contains(&"fog/devices/d2/command-result".to_string())).await);

    let report = gw.shutdown().await;
    assert_eq!(report.undelivered(), 0);
    assert!(!report.timed_out);
    assert_eq!(gw.state(), GatewayState::Stopped);
    assert_eq!(cloud.stops(), 1);
    assert_eq!(gw.broker().connection_state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_startup_times_out_when_cloud_never_connects() {
    let broker = LoopbackBroker::new();
    let cloud = Arc::new(MockCloudConnector::with_devices(["d1"]));
    cloud.stay_offline_on_start();
    let gw = gateway(&broker, &cloud).with_timeouts(LifecycleTimeouts {
        startup: Duration::from_millis(200),
        drain: Duration::from_secs(1),
    });

    let result = gw.start().await;

    assert!(matches!(result, Err(GatewayError::Startup(_))));
    assert_eq!(gw.state(), GatewayState::Failed);
    assert_eq!(cloud.stops(), 1);
    assert_eq!(gw.broker().connection_state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_startup_fails_when_broker_unreachable() {
    let broker = LoopbackBroker::new();
    broker.set_online(false);
    let cloud = Arc::new(MockCloudConnector::with_devices(["d1"]));
    let gw = gateway(&broker, &cloud);

    let result = gw.start().await;

    assert!(result.is_err());
    assert_eq!(gw.state(), GatewayState::Failed);
    assert!(!gw.is_ready());
}

#[tokio::test]
async fn test_cloud_credential_rejection_is_fatal() {
    let broker = LoopbackBroker::new();
    let cloud = Arc::new(MockCloudConnector::new());
    cloud.fail_start(CloudError::Auth("HTTP 401".to_string()));
    let gw = gateway(&broker, &cloud);

    let error = gw.start().await.unwrap_err();

    assert!(matches!(error, GatewayError::Cloud(CloudError::Auth(_))));
    assert!(error.is_fatal());
    assert_eq!(gw.state(), GatewayState::Failed);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_commands() {
    let broker = LoopbackBroker::new();
    let cloud = Arc::new(MockCloudConnector::with_devices(["d1"]));
    cloud.delay_device("d1", Duration::from_millis(200));
    let gw = gateway(&broker, &cloud);
    gw.start().await.unwrap();

    let frame = inbound_frame(
        "fog/commands/state",
        json!({"device_id": "d1", "state": {"on": true}}),
    );
    assert!(broker.inject(frame).await);
    assert!(wait_until(WAIT, || gw.message_handler().pending() == 1).await);

    let report = gw.shutdown().await;

    assert_eq!(report.undelivered(), 0);
    assert_eq!(cloud.calls_for("d1").len(), 1);
}

#[tokio::test]
async fn test_drain_timeout_reports_abandoned_commands() {
    let broker = LoopbackBroker::new();
    let cloud = Arc::new(MockCloudConnector::with_devices(["d1"]));
    cloud.delay_device("d1", Duration::from_secs(10));
    let gw = gateway(&broker, &cloud).with_timeouts(LifecycleTimeouts {
        startup: Duration::from_secs(2),
        drain: Duration::from_millis(100),
    });
    gw.start().await.unwrap();

    for name in ["a", "b"] {
        let frame = inbound_frame(
            "fog/commands/send",
            json!({"device_id": "d1", "command": {"name": name}}),
        );
        assert!(broker.inject(frame).await);
    }
    assert!(wait_until(WAIT, || gw.message_handler().pending() == 2).await);

    let report = gw.shutdown().await;

    assert!(report.timed_out);
    assert_eq!(report.inbound_undelivered, 2);
    assert_eq!(gw.state(), GatewayState::Stopped);
}

#[tokio::test]
async fn test_broker_session_drop_is_survived() {
    let broker = LoopbackBroker::new();
    let cloud = Arc::new(MockCloudConnector::with_devices(["d1"]));
    let gw = gateway(&broker, &cloud);
    gw.start().await.unwrap();

    assert!(broker.drop_session());
    assert!(wait_until(WAIT, || broker.opens() == 2 && gw.is_ready()).await);

    let frame = inbound_frame(
        "fog/commands/send",
        json!({"device_id": "d1", "command": {"name": "after-drop"}}),
    );
    assert!(wait_until_async(WAIT, || broker.inject(frame.clone())).await);
    assert!(wait_until(WAIT, || cloud.calls_for("d1").len() == 1).await);

    gw.shutdown().await;
}
