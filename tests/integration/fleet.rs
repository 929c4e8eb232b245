//! Fleet plumbing: heartbeats over the broker, per-worker control routing,
//! and the public registration route

use std::time::Duration;

use guardant::broker::{Broker, EXCHANGE_CONTROL, EXCHANGE_HEARTBEAT, control_queue};
use guardant::health::{self, Counters};
use guardant::model::*;
use guardant::registry::{self, Registry, WorkerFilter};
use tokio::sync::watch;

use crate::helpers::{TestEnv, wait_for};

fn registration(worker_id: &str) -> RegistrationRequest {
    RegistrationRequest {
        worker_id: worker_id.to_string(),
        owner_email: "ops@example.com".to_string(),
        region_hint: Some("eu-west-1".to_string()),
        capabilities: Capabilities::default(),
        version: "0.4.0".to_string(),
    }
}

#[tokio::test]
async fn test_heartbeat_over_broker_activates_worker() {
    let env = TestEnv::new().await;
    let counters = Counters::new();
    let registry = Registry::new(env.store_dyn(), &counters);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = tokio::spawn(registry::run_heartbeat_listener(
        registry.clone(),
        env.broker_dyn(),
        shutdown_rx,
    ));
    // give the listener time to bind the queue
    tokio::time::sleep(Duration::from_millis(100)).await;

    registry.register(registration("w-1")).await.unwrap();
    registry.approve("w-1", "eu-west-1").await.unwrap();

    let heartbeat = Heartbeat {
        worker_id: "w-1".to_string(),
        ts: chrono::Utc::now(),
        counters_completed: 7,
        counters_failed: 0,
        inflight: 1,
        cpu: 3.0,
        mem: 2048,
    };
    env.broker_dyn()
        .publish(
            EXCHANGE_HEARTBEAT,
            "",
            &serde_json::to_vec(&heartbeat).unwrap(),
            None,
        )
        .await
        .unwrap();

    let activated = wait_for(Duration::from_secs(5), || async {
        let workers = registry.list(WorkerFilter::default()).await.ok()?;
        workers
            .iter()
            .any(|w| w.id == "w-1" && w.status == WorkerStatus::Active)
            .then_some(())
    })
    .await;
    assert!(activated.is_some(), "heartbeat never activated the worker");

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), listener).await;
}

#[tokio::test]
async fn test_control_messages_route_per_worker() {
    let env = TestEnv::new().await;

    let mut rx_one = env
        .broker_dyn()
        .subscribe(&control_queue("w-1"), 1)
        .await
        .unwrap();
    let mut rx_two = env
        .broker_dyn()
        .subscribe(&control_queue("w-2"), 1)
        .await
        .unwrap();

    env.broker_dyn()
        .publish(
            EXCHANGE_CONTROL,
            &control_queue("w-1"),
            &serde_json::to_vec(&ControlMessage::Drain).unwrap(),
            None,
        )
        .await
        .unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(2), rx_one.recv())
        .await
        .expect("w-1 never got its control message")
        .unwrap();
    let message: ControlMessage = delivery.parse_json().unwrap();
    assert_eq!(message, ControlMessage::Drain);
    delivery
        .settle(guardant::broker::Disposition::Ack)
        .await;

    // w-2 must not see it
    let stray = tokio::time::timeout(Duration::from_millis(300), rx_two.recv()).await;
    assert!(stray.is_err(), "control message leaked to another worker");
}

#[tokio::test]
async fn test_public_registration_route() {
    let env = TestEnv::new().await;
    let counters = Counters::new();
    let registry = Registry::new(env.store_dyn(), &counters);

    let router = health::router(counters.clone()).merge(registry::api_router(registry.clone()));
    let addr = health::serve(0, router).await.unwrap();
    let base = format!("http://{addr}");
    let client = reqwest::Client::new();

    // first contact: 202 pending
    let response = client
        .post(format!("{base}/api/public/workers/register"))
        .json(&registration("w-http"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    let body: RegistrationResponse = response.json().await.unwrap();
    assert_eq!(body.status, WorkerStatus::Pending);
    assert!(body.broker_credentials.is_none());

    // approval flips the next poll to 200 with credentials
    registry.approve("w-http", "us-east-1").await.unwrap();
    let response = client
        .post(format!("{base}/api/public/workers/register"))
        .json(&registration("w-http"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: RegistrationResponse = response.json().await.unwrap();
    assert_eq!(body.status, WorkerStatus::Approved);
    assert_eq!(body.region_id.as_deref(), Some("us-east-1"));
    assert!(body.broker_credentials.is_some());

    // health endpoint serves liveness and counters
    let health = client.get(format!("{base}/healthz")).send().await.unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);
    let counters_body: serde_json::Value = client
        .get(format!("{base}/counters"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(counters_body["registry.registrations"].as_u64().unwrap() >= 2);
}
