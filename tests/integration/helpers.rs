//! Shared builders for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use guardant::broker::{Broker, MemoryBroker};
use guardant::model::*;
use guardant::store::{self, MemoryStore, StateStore, keys};
use uuid::Uuid;

/// One in-process deployment: memory store + memory broker
pub struct TestEnv {
    pub store: Arc<MemoryStore>,
    pub broker: Arc<MemoryBroker>,
}

impl TestEnv {
    pub async fn new() -> Self {
        let broker = Arc::new(MemoryBroker::new());
        broker
            .declare_topology(&["eu-west-1".to_string()])
            .await
            .expect("topology");
        Self {
            store: Arc::new(MemoryStore::new()),
            broker,
        }
    }

    pub fn store_dyn(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    pub fn broker_dyn(&self) -> Arc<dyn guardant::broker::Broker> {
        self.broker.clone()
    }

    pub async fn seed_nest(&self, nest: &Nest) {
        store::put_json(self.store.as_ref(), &keys::nest(nest.id), nest, None)
            .await
            .expect("seed nest");
    }

    pub async fn seed_service(&self, service: &Service) {
        store::put_json(
            self.store.as_ref(),
            &keys::service(service.id),
            service,
            None,
        )
        .await
        .expect("seed service");
    }

    pub async fn live_status(&self, service: &Service) -> Option<LiveStatus> {
        store::get_json(
            self.store.as_ref(),
            &keys::status(service.nest_id, service.id),
        )
        .await
        .expect("read status")
    }

    pub async fn open_incident(&self, service: &Service) -> Option<Incident> {
        store::get_json(
            self.store.as_ref(),
            &keys::incident(service.nest_id, service.id),
        )
        .await
        .expect("read incident")
    }
}

pub fn nest() -> Nest {
    Nest {
        id: Uuid::new_v4(),
        subdomain: "acme".to_string(),
        name: "Acme Corp".to_string(),
        owner_user_id: Uuid::new_v4(),
        webhook_secret: Some("super-secret".to_string()),
        created_at: Utc::now(),
    }
}

/// A web service probed from eu-west-1 with fast incident thresholds
pub fn web_service(nest_id: Uuid, target: &str) -> Service {
    Service {
        id: Uuid::new_v4(),
        nest_id,
        name: "checkout-api".to_string(),
        probe: ProbeSpec::Web(WebConfig::default()),
        target: target.to_string(),
        interval_seconds: 60,
        timeout_ms: 5_000,
        monitoring: Monitoring {
            regions: vec!["eu-west-1".to_string()],
            strategy: Strategy::All,
        },
        notifications: NotificationTargets::default(),
        alert_threshold: 2,
        recovery_threshold: 2,
        is_active: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn result_for(service: &Service, status: ProbeStatus) -> ProbeResult {
    ProbeResult {
        result_id: Uuid::new_v4(),
        command_id: Uuid::new_v4(),
        service_id: service.id,
        nest_id: service.nest_id,
        worker_id: "test-worker".to_string(),
        region_id: "eu-west-1".to_string(),
        started_at: Utc::now(),
        duration_ms: 42,
        status,
        status_code: match status {
            ProbeStatus::Up => Some(200),
            _ => Some(500),
        },
        message: match status {
            ProbeStatus::Up => None,
            _ => Some("HTTP error status: 500".to_string()),
        },
        error_class: match status {
            ProbeStatus::Up => None,
            _ => Some(ErrorClass::HttpStatus),
        },
        details: None,
    }
}

pub fn command_for(service: &Service) -> ProbeCommand {
    let now = guardant::util::now_ms();
    ProbeCommand {
        command_id: Uuid::new_v4(),
        service_snapshot: service.snapshot(),
        scheduled_at: now,
        deadline: now + service.interval_ms(),
        attempt: 1,
        revision: 1,
    }
}

/// Poll until `check` returns Some or the timeout passes.
pub async fn wait_for<T, F, Fut>(timeout: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(found) = check().await {
            return Some(found);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
