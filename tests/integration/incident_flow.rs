//! Incident lifecycle: open after k downs, resolve after r ups, with signed
//! webhook delivery at both transitions
//!
//! Results are fed straight onto the results exchange; the ingestor,
//! dispatcher and webhook delivery worker run as they would in the hub.

use std::time::Duration;

use guardant::broker::{Broker, EXCHANGE_RESULTS};
use guardant::health::Counters;
use guardant::ingest::IngestHandle;
use guardant::model::*;
use guardant::notify::{self, DispatcherHandle, WebhookDeliveryHandle};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::{TestEnv, nest, result_for, wait_for, web_service};

async fn publish_result(env: &TestEnv, result: &ProbeResult) {
    env.broker_dyn()
        .publish(
            EXCHANGE_RESULTS,
            &result.nest_id.to_string(),
            &serde_json::to_vec(result).unwrap(),
            None,
        )
        .await
        .expect("publish result");
}

struct IncidentRig {
    env: TestEnv,
    counters: Counters,
    ingestor: IngestHandle,
    dispatcher: DispatcherHandle,
    webhooks: WebhookDeliveryHandle,
}

impl IncidentRig {
    async fn start() -> Self {
        let env = TestEnv::new().await;
        let counters = Counters::new();
        let ingestor = IngestHandle::spawn(env.store_dyn(), env.broker_dyn(), counters.clone())
            .await
            .expect("spawn ingest");
        let dispatcher =
            DispatcherHandle::spawn(env.store_dyn(), env.broker_dyn(), counters.clone())
                .await
                .expect("spawn dispatcher");
        let webhooks = WebhookDeliveryHandle::spawn_with_retry_base(
            env.broker_dyn(),
            counters.clone(),
            Duration::from_millis(20),
        )
        .await
        .expect("spawn webhook delivery");

        Self {
            env,
            counters,
            ingestor,
            dispatcher,
            webhooks,
        }
    }

    async fn stop(self) {
        self.ingestor.shutdown().await;
        self.dispatcher.shutdown().await;
        self.webhooks.shutdown().await;
    }
}

#[tokio::test]
async fn test_incident_opens_after_two_downs_and_webhook_fires() {
    let receiver = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&receiver)
        .await;

    let rig = IncidentRig::start().await;
    let the_nest = nest();
    let mut service = web_service(the_nest.id, "https://target.example");
    service.notifications.webhooks = vec![format!("{}/hook", receiver.uri())];
    rig.env.seed_nest(&the_nest).await;
    rig.env.seed_service(&service).await;

    // first down: suspected, no incident yet
    publish_result(&rig.env, &result_for(&service, ProbeStatus::Down)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rig.env.open_incident(&service).await.is_none());

    // second down: incident opens
    publish_result(&rig.env, &result_for(&service, ProbeStatus::Down)).await;
    let incident = wait_for(Duration::from_secs(5), || async {
        rig.env.open_incident(&service).await
    })
    .await
    .expect("incident never opened");

    assert_eq!(incident.reason, ErrorClass::HttpStatus);
    assert!(incident.closed_at.is_none());
    assert_eq!(incident.affected_checks, 2);

    // the webhook arrives, signed with the nest secret
    let request = wait_for(Duration::from_secs(5), || async {
        receiver.received_requests().await.and_then(|reqs| reqs.into_iter().next())
    })
    .await
    .expect("webhook never delivered");

    let body = String::from_utf8(request.body.clone()).unwrap();
    let signature = request.headers.get("X-GuardAnt-Signature").unwrap();
    let timestamp = request.headers.get("X-GuardAnt-Timestamp").unwrap();
    let now = chrono::Utc::now().timestamp();
    assert!(notify::verify(
        "super-secret",
        timestamp.to_str().unwrap(),
        &body,
        signature.to_str().unwrap(),
        now,
        notify::SIGNATURE_MAX_AGE_SECS,
    ));

    let event: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(event["type"], "incident-started");
    assert_eq!(event["serviceName"], "checkout-api");

    rig.stop().await;
}

#[tokio::test]
async fn test_recovery_resolves_and_notifies() {
    let receiver = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&receiver)
        .await;

    let rig = IncidentRig::start().await;
    let the_nest = nest();
    let mut service = web_service(the_nest.id, "https://target.example");
    service.notifications.webhooks = vec![receiver.uri()];
    rig.env.seed_nest(&the_nest).await;
    rig.env.seed_service(&service).await;

    for _ in 0..2 {
        publish_result(&rig.env, &result_for(&service, ProbeStatus::Down)).await;
    }
    wait_for(Duration::from_secs(5), || async {
        rig.env.open_incident(&service).await
    })
    .await
    .expect("incident never opened");

    // two consecutive ups resolve it
    for _ in 0..2 {
        publish_result(&rig.env, &result_for(&service, ProbeStatus::Up)).await;
    }
    let resolved = wait_for(Duration::from_secs(5), || async {
        match rig.env.open_incident(&service).await {
            None => Some(()),
            Some(_) => None,
        }
    })
    .await;
    assert!(resolved.is_some(), "incident never resolved");

    // both transition webhooks arrive
    let kinds = wait_for(Duration::from_secs(5), || async {
        let requests = receiver.received_requests().await.unwrap_or_default();
        let kinds: Vec<String> = requests
            .iter()
            .filter_map(|r| serde_json::from_slice::<serde_json::Value>(&r.body).ok())
            .filter_map(|v| v["type"].as_str().map(str::to_string))
            .collect();
        (kinds.len() >= 2).then_some(kinds)
    })
    .await
    .expect("webhooks never delivered");

    assert!(kinds.contains(&"incident-started".to_string()));
    assert!(kinds.contains(&"incident-resolved".to_string()));

    rig.stop().await;
}

#[tokio::test]
async fn test_duplicate_results_are_idempotent() {
    let rig = IncidentRig::start().await;
    let the_nest = nest();
    let service = web_service(the_nest.id, "https://target.example");
    rig.env.seed_nest(&the_nest).await;
    rig.env.seed_service(&service).await;

    // the same down result delivered three times counts once
    let down = result_for(&service, ProbeStatus::Down);
    for _ in 0..3 {
        publish_result(&rig.env, &down).await;
    }

    let deduped = wait_for(Duration::from_secs(5), || async {
        (rig.counters.snapshot().get("ingest.duplicates").copied() == Some(2)).then_some(())
    })
    .await;
    assert!(deduped.is_some(), "duplicates were not detected");

    // one distinct down observed: still suspected, no incident
    assert!(rig.env.open_incident(&service).await.is_none());

    // a second distinct down opens it
    publish_result(&rig.env, &result_for(&service, ProbeStatus::Down)).await;
    let incident = wait_for(Duration::from_secs(5), || async {
        rig.env.open_incident(&service).await
    })
    .await
    .expect("incident never opened");
    assert_eq!(incident.affected_checks, 2);

    rig.stop().await;
}

#[tokio::test]
async fn test_webhook_retries_until_receiver_recovers() {
    let receiver = MockServer::start().await;
    // two failures, then success
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&receiver)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&receiver)
        .await;

    let rig = IncidentRig::start().await;
    let the_nest = nest();
    let mut service = web_service(the_nest.id, "https://target.example");
    service.alert_threshold = 1;
    service.notifications.webhooks = vec![receiver.uri()];
    rig.env.seed_nest(&the_nest).await;
    rig.env.seed_service(&service).await;

    publish_result(&rig.env, &result_for(&service, ProbeStatus::Down)).await;

    let delivered = wait_for(Duration::from_secs(10), || async {
        (rig.counters
            .snapshot()
            .get("notify.webhooks_delivered")
            .copied()
            == Some(1))
        .then_some(())
    })
    .await;
    assert!(delivered.is_some(), "webhook never delivered after retries");

    let requests = receiver.received_requests().await.unwrap_or_default();
    assert!(requests.len() >= 3, "expected retries, saw {}", requests.len());

    rig.stop().await;
}
