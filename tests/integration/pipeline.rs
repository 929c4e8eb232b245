//! End-to-end pipeline: scheduler → worker loop → cache → ingestor
//!
//! Uses the in-process broker and store, a mock HTTP target and a minimal
//! worker loop (probe queue → engine → cache → ack). Covers the happy path
//! of scenario "simple web up": within one interval a result lands in the
//! store with aggregatedStatus=up.

use std::sync::Arc;
use std::time::Duration;

use guardant::broker::{Broker, Disposition, probe_queue};
use guardant::cache::CacheHandle;
use guardant::health::Counters;
use guardant::ingest::IngestHandle;
use guardant::model::*;
use guardant::probe::ProbeEngine;
use guardant::scheduler::SchedulerHandle;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::{TestEnv, nest, wait_for, web_service};

/// Minimal worker loop: consume commands, probe, cache, ack.
async fn run_test_worker(env: &TestEnv, region: &str, cache: CacheHandle) {
    let engine = Arc::new(ProbeEngine::new(env.store_dyn()));
    let mut rx = env
        .broker_dyn()
        .subscribe(&probe_queue(region), 4)
        .await
        .expect("subscribe");
    let region = region.to_string();

    tokio::spawn(async move {
        while let Some(delivery) = rx.recv().await {
            let command: ProbeCommand = match delivery.parse_json() {
                Ok(command) => command,
                Err(_) => {
                    delivery.settle(Disposition::DeadLetter).await;
                    continue;
                }
            };
            let result = engine.execute(&command, "test-worker", &region).await;
            match cache.store(result).await {
                Ok(()) => delivery.settle(Disposition::Ack).await,
                Err(_) => delivery.settle(Disposition::NackRequeue).await,
            }
        }
    });
}

#[tokio::test]
async fn test_simple_web_up_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let env = TestEnv::new().await;
    let counters = Counters::new();

    let the_nest = nest();
    let service = web_service(the_nest.id, &server.uri());
    env.seed_nest(&the_nest).await;
    env.seed_service(&service).await;

    // ingestor first so the results queue binding exists before publishes
    let ingestor = IngestHandle::spawn(env.store_dyn(), env.broker_dyn(), counters.clone())
        .await
        .expect("spawn ingest");

    let cache_dir = tempfile::tempdir().expect("tempdir");
    let cache = CacheHandle::spawn(
        cache_dir.path().to_path_buf(),
        env.broker_dyn(),
        counters.clone(),
    )
    .await
    .expect("spawn cache");
    run_test_worker(&env, "eu-west-1", cache.clone()).await;

    let scheduler = SchedulerHandle::spawn(
        env.store_dyn(),
        env.broker_dyn(),
        counters.clone(),
        "test-hub".to_string(),
        Duration::from_secs(5),
        Duration::from_millis(200),
    );

    // the single instance becomes leader, emits, the worker probes and the
    // ingestor materializes LiveStatus
    let live = wait_for(Duration::from_secs(10), || async {
        env.live_status(&service).await
    })
    .await
    .expect("live status never appeared");

    assert_eq!(live.aggregated_status, AggregatedStatus::Up);
    assert_eq!(live.service_id, service.id);
    let region = live.per_region.get("eu-west-1").expect("region observation");
    assert_eq!(region.last_status, ProbeStatus::Up);

    assert!(scheduler.is_leader().await);
    assert!(env.open_incident(&service).await.is_none());

    scheduler.shutdown().await;
    ingestor.shutdown().await;
    cache.shutdown().await;
}

#[tokio::test]
async fn test_second_scheduler_stays_passive() {
    let env = TestEnv::new().await;
    let counters = Counters::new();

    let first = SchedulerHandle::spawn(
        env.store_dyn(),
        env.broker_dyn(),
        counters.clone(),
        "hub-a".to_string(),
        Duration::from_secs(10),
        Duration::from_millis(200),
    );

    // give the first instance time to take the lease
    tokio::time::sleep(Duration::from_millis(300)).await;

    let second = SchedulerHandle::spawn(
        env.store_dyn(),
        env.broker_dyn(),
        counters.clone(),
        "hub-b".to_string(),
        Duration::from_secs(10),
        Duration::from_millis(200),
    );
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(first.is_leader().await);
    assert!(!second.is_leader().await);

    // clean handover: releasing the lease lets the standby take over
    first.shutdown().await;
    let took_over = wait_for(Duration::from_secs(10), || async {
        second.is_leader().await.then_some(())
    })
    .await;
    assert!(took_over.is_some(), "standby never took over");

    second.shutdown().await;
}

#[tokio::test]
async fn test_results_for_unknown_service_are_dropped() {
    let env = TestEnv::new().await;
    let counters = Counters::new();

    let ingestor = IngestHandle::spawn(env.store_dyn(), env.broker_dyn(), counters.clone())
        .await
        .expect("spawn ingest");

    // a result for a service that was never written to the store
    let ghost = web_service(uuid::Uuid::new_v4(), "https://example.com");
    let result = crate::helpers::result_for(&ghost, ProbeStatus::Up);
    env.broker_dyn()
        .publish(
            guardant::broker::EXCHANGE_RESULTS,
            &result.nest_id.to_string(),
            &serde_json::to_vec(&result).unwrap(),
            None,
        )
        .await
        .expect("publish");

    let dropped = wait_for(Duration::from_secs(5), || async {
        (counters.snapshot().get("ingest.dropped").copied() == Some(1)).then_some(())
    })
    .await;
    assert!(dropped.is_some(), "result was not dropped");
    assert!(env.live_status(&ghost).await.is_none());

    ingestor.shutdown().await;
}
