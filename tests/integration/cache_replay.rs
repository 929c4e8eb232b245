//! Local cache durability: broker outages and process kills
//!
//! The memory broker's offline switch simulates an outage; opening a second
//! cache on the same directory without a clean shutdown simulates a SIGKILL
//! between probe execution and publish.

use std::time::Duration;

use guardant::broker::{Broker, Disposition, QUEUE_RESULTS_INGEST};
use guardant::cache::CacheHandle;
use guardant::health::Counters;
use guardant::model::ProbeStatus;

use crate::helpers::{TestEnv, nest, result_for, wait_for, web_service};

#[tokio::test]
async fn test_results_survive_broker_outage() {
    let env = TestEnv::new().await;
    let counters = Counters::new();
    let dir = tempfile::tempdir().unwrap();

    let cache = CacheHandle::spawn(
        dir.path().to_path_buf(),
        env.broker_dyn(),
        counters.clone(),
    )
    .await
    .unwrap();

    // broker goes away; stores must still succeed
    env.broker.set_offline(true);
    let service = web_service(nest().id, "https://example.com");
    let mut stored_ids = Vec::new();
    for _ in 0..5 {
        let result = result_for(&service, ProbeStatus::Up);
        stored_ids.push(result.result_id);
        cache.store(result).await.expect("store during outage");
    }

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.pending, 5);

    // broker recovers; the flusher drains the ring
    env.broker.set_offline(false);
    let drained = wait_for(Duration::from_secs(30), || async {
        let stats = cache.stats().await?;
        (stats.pending == 0).then_some(())
    })
    .await;
    assert!(drained.is_some(), "cache never drained after recovery");

    // every stored result is on the results queue
    let mut rx = env
        .broker_dyn()
        .subscribe(QUEUE_RESULTS_INGEST, 8)
        .await
        .unwrap();
    let mut seen = Vec::new();
    for _ in 0..5 {
        let delivery = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("queue closed");
        let result: guardant::model::ProbeResult = delivery.parse_json().unwrap();
        seen.push(result.result_id);
        delivery.settle(Disposition::Ack).await;
    }
    for id in stored_ids {
        assert!(seen.contains(&id), "result {id} never reached the broker");
    }

    cache.shutdown().await;
}

#[tokio::test]
async fn test_replay_after_kill() {
    let env = TestEnv::new().await;
    let counters = Counters::new();
    let dir = tempfile::tempdir().unwrap();

    env.broker.set_offline(true);

    // first incarnation stores three results and is killed (no shutdown,
    // no flush; the handle is simply dropped)
    let service = web_service(nest().id, "https://example.com");
    let mut stored_ids = Vec::new();
    {
        let cache = CacheHandle::spawn(
            dir.path().to_path_buf(),
            env.broker_dyn(),
            counters.clone(),
        )
        .await
        .unwrap();
        for _ in 0..3 {
            let result = result_for(&service, ProbeStatus::Down);
            stored_ids.push(result.result_id);
            cache.store(result).await.unwrap();
        }
        // dropped without shutdown, like a SIGKILL
    }

    // second incarnation replays the log once the broker is back
    env.broker.set_offline(false);
    let cache = CacheHandle::spawn(
        dir.path().to_path_buf(),
        env.broker_dyn(),
        counters.clone(),
    )
    .await
    .unwrap();

    let mut rx = env
        .broker_dyn()
        .subscribe(QUEUE_RESULTS_INGEST, 8)
        .await
        .unwrap();
    let mut seen = Vec::new();
    for _ in 0..3 {
        let delivery = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for replayed result")
            .expect("queue closed");
        let result: guardant::model::ProbeResult = delivery.parse_json().unwrap();
        seen.push(result.result_id);
        delivery.settle(Disposition::Ack).await;
    }
    for id in stored_ids {
        assert!(seen.contains(&id), "result {id} was lost by the kill");
    }

    cache.shutdown().await;
}

#[tokio::test]
async fn test_clean_restart_does_not_duplicate() {
    let env = TestEnv::new().await;
    let counters = Counters::new();
    let dir = tempfile::tempdir().unwrap();

    let service = web_service(nest().id, "https://example.com");

    // first incarnation flushes successfully and shuts down cleanly
    {
        let cache = CacheHandle::spawn(
            dir.path().to_path_buf(),
            env.broker_dyn(),
            counters.clone(),
        )
        .await
        .unwrap();
        cache
            .store(result_for(&service, ProbeStatus::Up))
            .await
            .unwrap();
        cache.force_flush().await.unwrap();
        cache.shutdown().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // second incarnation must find an empty log
    let cache = CacheHandle::spawn(
        dir.path().to_path_buf(),
        env.broker_dyn(),
        counters.clone(),
    )
    .await
    .unwrap();
    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.pending, 0, "flushed results were replayed");

    cache.shutdown().await;
}
