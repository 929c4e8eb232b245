use std::collections::BTreeSet;
use std::sync::Arc;

use guardant::aggregate::{AggregatorHandle, JsonlSink};
use guardant::broker::{AmqpBroker, Broker};
use guardant::config::HubConfig;
use guardant::health::{self, Counters};
use guardant::ingest::IngestHandle;
use guardant::model::Service;
use guardant::notify::{DispatcherHandle, WebhookDeliveryHandle};
use guardant::registry::{self, Registry};
use guardant::scheduler::SchedulerHandle;
use guardant::store::{RedisStore, StateStore, keys};
use tokio::sync::watch;
use tracing::{error, info, trace, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

fn init() {
    let filter = EnvFilter::try_from_env("GUARDANT_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info,guardant=debug"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact(),
        )
        .with(filter)
        .init();
}

/// Collect every region referenced by an active service, for topology setup.
async fn configured_regions(store: &dyn StateStore) -> anyhow::Result<Vec<String>> {
    let rows = store.scan_prefix(keys::SERVICE_PREFIX).await?;
    let mut regions = BTreeSet::new();
    for (key, value) in rows {
        if key
            .strip_prefix(keys::SERVICE_PREFIX)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .is_none()
        {
            continue;
        }
        if let Ok(service) = serde_json::from_str::<Service>(&value) {
            regions.extend(service.monitoring.regions);
        }
    }
    Ok(regions.into_iter().collect())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();

    let config = HubConfig::from_env();
    trace!("started with config: {config:?}");
    if let Err(e) = config.validate() {
        error!("invalid hub configuration: {e}");
        return Err(anyhow::anyhow!("configuration validation failed: {e}"));
    }

    let counters = Counters::new();
    let store: Arc<dyn StateStore> = Arc::new(RedisStore::connect(&config.store_url).await?);
    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new(config.broker_url.clone()));

    let regions = configured_regions(store.as_ref()).await?;
    broker.declare_topology(&regions).await?;
    info!("broker topology declared for {} regions", regions.len());

    // registry + public registration route on the health listener
    let registry = Registry::new(store.clone(), &counters);
    let router = health::router(counters.clone()).merge(registry::api_router(registry.clone()));
    health::serve(config.health_port, router).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let heartbeat_listener = tokio::spawn(registry::run_heartbeat_listener(
        registry.clone(),
        broker.clone(),
        shutdown_rx.clone(),
    ));
    info!("heartbeat listener started");

    let scheduler = SchedulerHandle::spawn(
        store.clone(),
        broker.clone(),
        counters.clone(),
        format!("hub-{}", Uuid::new_v4()),
        config.lease_ttl,
        config.poll_interval,
    );
    info!("scheduler started");

    let ingestor = IngestHandle::spawn(store.clone(), broker.clone(), counters.clone()).await?;
    info!("result ingestor started");

    let sink = Arc::new(JsonlSink::open(&config.aggregate_path).await?);
    let aggregator = AggregatorHandle::spawn(broker.clone(), sink, counters.clone()).await?;
    info!("metrics aggregator started");

    let dispatcher = DispatcherHandle::spawn(store.clone(), broker.clone(), counters.clone()).await?;
    let webhooks = WebhookDeliveryHandle::spawn(broker.clone(), counters.clone()).await?;
    info!("notification dispatcher started");

    info!("all actors started, press Ctrl+C to shut down");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal, stopping actors..."),
        Err(err) => error!("unable to listen for shutdown signal: {err}"),
    }
    let _ = shutdown_tx.send(true);

    // stop the command source first, then the consumers behind it
    info!("shutting down scheduler...");
    scheduler.shutdown().await;

    info!("shutting down ingestor...");
    ingestor.shutdown().await;

    info!("shutting down aggregator...");
    aggregator.shutdown().await;

    info!("shutting down notification path...");
    dispatcher.shutdown().await;
    webhooks.shutdown().await;

    if let Err(e) = tokio::time::timeout(config.drain_deadline, heartbeat_listener).await {
        warn!("heartbeat listener did not stop in time: {e}");
    }

    info!("all actors stopped, exiting");
    Ok(())
}
