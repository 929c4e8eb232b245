use std::sync::Arc;

use guardant::broker::AmqpBroker;
use guardant::config::WorkerConfig;
use guardant::health::{self, Counters};
use guardant::store::RedisStore;
use guardant::worker::WorkerNode;
use tokio::sync::watch;
use tracing::{error, info, trace};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();

    let config = WorkerConfig::from_env();
    trace!("started with config: {config:?}");
    if let Err(e) = config.validate() {
        error!("invalid worker configuration: {e}");
        return Err(anyhow::anyhow!("configuration validation failed: {e}"));
    }

    let counters = Counters::new();

    let store = Arc::new(RedisStore::connect(&config.store_url).await?);
    let broker = Arc::new(AmqpBroker::new(config.broker_url.clone()));

    if config.health_port != 0 {
        health::serve(config.health_port, health::router(counters.clone())).await?;
    }

    let node = WorkerNode::new(config, store, broker, counters);
    info!("worker {} starting", node.worker_id());

    // shutdown signal propagated to every loop
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received shutdown signal"),
            Err(err) => error!("unable to listen for shutdown signal: {err}"),
        }
        let _ = shutdown_tx.send(true);
    });

    node.run(shutdown_rx).await?;
    info!("worker stopped");

    Ok(())
}
