//! Process observability: counters and the health endpoint
//!
//! Every long-running component increments named counters (messages in/out,
//! errors, drops). A small axum router exposes liveness and a counter
//! snapshot for external collectors; there is no other HTTP surface in the
//! core apart from the hub's worker registration route.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tracing::info;

/// A single named counter; cheap to clone and share across tasks
#[derive(Clone, Debug, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Process-wide counter table
#[derive(Clone, Default)]
pub struct Counters {
    inner: Arc<Mutex<BTreeMap<String, Counter>>>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a counter by name.
    pub fn counter(&self, name: &str) -> Counter {
        let mut table = self.inner.lock().expect("counters lock");
        table.entry(name.to_string()).or_default().clone()
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        let table = self.inner.lock().expect("counters lock");
        table
            .iter()
            .map(|(name, counter)| (name.clone(), counter.get()))
            .collect()
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn counters_snapshot(State(counters): State<Counters>) -> Json<BTreeMap<String, u64>> {
    Json(counters.snapshot())
}

/// Build the health router; callers can merge further routes before serving.
pub fn router(counters: Counters) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/counters", get(counters_snapshot))
        .with_state(counters)
}

/// Bind and serve a router in the background; returns the bound address.
pub async fn serve(port: u16, router: Router) -> Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .context("failed to bind health endpoint")?;
    let addr = listener.local_addr()?;
    info!("health endpoint listening on http://{addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("health endpoint stopped: {e}");
        }
    });

    Ok(addr)
}
