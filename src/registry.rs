//! Worker registry: fleet membership, approval and liveness
//!
//! Workers self-register and wait for operator approval; approval issues the
//! broker credentials they need to consume their region's probe queue. An
//! `active` worker whose heartbeat is older than 90 seconds is reported
//! `stale` and excluded from capacity calculations. The operator surface is
//! in-process (`Registry` methods); the only HTTP route is the public worker
//! registration endpoint mounted by the hub.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::broker::{Broker, Delivery, Disposition, QUEUE_HEARTBEATS};
use crate::health::{Counter, Counters};
use crate::model::{
    BrokerCredentials, Heartbeat, RegistrationRequest, RegistrationResponse, WorkerAnt,
    WorkerStatus,
};
use crate::store::{self, StateStore, keys};

/// An `active` worker with no heartbeat for this long is stale
/// (3× the default heartbeat interval)
pub const STALE_AFTER: Duration = Duration::from_secs(90);

/// Fleet view filter
#[derive(Debug, Default, Clone)]
pub struct WorkerFilter {
    pub region_id: Option<String>,
    pub status: Option<WorkerStatus>,
}

/// Registry over the state store; single writer for worker rows
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn StateStore>,
    registrations: Counter,
    heartbeats: Counter,
}

impl Registry {
    pub fn new(store: Arc<dyn StateStore>, counters: &Counters) -> Self {
        Self {
            store,
            registrations: counters.counter("registry.registrations"),
            heartbeats: counters.counter("registry.heartbeats"),
        }
    }

    async fn load(&self, worker_id: &str) -> Result<Option<WorkerAnt>> {
        store::get_json(self.store.as_ref(), &keys::worker(worker_id))
            .await
            .context("load worker")
    }

    async fn save(&self, worker: &WorkerAnt) -> Result<()> {
        store::put_json(self.store.as_ref(), &keys::worker(&worker.id), worker, None)
            .await
            .context("store worker")
    }

    /// Self-registration; idempotent per workerId.
    ///
    /// Already-approved workers get their credentials back immediately so a
    /// re-registering worker (restart, self-revoke) resumes without operator
    /// action. Revoked ids stay locked out until an operator clears them.
    #[instrument(skip(self, request), fields(worker = %request.worker_id))]
    pub async fn register(&self, request: RegistrationRequest) -> Result<RegistrationResponse> {
        self.registrations.inc();

        if let Some(mut existing) = self.load(&request.worker_id).await? {
            return match existing.status {
                WorkerStatus::Revoked => {
                    bail!("worker {} is revoked", request.worker_id);
                }
                WorkerStatus::Approved | WorkerStatus::Active | WorkerStatus::Draining => {
                    // refresh what the worker reports about itself
                    existing.capabilities = request.capabilities;
                    existing.version = request.version;
                    self.save(&existing).await?;
                    Ok(RegistrationResponse {
                        status: existing.status,
                        region_id: Some(existing.region_id.clone()),
                        broker_credentials: existing.broker_credentials.clone(),
                        endpoints: None,
                    })
                }
                _ => Ok(RegistrationResponse {
                    status: WorkerStatus::Pending,
                    region_id: None,
                    broker_credentials: None,
                    endpoints: None,
                }),
            };
        }

        let worker = WorkerAnt {
            id: request.worker_id.clone(),
            region_id: request.region_hint.unwrap_or_else(|| "unassigned".to_string()),
            capabilities: request.capabilities,
            version: request.version,
            status: WorkerStatus::Pending,
            owner_email: request.owner_email,
            broker_credentials: None,
            registered_at: Utc::now(),
            last_heartbeat_at: None,
            counters_completed: 0,
            counters_failed: 0,
        };
        self.save(&worker).await?;
        info!("worker {} registered, awaiting approval", worker.id);

        Ok(RegistrationResponse {
            status: WorkerStatus::Pending,
            region_id: None,
            broker_credentials: None,
            endpoints: None,
        })
    }

    /// Operator approval: pin the region, issue credentials.
    ///
    /// The worker turns `active` on its first heartbeat.
    #[instrument(skip(self))]
    pub async fn approve(&self, worker_id: &str, region_id: &str) -> Result<BrokerCredentials> {
        let mut worker = self
            .load(worker_id)
            .await?
            .with_context(|| format!("unknown worker {worker_id}"))?;

        if worker.status == WorkerStatus::Revoked {
            bail!("worker {worker_id} is revoked; clear it first");
        }

        let credentials = BrokerCredentials {
            username: worker_id.to_string(),
            password: Uuid::new_v4().to_string(),
            vhost: "/".to_string(),
        };

        worker.status = WorkerStatus::Approved;
        worker.region_id = region_id.to_string();
        worker.broker_credentials = Some(credentials.clone());
        self.save(&worker).await?;
        info!("worker {worker_id} approved for region {region_id}");

        Ok(credentials)
    }

    #[instrument(skip(self))]
    pub async fn drain(&self, worker_id: &str) -> Result<()> {
        let mut worker = self
            .load(worker_id)
            .await?
            .with_context(|| format!("unknown worker {worker_id}"))?;
        worker.status = WorkerStatus::Draining;
        self.save(&worker).await?;
        debug!("worker {worker_id} draining");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn revoke(&self, worker_id: &str) -> Result<()> {
        let mut worker = self
            .load(worker_id)
            .await?
            .with_context(|| format!("unknown worker {worker_id}"))?;
        worker.status = WorkerStatus::Revoked;
        worker.broker_credentials = None;
        self.save(&worker).await?;
        info!("worker {worker_id} revoked");
        Ok(())
    }

    /// Operator override lifting a revocation; the worker re-registers from
    /// scratch.
    #[instrument(skip(self))]
    pub async fn clear(&self, worker_id: &str) -> Result<()> {
        self.store
            .delete(&keys::worker(worker_id))
            .await
            .context("delete worker")?;
        self.store
            .delete(&keys::worker_heartbeat(worker_id))
            .await
            .context("delete worker heartbeat")?;
        Ok(())
    }

    /// Apply one heartbeat. An approved or stale worker becomes active.
    #[instrument(skip(self, heartbeat), fields(worker = %heartbeat.worker_id))]
    pub async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        self.heartbeats.inc();

        let Some(mut worker) = self.load(&heartbeat.worker_id).await? else {
            trace!("heartbeat from unknown worker, ignoring");
            return Ok(());
        };

        match worker.status {
            WorkerStatus::Revoked => {
                trace!("heartbeat from revoked worker, ignoring");
                return Ok(());
            }
            WorkerStatus::Approved => {
                debug!("worker {} is now active", worker.id);
                worker.status = WorkerStatus::Active;
            }
            _ => {}
        }

        worker.last_heartbeat_at = Some(heartbeat.ts);
        worker.counters_completed = heartbeat.counters_completed;
        worker.counters_failed = heartbeat.counters_failed;
        self.save(&worker).await?;

        self.store
            .put_raw(
                &keys::worker_heartbeat(&worker.id),
                heartbeat.ts.timestamp_millis().to_string(),
                Some(STALE_AFTER),
            )
            .await
            .context("store heartbeat")?;
        Ok(())
    }

    /// Fleet view with the derived `stale` status applied.
    pub async fn list(&self, filter: WorkerFilter) -> Result<Vec<WorkerAnt>> {
        let rows = self
            .store
            .scan_prefix(keys::WORKER_PREFIX)
            .await
            .context("scan workers")?;

        let now = Utc::now();
        let mut workers = Vec::new();
        for (key, value) in rows {
            if key.starts_with("worker:heartbeat:") {
                continue;
            }
            let Ok(mut worker) = serde_json::from_str::<WorkerAnt>(&value) else {
                warn!("skipping unparseable worker row {key}");
                continue;
            };

            if worker.status == WorkerStatus::Active {
                let fresh = worker.last_heartbeat_at.is_some_and(|at| {
                    (now - at).num_seconds() < STALE_AFTER.as_secs() as i64
                });
                if !fresh {
                    worker.status = WorkerStatus::Stale;
                }
            }

            if let Some(region) = &filter.region_id
                && worker.region_id != *region
            {
                continue;
            }
            if let Some(status) = filter.status
                && worker.status != status
            {
                continue;
            }
            workers.push(worker);
        }
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }
}

/// Consume the fleet heartbeat queue and apply each beat to the registry.
pub async fn run_heartbeat_listener(
    registry: Registry,
    broker: Arc<dyn Broker>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let mut deliveries = broker.subscribe(QUEUE_HEARTBEATS, 8).await?;
    debug!("heartbeat listener started");

    loop {
        tokio::select! {
            delivery = deliveries.recv() => {
                let Some(delivery) = delivery else { break };
                apply_heartbeat(&registry, delivery).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    debug!("heartbeat listener stopped");
    Ok(())
}

async fn apply_heartbeat(registry: &Registry, delivery: Delivery) {
    let heartbeat: Heartbeat = match delivery.parse_json() {
        Ok(heartbeat) => heartbeat,
        Err(e) => {
            warn!("invalid heartbeat payload: {e}");
            delivery.settle(Disposition::DeadLetter).await;
            return;
        }
    };
    match registry.heartbeat(&heartbeat).await {
        Ok(()) => delivery.settle(Disposition::Ack).await,
        Err(e) => {
            warn!("failed to apply heartbeat: {e:#}");
            delivery.settle(Disposition::NackRequeue).await;
        }
    }
}

async fn register_route(
    State(registry): State<Registry>,
    Json(request): Json<RegistrationRequest>,
) -> (StatusCode, Json<RegistrationResponse>) {
    match registry.register(request).await {
        Ok(response) => {
            let code = match response.status {
                WorkerStatus::Pending => StatusCode::ACCEPTED,
                _ => StatusCode::OK,
            };
            (code, Json(response))
        }
        Err(e) => {
            warn!("registration rejected: {e:#}");
            (
                StatusCode::FORBIDDEN,
                Json(RegistrationResponse {
                    status: WorkerStatus::Revoked,
                    region_id: None,
                    broker_credentials: None,
                    endpoints: None,
                }),
            )
        }
    }
}

/// Worker bootstrap script served at `GET /install`
const INSTALL_SCRIPT: &str = r#"#!/bin/sh
# GuardAnt worker bootstrap: installs the worker binary and a config file,
# then starts it. Override defaults via environment before piping to sh.
set -eu

GUARDANT_HOME="${GUARDANT_HOME:-$HOME/.guardant}"
GUARDANT_DOWNLOAD_URL="${GUARDANT_DOWNLOAD_URL:-https://github.com/guardant/guardant/releases/latest/download/guardant-worker}"

mkdir -p "$GUARDANT_HOME"
curl -fsSL "$GUARDANT_DOWNLOAD_URL" -o "$GUARDANT_HOME/guardant-worker"
chmod +x "$GUARDANT_HOME/guardant-worker"

if [ ! -f "$GUARDANT_HOME/.env" ]; then
    cat > "$GUARDANT_HOME/.env" <<EOF
GUARDANT_BROKER_URL=${GUARDANT_BROKER_URL:-amqp://127.0.0.1:5672/%2f}
GUARDANT_STORE_URL=${GUARDANT_STORE_URL:-redis://127.0.0.1:6379}
GUARDANT_OWNER_EMAIL=${GUARDANT_OWNER_EMAIL:-operator@localhost}
GUARDANT_CACHE_DIR=$GUARDANT_HOME/cache
EOF
fi

cd "$GUARDANT_HOME" && exec ./guardant-worker
"#;

async fn install_route() -> ([(header::HeaderName, &'static str); 1], &'static str) {
    ([(header::CONTENT_TYPE, "text/x-shellscript")], INSTALL_SCRIPT)
}

/// Public boundary: `POST /api/public/workers/register` and `GET /install`
pub fn api_router(registry: Registry) -> Router {
    Router::new()
        .route("/api/public/workers/register", post(register_route))
        .route("/install", get(install_route))
        .with_state(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Capabilities;
    use crate::store::MemoryStore;

    fn registry() -> Registry {
        Registry::new(Arc::new(MemoryStore::new()), &Counters::new())
    }

    fn request(worker_id: &str) -> RegistrationRequest {
        RegistrationRequest {
            worker_id: worker_id.to_string(),
            owner_email: "ops@example.com".to_string(),
            region_hint: Some("eu-west-1".to_string()),
            capabilities: Capabilities::default(),
            version: "0.4.0".to_string(),
        }
    }

    fn beat(worker_id: &str) -> Heartbeat {
        Heartbeat {
            worker_id: worker_id.to_string(),
            ts: Utc::now(),
            counters_completed: 10,
            counters_failed: 1,
            inflight: 2,
            cpu: 12.5,
            mem: 1024,
        }
    }

    #[tokio::test]
    async fn test_registration_lifecycle() {
        let registry = registry();

        let response = registry.register(request("w-1")).await.unwrap();
        assert_eq!(response.status, WorkerStatus::Pending);
        assert!(response.broker_credentials.is_none());

        // polling again stays pending
        let response = registry.register(request("w-1")).await.unwrap();
        assert_eq!(response.status, WorkerStatus::Pending);

        let credentials = registry.approve("w-1", "eu-west-1").await.unwrap();
        assert_eq!(credentials.username, "w-1");

        // re-registration now returns the credentials
        let response = registry.register(request("w-1")).await.unwrap();
        assert_eq!(response.status, WorkerStatus::Approved);
        assert!(response.broker_credentials.is_some());

        // first heartbeat activates
        registry.heartbeat(&beat("w-1")).await.unwrap();
        let workers = registry.list(WorkerFilter::default()).await.unwrap();
        assert_eq!(workers[0].status, WorkerStatus::Active);
        assert_eq!(workers[0].counters_completed, 10);
    }

    #[tokio::test]
    async fn test_revoked_worker_cannot_reregister() {
        let registry = registry();
        registry.register(request("w-1")).await.unwrap();
        registry.approve("w-1", "eu-west-1").await.unwrap();
        registry.revoke("w-1").await.unwrap();

        assert!(registry.register(request("w-1")).await.is_err());

        // until an operator clears it
        registry.clear("w-1").await.unwrap();
        let response = registry.register(request("w-1")).await.unwrap();
        assert_eq!(response.status, WorkerStatus::Pending);
    }

    #[tokio::test]
    async fn test_stale_derivation() {
        let registry = registry();
        registry.register(request("w-1")).await.unwrap();
        registry.approve("w-1", "eu-west-1").await.unwrap();

        // heartbeat from 2 minutes ago: active on paper, stale in the view
        let mut old_beat = beat("w-1");
        old_beat.ts = Utc::now() - chrono::Duration::seconds(120);
        registry.heartbeat(&old_beat).await.unwrap();

        let workers = registry.list(WorkerFilter::default()).await.unwrap();
        assert_eq!(workers[0].status, WorkerStatus::Stale);

        // a fresh heartbeat brings it back
        registry.heartbeat(&beat("w-1")).await.unwrap();
        let workers = registry.list(WorkerFilter::default()).await.unwrap();
        assert_eq!(workers[0].status, WorkerStatus::Active);
    }

    #[tokio::test]
    async fn test_list_filters() {
        let registry = registry();
        registry.register(request("w-1")).await.unwrap();
        registry.register(request("w-2")).await.unwrap();
        registry.approve("w-1", "eu-west-1").await.unwrap();
        registry.approve("w-2", "us-east-1").await.unwrap();

        let eu = registry
            .list(WorkerFilter {
                region_id: Some("eu-west-1".to_string()),
                status: None,
            })
            .await
            .unwrap();
        assert_eq!(eu.len(), 1);
        assert_eq!(eu[0].id, "w-1");

        let pending = registry
            .list(WorkerFilter {
                region_id: None,
                status: Some(WorkerStatus::Pending),
            })
            .await
            .unwrap();
        assert!(pending.is_empty());
    }
}
