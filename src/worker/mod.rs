//! Worker node: registration, probe consumption, heartbeats, control
//!
//! A worker's life:
//!
//! ```text
//! register → pending ──approve──▶ active ──drain──▶ draining ──stop──▶ stopped
//!                │                   │
//!                └──reject──▶ revoked└──revoke──▶ revoked
//! ```
//!
//! Steady state is a single cooperative loop: the region's shared probe
//! queue feeds a bounded pool (`maxConcurrency` permits), each command runs
//! through the probe engine, the result goes into the local cache, and only
//! then is the command acknowledged. A crash before the cache write causes
//! redelivery; a crash after it is covered by the cache's replay.

pub mod region;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sysinfo::System;
use tokio::sync::{Semaphore, watch};
use tokio::time::interval;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::broker::{
    Broker, Delivery, Disposition, EXCHANGE_HEARTBEAT, EXCHANGE_PROBES, control_queue,
    probe_queue, probe_routing_key,
};
use crate::cache::CacheHandle;
use crate::config::WorkerConfig;
use crate::health::{Counter, Counters};
use crate::model::{
    Capabilities, ControlMessage, ErrorClass, Heartbeat, ProbeCommand, ProbeKind, ProbeResult,
    ProbeStatus, RegistrationRequest, WorkerStatus,
};
use crate::probe::ProbeEngine;
use crate::store::StateStore;

/// Sustained broker publish failure beyond this triggers self-revocation
const PUBLISH_FAILURE_LIMIT: Duration = Duration::from_secs(10 * 60);

/// How the serve loop ended
enum Exit {
    /// Process shutdown (signal, drain or update)
    Stop,
    /// Subscriptions closed, go back to registration
    Reregister,
}

/// One long-lived worker process
pub struct WorkerNode {
    config: WorkerConfig,
    store: Arc<dyn StateStore>,
    broker: Arc<dyn Broker>,
    counters: Counters,
    client: reqwest::Client,
    worker_id: String,
}

impl WorkerNode {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn StateStore>,
        broker: Arc<dyn Broker>,
        counters: Counters,
    ) -> Self {
        let hostname = System::host_name().unwrap_or_else(|| "unknown-host".to_string());
        let worker_id = format!("{hostname}-{}", Uuid::new_v4());

        Self {
            config,
            store,
            broker,
            counters,
            client: reqwest::Client::builder()
                .user_agent(crate::USER_AGENT)
                .build()
                .expect("Failed to build HTTP client"),
            worker_id,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until shutdown. Revocation loops back into registration.
    #[instrument(skip(self, shutdown), fields(worker = %self.worker_id))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let region_hint = match &self.config.region_override {
                Some(region) => region.clone(),
                None => region::detect_region(&self.client)
                    .await
                    .unwrap_or_else(|| {
                        warn!("region detection failed, assuming {}", region::DEFAULT_REGION);
                        region::DEFAULT_REGION.to_string()
                    }),
            };

            let Some(region) = self.register_until_approved(&region_hint, &mut shutdown).await?
            else {
                return Ok(()); // shutdown while waiting
            };
            info!("approved for region {region}");

            match self.serve(&region, shutdown.clone()).await? {
                Exit::Stop => return Ok(()),
                Exit::Reregister => {
                    warn!("re-registering after revocation");
                    continue;
                }
            }
        }
    }

    /// POST the registration and poll until the operator approves.
    async fn register_until_approved(
        &self,
        region_hint: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<String>> {
        let request = RegistrationRequest {
            worker_id: self.worker_id.clone(),
            owner_email: self.config.owner_email.clone(),
            region_hint: Some(region_hint.to_string()),
            capabilities: Capabilities {
                types: ProbeKind::ALL.to_vec(),
                max_concurrency: self.config.max_concurrency,
            },
            version: self.config.version.clone(),
        };

        let mut poll = interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = poll.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(None);
                    }
                    continue;
                }
            }

            let response = self
                .client
                .post(&self.config.register_url)
                .json(&request)
                .timeout(Duration::from_secs(10))
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    warn!("registration endpoint unreachable: {e}");
                    continue;
                }
            };

            if response.status() == reqwest::StatusCode::FORBIDDEN {
                warn!("registration rejected (revoked), retrying later");
                tokio::time::sleep(Duration::from_secs(55)).await;
                continue;
            }

            let body: crate::model::RegistrationResponse = match response.json().await {
                Ok(body) => body,
                Err(e) => {
                    warn!("unparseable registration response: {e}");
                    continue;
                }
            };

            match body.status {
                WorkerStatus::Approved | WorkerStatus::Active | WorkerStatus::Draining => {
                    let region = body
                        .region_id
                        .unwrap_or_else(|| region_hint.to_string());
                    return Ok(Some(region));
                }
                WorkerStatus::Pending => {
                    trace!("still pending approval");
                }
                other => {
                    warn!("unexpected registration status {other:?}, retrying");
                }
            }
        }
    }

    /// Steady-state loop for one approved session.
    async fn serve(&self, region: &str, mut shutdown: watch::Receiver<bool>) -> Result<Exit> {
        let cache = CacheHandle::spawn(
            self.config.cache_dir.clone(),
            self.broker.clone(),
            self.counters.clone(),
        )
        .await
        .context("start result cache")?;

        let engine = Arc::new(ProbeEngine::new(self.store.clone()));
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency as usize));
        let inflight = Arc::new(AtomicU32::new(0));
        let completed = self.counters.counter("worker.completed");
        let failed = self.counters.counter("worker.failed");

        let mut probe_rx = self
            .broker
            .subscribe(&probe_queue(region), self.config.max_concurrency as u16)
            .await
            .context("subscribe probe queue")?;
        let mut control_rx = self
            .broker
            .subscribe(&control_queue(&self.worker_id), 1)
            .await
            .context("subscribe control queue")?;

        let heartbeat_task = tokio::spawn(heartbeat_loop(
            self.broker.clone(),
            self.worker_id.clone(),
            self.config.heartbeat_secs,
            completed.clone(),
            failed.clone(),
            inflight.clone(),
            shutdown.clone(),
        ));

        let mut paused = false;
        let mut watchdog = interval(Duration::from_secs(30));

        let exit = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("shutdown signal received, draining");
                        break Exit::Stop;
                    }
                }

                Some(control) = control_rx.recv() => {
                    match self.handle_control(control).await {
                        ControlOutcome::Continue => {}
                        ControlOutcome::Pause => paused = true,
                        ControlOutcome::Resume => paused = false,
                        ControlOutcome::Drain => break Exit::Stop,
                        ControlOutcome::Revoke => break Exit::Reregister,
                    }
                }

                Some(delivery) = probe_rx.recv(), if !paused && semaphore.available_permits() > 0 => {
                    let permit = semaphore
                        .clone()
                        .try_acquire_owned()
                        .expect("guarded by available_permits");
                    inflight.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(execute_one(
                        delivery,
                        engine.clone(),
                        cache.clone(),
                        self.broker.clone(),
                        self.worker_id.clone(),
                        region.to_string(),
                        completed.clone(),
                        failed.clone(),
                        inflight.clone(),
                        permit,
                    ));
                }

                _ = watchdog.tick() => {
                    if let Some(stats) = cache.stats().await
                        && stats.pending > 0
                        && stats.since_last_flush_ok > PUBLISH_FAILURE_LIMIT
                    {
                        error!(
                            "broker unreachable for {:?} with {} results cached, self-revoking",
                            stats.since_last_flush_ok, stats.pending
                        );
                        break Exit::Reregister;
                    }
                }

                else => {
                    warn!("broker subscriptions closed");
                    break Exit::Reregister;
                }
            }
        };

        // let in-flight probes finish, bounded by the drain deadline
        drop(probe_rx);
        let drained = tokio::time::timeout(
            self.config.drain_deadline,
            semaphore.acquire_many(self.config.max_concurrency),
        )
        .await;
        if drained.is_err() {
            warn!(
                "drain deadline passed with {} probes in flight",
                inflight.load(Ordering::Relaxed)
            );
        }

        if let Err(e) = cache.force_flush().await {
            warn!("final cache flush failed, results stay on disk: {e:#}");
        }
        cache.shutdown().await;
        heartbeat_task.abort();

        Ok(exit)
    }

    async fn handle_control(&self, delivery: Delivery) -> ControlOutcome {
        let message: ControlMessage = match delivery.parse_json() {
            Ok(message) => message,
            Err(e) => {
                warn!("invalid control message: {e}");
                delivery.settle(Disposition::DeadLetter).await;
                return ControlOutcome::Continue;
            }
        };
        debug!("control message: {message:?}");
        delivery.settle(Disposition::Ack).await;

        match message {
            ControlMessage::Pause => ControlOutcome::Pause,
            ControlMessage::Resume => ControlOutcome::Resume,
            ControlMessage::Drain => {
                info!("drain requested, finishing in-flight probes");
                ControlOutcome::Drain
            }
            ControlMessage::Revoke => {
                warn!("revoked by operator");
                ControlOutcome::Revoke
            }
            ControlMessage::Update { binary_url } => {
                // the supervisor swaps the binary; we just exit cleanly
                info!("update requested ({binary_url}), restarting gracefully");
                ControlOutcome::Drain
            }
        }
    }
}

enum ControlOutcome {
    Continue,
    Pause,
    Resume,
    Drain,
    Revoke,
}

/// Process one probe command end to end.
///
/// The command is acknowledged only after the cache accepted the result, so
/// an uncached crash leads to redelivery instead of a lost probe. When the
/// cache itself refuses the result, the command is re-published with the
/// next attempt number; once `attempt` passes the limit the command
/// short-circuits to a `down/timeout` result instead of being probed again.
#[allow(clippy::too_many_arguments)]
async fn execute_one(
    delivery: Delivery,
    engine: Arc<ProbeEngine>,
    cache: CacheHandle,
    broker: Arc<dyn Broker>,
    worker_id: String,
    region_id: String,
    completed: Counter,
    failed: Counter,
    inflight: Arc<AtomicU32>,
    _permit: tokio::sync::OwnedSemaphorePermit,
) {
    let command: ProbeCommand = match delivery.parse_json() {
        Ok(command) => command,
        Err(e) => {
            warn!("invalid probe command: {e}");
            delivery.settle(Disposition::DeadLetter).await;
            inflight.fetch_sub(1, Ordering::Relaxed);
            return;
        }
    };

    let result = if command.attempt > ProbeCommand::MAX_ATTEMPTS
        || command.deadline <= crate::util::now_ms()
    {
        expired_result(&command, &worker_id, &region_id)
    } else {
        // run the engine on its own task so a panic in probe code becomes a
        // result instead of taking the worker down
        let engine = engine.clone();
        let cmd = command.clone();
        let wid = worker_id.clone();
        let rid = region_id.clone();
        match tokio::spawn(async move { engine.execute(&cmd, &wid, &rid).await }).await {
            Ok(result) => result,
            Err(join_error) => {
                error!("probe task panicked: {join_error}");
                panicked_result(&command, &worker_id, &region_id)
            }
        }
    };

    match result.status {
        ProbeStatus::Down => failed.inc(),
        _ => completed.inc(),
    }

    match cache.store(result).await {
        Ok(()) => delivery.settle(Disposition::Ack).await,
        Err(e) => {
            error!("result cache rejected store, escalating attempt: {e:#}");
            delivery
                .settle(escalate_attempt(&broker, &region_id, &command).await)
                .await;
        }
    }
    inflight.fetch_sub(1, Ordering::Relaxed);
}

/// Re-publish a failed command with `attempt + 1` so the retry is counted.
///
/// Past the attempt limit the command is not re-published; a plain requeue
/// lets the broker's delivery limit dead-letter it instead of looping.
async fn escalate_attempt(
    broker: &Arc<dyn Broker>,
    region_id: &str,
    command: &ProbeCommand,
) -> Disposition {
    let mut retry = command.clone();
    retry.attempt += 1;
    if retry.attempt > ProbeCommand::MAX_ATTEMPTS {
        return Disposition::NackRequeue;
    }

    let payload = match serde_json::to_vec(&retry) {
        Ok(payload) => payload,
        Err(e) => {
            error!("failed to serialize retry command: {e}");
            return Disposition::NackRequeue;
        }
    };
    match broker
        .publish(
            EXCHANGE_PROBES,
            &probe_routing_key(region_id),
            &payload,
            None,
        )
        .await
    {
        Ok(()) => Disposition::Ack,
        // broker down too: plain redelivery keeps the command alive
        Err(_) => Disposition::NackRequeue,
    }
}

fn synthetic_result(
    command: &ProbeCommand,
    worker_id: &str,
    region_id: &str,
    error_class: ErrorClass,
    message: String,
) -> ProbeResult {
    ProbeResult {
        result_id: Uuid::new_v4(),
        command_id: command.command_id,
        service_id: command.service_snapshot.id,
        nest_id: command.service_snapshot.nest_id,
        worker_id: worker_id.to_string(),
        region_id: region_id.to_string(),
        started_at: Utc::now(),
        duration_ms: 0,
        status: ProbeStatus::Down,
        status_code: None,
        message: Some(message),
        error_class: Some(error_class),
        details: None,
    }
}

fn expired_result(command: &ProbeCommand, worker_id: &str, region_id: &str) -> ProbeResult {
    synthetic_result(
        command,
        worker_id,
        region_id,
        ErrorClass::Timeout,
        format!(
            "command expired before execution (attempt {}, deadline {})",
            command.attempt, command.deadline
        ),
    )
}

fn panicked_result(command: &ProbeCommand, worker_id: &str, region_id: &str) -> ProbeResult {
    synthetic_result(
        command,
        worker_id,
        region_id,
        ErrorClass::InternalError,
        "probe execution panicked".to_string(),
    )
}

/// Publish fleet heartbeats every `heartbeat_secs`.
async fn heartbeat_loop(
    broker: Arc<dyn Broker>,
    worker_id: String,
    heartbeat_secs: u64,
    completed: Counter,
    failed: Counter,
    inflight: Arc<AtomicU32>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut system = System::new();
    let mut ticker = interval(Duration::from_secs(heartbeat_secs));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        system.refresh_cpu_usage();
        system.refresh_memory();

        let heartbeat = Heartbeat {
            worker_id: worker_id.clone(),
            ts: Utc::now(),
            counters_completed: completed.get(),
            counters_failed: failed.get(),
            inflight: inflight.load(Ordering::Relaxed),
            cpu: system.global_cpu_usage(),
            mem: system.used_memory(),
        };

        let payload = match serde_json::to_vec(&heartbeat) {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to serialize heartbeat: {e}");
                continue;
            }
        };

        // heartbeat loss is tolerated; the registry marks us stale after
        // three misses and the cache watchdog handles sustained outages
        if let Err(e) = broker.publish(EXCHANGE_HEARTBEAT, "", &payload, None).await {
            warn!("failed to publish heartbeat: {e:#}");
        } else {
            trace!("heartbeat published");
        }
    }

    debug!("heartbeat loop stopped");
}
