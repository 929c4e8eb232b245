//! Scheduler: the authoritative emitter of probe commands
//!
//! Exactly one scheduler instance (the lease holder) emits commands for a
//! service at a time. Services are loaded from the state store and kept
//! fresh by polling; due services are tracked in a min-heap keyed by
//! `nextDueAt`.
//!
//! ## Tick loop
//!
//! Pop every entry with `nextDueAt <= now`, emit one `ProbeCommand` per
//! configured region (routing key `region.<id>`), and push the entry back
//! with `now + interval ± 5%` jitter so the fleet never synchronizes.
//! A `(serviceId, region, window)` deduplication table absorbs double-leader
//! emissions; backpressure drops commands for regions whose queue depth
//! exceeds twice the region's worker capacity.

pub mod lease;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use crate::broker::{Broker, EXCHANGE_PROBES, probe_queue, probe_routing_key};
use crate::health::{Counter, Counters};
use crate::model::{ProbeCommand, ScheduleEntry, Service, WorkerAnt, WorkerStatus};
use crate::store::{self, StateStore, keys};
use crate::util;

pub use lease::LeaderLease;

/// Jitter applied to every reschedule
const JITTER_FRACTION: f64 = 0.05;

/// Heartbeats older than this exclude a worker from capacity
const CAPACITY_HEARTBEAT_HORIZON_SECS: i64 = 90;

#[derive(Debug)]
enum SchedulerCommand {
    /// Is this instance currently the leader?
    IsLeader { respond_to: oneshot::Sender<bool> },

    /// Gracefully shut down, releasing the lease
    Shutdown,
}

struct KnownService {
    service: Service,
}

pub(crate) struct SchedulerActor {
    store: Arc<dyn StateStore>,
    broker: Arc<dyn Broker>,
    lease: LeaderLease,
    command_rx: mpsc::Receiver<SchedulerCommand>,
    poll_interval: Duration,
    lease_ttl: Duration,

    services: HashMap<Uuid, KnownService>,
    entries: HashMap<Uuid, ScheduleEntry>,
    heap: BinaryHeap<Reverse<(i64, Uuid)>>,
    /// (serviceId, regionId) → window already emitted
    emitted: HashMap<(Uuid, String), i64>,
    /// regionId → sum of active workers' maxConcurrency
    region_capacity: HashMap<String, u64>,
    is_leader: bool,

    commands_out: Counter,
    commands_dropped: Counter,
}

impl SchedulerActor {
    /// Run the actor's main loop
    #[instrument(skip(self), fields(holder = %self.lease.holder_id()))]
    async fn run(mut self) {
        debug!("starting scheduler actor");

        let mut tick = interval(Duration::from_millis(500));
        let mut refresh_tick = interval(self.poll_interval);
        let mut lease_tick = interval(self.lease_ttl / 3);

        loop {
            tokio::select! {
                _ = lease_tick.tick() => {
                    self.maintain_lease().await;
                }

                _ = refresh_tick.tick() => {
                    if self.is_leader
                        && let Err(e) = self.refresh().await
                    {
                        warn!("service refresh failed: {e:#}");
                    }
                }

                _ = tick.tick() => {
                    if self.is_leader {
                        self.tick_once().await;
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        SchedulerCommand::IsLeader { respond_to } => {
                            let _ = respond_to.send(self.is_leader);
                        }
                        SchedulerCommand::Shutdown => {
                            debug!("received shutdown command");
                            if self.is_leader
                                && let Err(e) = self.lease.release().await
                            {
                                warn!("failed to release lease: {e}");
                            }
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("scheduler actor stopped");
    }

    async fn maintain_lease(&mut self) {
        if self.is_leader {
            match self.lease.renew().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("lost scheduler lease, stopping emissions");
                    self.is_leader = false;
                }
                Err(e) => {
                    // store unreachable: keep the current role, the TTL
                    // decides if we really lost it
                    warn!("lease renewal failed: {e}");
                }
            }
        } else {
            match self.lease.try_acquire().await {
                Ok(true) => {
                    debug!("became scheduler leader, rebuilding schedule");
                    self.is_leader = true;
                    if let Err(e) = self.refresh().await {
                        warn!("initial refresh after takeover failed: {e:#}");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("lease acquisition failed: {e}"),
            }
        }
    }

    /// Reconcile the in-memory schedule with the state store.
    async fn refresh(&mut self) -> Result<()> {
        let rows = self
            .store
            .scan_prefix(keys::SERVICE_PREFIX)
            .await
            .context("scan services")?;

        let now = util::now_ms();
        let mut seen = HashSet::new();

        for (key, value) in rows {
            // index rows (`service:index:...`) do not parse as a uuid
            let Some(id) = key
                .strip_prefix(keys::SERVICE_PREFIX)
                .and_then(|raw| Uuid::parse_str(raw).ok())
            else {
                continue;
            };

            let service: Service = match serde_json::from_str(&value) {
                Ok(service) => service,
                Err(e) => {
                    warn!("skipping unparseable service {id}: {e}");
                    continue;
                }
            };
            if let Err(reason) = service.validate() {
                warn!("skipping invalid service {id}: {reason}");
                continue;
            }
            if !service.is_active {
                continue;
            }
            seen.insert(id);

            match self.services.get(&id) {
                None => self.admit_service(service, now).await,
                Some(known) if known.service.updated_at != service.updated_at => {
                    self.update_service(service, now);
                }
                Some(_) => {}
            }
        }

        // deleted or deactivated services leave the heap lazily
        let gone: Vec<Uuid> = self
            .services
            .keys()
            .filter(|id| !seen.contains(id))
            .copied()
            .collect();
        for id in gone {
            debug!("service {id} removed from schedule");
            self.services.remove(&id);
            self.entries.remove(&id);
            self.emitted.retain(|(service_id, _), _| *service_id != id);
            let _ = self.store.delete(&keys::schedule(id)).await;
        }

        self.refresh_capacity().await;
        Ok(())
    }

    async fn admit_service(&mut self, service: Service, now: i64) {
        let id = service.id;
        // resume from the persisted cursor when it is still meaningful
        let persisted: Option<ScheduleEntry> =
            store::get_json(self.store.as_ref(), &keys::schedule(id))
                .await
                .ok()
                .flatten();

        let (next_due_at, revision) = match persisted {
            Some(entry) if entry.interval_ms == service.interval_ms() => {
                (entry.next_due_at.max(now), entry.revision)
            }
            Some(entry) => (now, entry.revision + 1),
            None => (now, 1),
        };

        let entry = ScheduleEntry {
            service_id: id,
            next_due_at,
            interval_ms: service.interval_ms(),
            region_set: service.monitoring.regions.clone(),
            revision,
        };
        debug!("admitting service {id} (due {next_due_at})");
        self.heap.push(Reverse((entry.next_due_at, id)));
        self.entries.insert(id, entry);
        self.services.insert(id, KnownService { service });
    }

    fn update_service(&mut self, service: Service, now: i64) {
        let id = service.id;
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.revision += 1;
            entry.region_set = service.monitoring.regions.clone();
            if entry.interval_ms != service.interval_ms() {
                entry.interval_ms = service.interval_ms();
                entry.next_due_at = now + entry.interval_ms;
                self.heap.push(Reverse((entry.next_due_at, id)));
            }
            debug!("service {id} updated, revision {}", entry.revision);
        }
        self.services.insert(id, KnownService { service });
    }

    /// Recompute per-region capacity from the active worker fleet.
    async fn refresh_capacity(&mut self) {
        let rows = match self.store.scan_prefix(keys::WORKER_PREFIX).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("worker scan failed, keeping stale capacities: {e}");
                return;
            }
        };

        let now = Utc::now();
        let mut capacity: HashMap<String, u64> = HashMap::new();
        for (key, value) in rows {
            if key.starts_with("worker:heartbeat:") {
                continue;
            }
            let Ok(worker) = serde_json::from_str::<WorkerAnt>(&value) else {
                continue;
            };
            if worker.status != WorkerStatus::Active {
                continue;
            }
            let fresh = worker.last_heartbeat_at.is_some_and(|at| {
                (now - at).num_seconds() < CAPACITY_HEARTBEAT_HORIZON_SECS
            });
            if fresh {
                *capacity.entry(worker.region_id).or_insert(0) +=
                    worker.capabilities.max_concurrency as u64;
            }
        }
        self.region_capacity = capacity;
    }

    /// Pop everything due and decide what to emit. Pure bookkeeping so tests
    /// can drive it with a synthetic clock.
    fn collect_due(&mut self, now: i64) -> Vec<(String, ProbeCommand)> {
        let mut commands = Vec::new();

        while let Some(Reverse((due_at, id))) = self.heap.peek().copied() {
            if due_at > now {
                break;
            }
            self.heap.pop();

            let Some(entry) = self.entries.get_mut(&id) else {
                continue; // removed service, stale heap node
            };
            if entry.next_due_at != due_at {
                continue; // rescheduled since this node was pushed
            }
            let Some(known) = self.services.get(&id) else {
                continue;
            };

            let window = util::floor_period(now, entry.interval_ms);
            for region in &entry.region_set {
                // double-leader or takeover protection: one emission per
                // (service, region, window)
                if self.emitted.get(&(id, region.clone())) == Some(&window) {
                    trace!("window {window} already emitted for {id}/{region}");
                    continue;
                }
                self.emitted.insert((id, region.clone()), window);

                commands.push((
                    region.clone(),
                    ProbeCommand {
                        command_id: Uuid::new_v4(),
                        service_snapshot: known.service.snapshot(),
                        scheduled_at: now,
                        deadline: now + entry.interval_ms,
                        attempt: 1,
                        revision: entry.revision,
                    },
                ));
            }

            entry.next_due_at = now + util::jitter(entry.interval_ms, JITTER_FRACTION);
            self.heap.push(Reverse((entry.next_due_at, id)));
        }

        commands
    }

    async fn tick_once(&mut self) {
        let now = util::now_ms();
        let commands = self.collect_due(now);
        if commands.is_empty() {
            return;
        }

        // one depth check per region per tick
        let mut throttled: HashMap<String, bool> = HashMap::new();
        let mut touched: HashSet<Uuid> = HashSet::new();

        for (region, command) in commands {
            let blocked = match throttled.get(&region) {
                Some(blocked) => *blocked,
                None => {
                    let blocked = self.region_over_capacity(&region).await;
                    throttled.insert(region.clone(), blocked);
                    blocked
                }
            };

            if blocked {
                self.commands_dropped.inc();
                continue;
            }

            let service_id = command.service_snapshot.id;
            let interval_ms = self
                .entries
                .get(&service_id)
                .map(|entry| entry.interval_ms)
                .unwrap_or(60_000);
            let payload = match serde_json::to_vec(&command) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("failed to serialize command: {e}");
                    continue;
                }
            };

            // per-message TTL: a command nobody picked up within two
            // intervals is worthless
            let ttl = Duration::from_millis((2 * interval_ms) as u64);
            match self
                .broker
                .publish(EXCHANGE_PROBES, &probe_routing_key(&region), &payload, Some(ttl))
                .await
            {
                Ok(()) => {
                    self.commands_out.inc();
                    touched.insert(service_id);
                }
                Err(e) => {
                    warn!("failed to publish command for {service_id}/{region}: {e:#}");
                }
            }
        }

        // persist cursors for the services we advanced (best effort)
        for service_id in touched {
            if let Some(entry) = self.entries.get(&service_id)
                && let Err(e) = store::put_json(
                    self.store.as_ref(),
                    &keys::schedule(service_id),
                    entry,
                    None,
                )
                .await
            {
                trace!("failed to persist schedule cursor for {service_id}: {e}");
            }
        }
    }

    async fn region_over_capacity(&self, region: &str) -> bool {
        let Some(capacity) = self.region_capacity.get(region).copied() else {
            // no capacity signal (no active workers known): do not throttle,
            // the per-message TTL bounds the damage
            return false;
        };
        if capacity == 0 {
            return false;
        }
        match self.broker.queue_depth(&probe_queue(region)).await {
            Ok(depth) => depth > capacity * 2,
            Err(e) => {
                trace!("queue depth check failed for {region}: {e}");
                false
            }
        }
    }
}

/// Handle for controlling a scheduler instance
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Spawn a scheduler instance; it participates in leader election and
    /// only emits while holding the lease.
    pub fn spawn(
        store: Arc<dyn StateStore>,
        broker: Arc<dyn Broker>,
        counters: Counters,
        holder_id: String,
        lease_ttl: Duration,
        poll_interval: Duration,
    ) -> Self {
        let (sender, command_rx) = mpsc::channel(8);

        let actor = SchedulerActor {
            lease: LeaderLease::new(store.clone(), holder_id, lease_ttl),
            store,
            broker,
            command_rx,
            poll_interval,
            lease_ttl,
            services: HashMap::new(),
            entries: HashMap::new(),
            heap: BinaryHeap::new(),
            emitted: HashMap::new(),
            region_capacity: HashMap::new(),
            is_leader: false,
            commands_out: counters.counter("scheduler.commands_out"),
            commands_dropped: counters.counter("scheduler.commands_dropped"),
        };

        tokio::spawn(actor.run());

        Self { sender }
    }

    pub async fn is_leader(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SchedulerCommand::IsLeader { respond_to: tx })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(SchedulerCommand::Shutdown).await;
    }
}
