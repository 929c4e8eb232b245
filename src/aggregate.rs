//! Metrics aggregator: raw results → per-period regional roll-ups
//!
//! Maintains live minute/hour/day buckets per (nest, service, region).
//! `periodStart` is floor-aligned; late events are accepted until the
//! bucket's grace window closes, then the bucket is sealed, written to the
//! aggregate sink and evicted. The sink is pluggable: production wires a
//! JSON-lines file (or whatever the operator mounts), tests use the memory
//! sink.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tokio::time::interval;
use tracing::{debug, instrument, trace, warn};

use crate::broker::{Broker, Delivery, Disposition, QUEUE_RESULTS_AGGREGATE};
use crate::health::{Counter, Counters};
use crate::model::{AggregatedMetrics, BucketKey, Period, ProbeResult, ProbeStatus};
use crate::util;

/// Max live buckets per nest before the oldest are force-sealed
const MAX_LIVE_BUCKETS_PER_NEST: usize = 10_000;

/// How often sealable buckets are swept
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Destination for sealed buckets
#[async_trait]
pub trait AggregateSink: Send + Sync {
    async fn write(&self, bucket: &AggregatedMetrics) -> Result<()>;
}

/// Test sink collecting sealed buckets in memory
#[derive(Default)]
pub struct MemorySink {
    written: Mutex<Vec<AggregatedMetrics>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<AggregatedMetrics> {
        self.written.lock().await.clone()
    }
}

#[async_trait]
impl AggregateSink for MemorySink {
    async fn write(&self, bucket: &AggregatedMetrics) -> Result<()> {
        self.written.lock().await.push(bucket.clone());
        Ok(())
    }
}

/// Append-only JSON-lines sink
pub struct JsonlSink {
    file: Mutex<tokio::fs::File>,
}

impl JsonlSink {
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .context("open aggregate sink")?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl AggregateSink for JsonlSink {
    async fn write(&self, bucket: &AggregatedMetrics) -> Result<()> {
        let mut line = serde_json::to_string(bucket).context("serialize bucket")?;
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .context("append bucket")?;
        Ok(())
    }
}

/// A live bucket accumulating results until it seals
#[derive(Debug)]
struct BucketState {
    total_checks: u64,
    up_checks: u64,
    down_checks: u64,
    degraded_checks: u64,
    duration_sum_ms: u64,
    min_duration_ms: u64,
    max_duration_ms: u64,
    status_code_histogram: HashMap<u16, u64>,
    error_class_histogram: HashMap<crate::model::ErrorClass, u64>,
}

impl BucketState {
    fn new() -> Self {
        Self {
            total_checks: 0,
            up_checks: 0,
            down_checks: 0,
            degraded_checks: 0,
            duration_sum_ms: 0,
            min_duration_ms: u64::MAX,
            max_duration_ms: 0,
            status_code_histogram: HashMap::new(),
            error_class_histogram: HashMap::new(),
        }
    }

    fn record(&mut self, result: &ProbeResult) {
        self.total_checks += 1;
        match result.status {
            ProbeStatus::Up => self.up_checks += 1,
            ProbeStatus::Down => self.down_checks += 1,
            ProbeStatus::Degraded => self.degraded_checks += 1,
        }
        self.duration_sum_ms += result.duration_ms;
        self.min_duration_ms = self.min_duration_ms.min(result.duration_ms);
        self.max_duration_ms = self.max_duration_ms.max(result.duration_ms);
        if let Some(code) = result.status_code {
            *self.status_code_histogram.entry(code).or_insert(0) += 1;
        }
        if let Some(class) = result.error_class {
            *self.error_class_histogram.entry(class).or_insert(0) += 1;
        }
    }

    fn seal(&self, key: BucketKey) -> AggregatedMetrics {
        AggregatedMetrics {
            key,
            total_checks: self.total_checks,
            up_checks: self.up_checks,
            down_checks: self.down_checks,
            degraded_checks: self.degraded_checks,
            avg_duration_ms: if self.total_checks > 0 {
                self.duration_sum_ms as f64 / self.total_checks as f64
            } else {
                0.0
            },
            min_duration_ms: if self.min_duration_ms == u64::MAX {
                0
            } else {
                self.min_duration_ms
            },
            max_duration_ms: self.max_duration_ms,
            status_code_histogram: self.status_code_histogram.clone(),
            error_class_histogram: self.error_class_histogram.clone(),
        }
    }
}

#[derive(Debug)]
enum AggregatorCommand {
    /// Seal and flush everything, then stop
    Shutdown,
}

struct AggregatorActor {
    sink: Arc<dyn AggregateSink>,
    command_rx: mpsc::Receiver<AggregatorCommand>,
    deliveries: mpsc::Receiver<Delivery>,
    buckets: HashMap<BucketKey, BucketState>,
    results_in: Counter,
    buckets_sealed: Counter,
    late_dropped: Counter,
}

impl AggregatorActor {
    #[instrument(skip(self))]
    async fn run(mut self) {
        debug!("starting aggregator actor");

        let mut sweep = interval(SWEEP_INTERVAL);

        loop {
            tokio::select! {
                Some(delivery) = self.deliveries.recv() => {
                    self.handle_delivery(delivery).await;
                }

                _ = sweep.tick() => {
                    self.sweep(util::now_ms()).await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        AggregatorCommand::Shutdown => {
                            debug!("received shutdown command, sealing {} buckets", self.buckets.len());
                            self.seal_all().await;
                            break;
                        }
                    }
                }

                else => {
                    warn!("channels closed, shutting down");
                    self.seal_all().await;
                    break;
                }
            }
        }

        debug!("aggregator actor stopped");
    }

    async fn handle_delivery(&mut self, delivery: Delivery) {
        let result: ProbeResult = match delivery.parse_json() {
            Ok(result) => result,
            Err(e) => {
                warn!("invalid result payload in aggregate queue: {e}");
                delivery.settle(Disposition::DeadLetter).await;
                return;
            }
        };
        self.record(&result, util::now_ms());
        delivery.settle(Disposition::Ack).await;
    }

    fn record(&mut self, result: &ProbeResult, now_ms: i64) {
        self.results_in.inc();
        let event_ms = result.started_at.timestamp_millis();

        for period in [Period::Minute, Period::Hour, Period::Day] {
            let period_start = util::floor_period(event_ms, period.duration_ms());

            // once the grace window closed the bucket is immutable; late
            // stragglers are counted and dropped
            if now_ms > period_start + period.duration_ms() + period.grace_ms() {
                self.late_dropped.inc();
                continue;
            }

            let key = BucketKey {
                nest_id: result.nest_id,
                service_id: result.service_id,
                region_id: result.region_id.clone(),
                period,
                period_start,
            };
            self.buckets
                .entry(key)
                .or_insert_with(BucketState::new)
                .record(result);
        }

        self.enforce_nest_cap(result.nest_id);
    }

    fn enforce_nest_cap(&mut self, nest_id: uuid::Uuid) {
        let live = self
            .buckets
            .keys()
            .filter(|key| key.nest_id == nest_id)
            .count();
        if live <= MAX_LIVE_BUCKETS_PER_NEST {
            return;
        }

        // force-seal the oldest buckets of this nest
        let mut keys: Vec<BucketKey> = self
            .buckets
            .keys()
            .filter(|key| key.nest_id == nest_id)
            .cloned()
            .collect();
        keys.sort_by_key(|key| key.period_start);
        let overflow = live - MAX_LIVE_BUCKETS_PER_NEST;
        let to_seal: Vec<BucketKey> = keys.into_iter().take(overflow).collect();
        for key in to_seal {
            if let Some(state) = self.buckets.remove(&key) {
                let sealed = state.seal(key);
                let sink = self.sink.clone();
                let counter = self.buckets_sealed.clone();
                tokio::spawn(async move {
                    if let Err(e) = sink.write(&sealed).await {
                        warn!("failed to write force-sealed bucket: {e:#}");
                    } else {
                        counter.inc();
                    }
                });
            }
        }
    }

    /// Seal every bucket whose grace window has closed.
    async fn sweep(&mut self, now_ms: i64) {
        let sealable: Vec<BucketKey> = self
            .buckets
            .keys()
            .filter(|key| {
                now_ms > key.period_start + key.period.duration_ms() + key.period.grace_ms()
            })
            .cloned()
            .collect();

        for key in sealable {
            let Some(state) = self.buckets.get(&key) else {
                continue;
            };
            let sealed = state.seal(key.clone());
            match self.sink.write(&sealed).await {
                Ok(()) => {
                    trace!("sealed bucket {:?}/{}", key.period, key.period_start);
                    self.buckets_sealed.inc();
                    self.buckets.remove(&key);
                }
                Err(e) => {
                    // keep the bucket, retry on the next sweep
                    warn!("failed to write sealed bucket: {e:#}");
                }
            }
        }
    }

    async fn seal_all(&mut self) {
        let keys: Vec<BucketKey> = self.buckets.keys().cloned().collect();
        for key in keys {
            if let Some(state) = self.buckets.remove(&key) {
                let sealed = state.seal(key);
                if let Err(e) = self.sink.write(&sealed).await {
                    warn!("failed to flush bucket on shutdown: {e:#}");
                } else {
                    self.buckets_sealed.inc();
                }
            }
        }
    }
}

/// Handle for controlling the aggregator actor
#[derive(Clone)]
pub struct AggregatorHandle {
    sender: mpsc::Sender<AggregatorCommand>,
}

impl AggregatorHandle {
    pub async fn spawn(
        broker: Arc<dyn Broker>,
        sink: Arc<dyn AggregateSink>,
        counters: Counters,
    ) -> Result<Self> {
        let deliveries = broker.subscribe(QUEUE_RESULTS_AGGREGATE, 32).await?;
        let (sender, command_rx) = mpsc::channel(8);

        let actor = AggregatorActor {
            sink,
            command_rx,
            deliveries,
            buckets: HashMap::new(),
            results_in: counters.counter("aggregate.results_in"),
            buckets_sealed: counters.counter("aggregate.buckets_sealed"),
            late_dropped: counters.counter("aggregate.late_dropped"),
        };

        tokio::spawn(actor.run());

        Ok(Self { sender })
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(AggregatorCommand::Shutdown).await;
    }
}
