//! Local result cache: durable buffer between probe execution and the broker
//!
//! Every result a worker produces goes through this cache. `store` appends
//! the result to an on-disk log and an in-memory ring before the probe
//! command is acknowledged, so a crash between probe and publish cannot lose
//! results: unflushed log records are replayed on the next start. Duplicate
//! publishes after a replay are fine, `resultId` is the ingestor's
//! idempotency key.
//!
//! ## Flushing
//!
//! A background flusher publishes ring entries oldest-first; broker failures
//! back off exponentially (250ms → 30s). The log is only truncated once the
//! ring is empty, and fsync runs every 100ms or 64 records, whichever comes
//! first.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, error, instrument, trace, warn};

use crate::broker::{Broker, EXCHANGE_RESULTS};
use crate::health::{Counter, Counters};
use crate::model::ProbeResult;
use crate::util::Backoff;

/// Hard cap on pending results
const MAX_RECORDS: usize = 100_000;

/// Hard cap on pending bytes
const MAX_BYTES: u64 = 256 * 1024 * 1024;

/// Records between forced fsyncs
const FSYNC_RECORDS: u32 = 64;

/// Time between forced fsyncs
const FSYNC_INTERVAL: Duration = Duration::from_millis(100);

const LOG_FILE: &str = "results.log";

/// Commands that can be sent to the ResultCacheActor
#[derive(Debug)]
enum CacheCommand {
    /// Persist a result; responds once the record is on disk
    Store {
        result: ProbeResult,
        respond_to: oneshot::Sender<Result<()>>,
    },

    /// Attempt to publish everything pending right now
    ForceFlush {
        respond_to: oneshot::Sender<Result<()>>,
    },

    /// Get cache statistics
    Stats {
        respond_to: oneshot::Sender<CacheStats>,
    },

    /// Flush what we can, then stop
    Shutdown,
}

/// Cache statistics, also used by the worker's publish-failure watchdog
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub pending: usize,
    pub pending_bytes: u64,
    pub dropped: u64,
    /// How long ago the last successful broker publish happened
    pub since_last_flush_ok: Duration,
}

struct ResultCacheActor {
    log_path: PathBuf,
    file: File,
    ring: VecDeque<(ProbeResult, u64)>,
    ring_bytes: u64,
    broker: Arc<dyn Broker>,
    command_rx: mpsc::Receiver<CacheCommand>,
    dropped: Counter,
    flushed: Counter,
    backoff: Backoff,
    next_attempt: Instant,
    records_since_sync: u32,
    dirty: bool,
    last_flush_ok: Instant,
}

impl ResultCacheActor {
    /// Run the actor's main loop
    #[instrument(skip(self))]
    async fn run(mut self) {
        debug!("starting result cache actor ({} replayed)", self.ring.len());

        let mut flush_tick = interval(Duration::from_millis(250));
        let mut fsync_tick = interval(FSYNC_INTERVAL);

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(CacheCommand::Store { result, respond_to }) => {
                            let outcome = self.store(result).await;
                            let _ = respond_to.send(outcome);
                        }

                        Some(CacheCommand::ForceFlush { respond_to }) => {
                            let outcome = self.flush_pending(true).await;
                            let _ = respond_to.send(outcome);
                        }

                        Some(CacheCommand::Stats { respond_to }) => {
                            let _ = respond_to.send(self.stats());
                        }

                        Some(CacheCommand::Shutdown) => {
                            debug!("received shutdown command");
                            if let Err(e) = self.flush_pending(true).await {
                                warn!("final flush failed, {} results remain cached: {e:#}", self.ring.len());
                            }
                            let _ = self.file.sync_data().await;
                            break;
                        }

                        // every handle dropped: stop without flushing, the
                        // on-disk log carries the pending results
                        None => {
                            warn!("command channel closed, shutting down");
                            break;
                        }
                    }
                }

                _ = flush_tick.tick() => {
                    if !self.ring.is_empty() && Instant::now() >= self.next_attempt {
                        let _ = self.flush_pending(false).await;
                    }
                }

                _ = fsync_tick.tick() => {
                    if self.dirty {
                        if let Err(e) = self.file.sync_data().await {
                            error!("fsync of result log failed: {e}");
                        } else {
                            self.dirty = false;
                            self.records_since_sync = 0;
                        }
                    }
                }
            }
        }

        debug!("result cache actor stopped");
    }

    /// Append the result to the log and the ring.
    ///
    /// Once this returns Ok the result will eventually reach the broker,
    /// even across a process kill, subject to disk availability.
    async fn store(&mut self, result: ProbeResult) -> Result<()> {
        let mut line = serde_json::to_string(&result).context("serialize result")?;
        line.push('\n');
        let bytes = line.len() as u64;

        self.file
            .write_all(line.as_bytes())
            .await
            .context("append to result log")?;
        self.dirty = true;
        self.records_since_sync += 1;

        if self.records_since_sync >= FSYNC_RECORDS {
            self.file.sync_data().await.context("fsync result log")?;
            self.dirty = false;
            self.records_since_sync = 0;
        }

        self.ring.push_back((result, bytes));
        self.ring_bytes += bytes;
        self.enforce_caps();
        Ok(())
    }

    /// Drop oldest entries once the cap is hit; counted and exported.
    fn enforce_caps(&mut self) {
        while self.ring.len() > MAX_RECORDS || self.ring_bytes > MAX_BYTES {
            if let Some((dropped, bytes)) = self.ring.pop_front() {
                self.ring_bytes -= bytes;
                self.dropped.inc();
                warn!(
                    "cache cap exceeded, dropping oldest result {}",
                    dropped.result_id
                );
            } else {
                break;
            }
        }
    }

    /// Publish pending results oldest-first; stops at the first failure
    /// unless `all` is set, in which case the error is returned.
    async fn flush_pending(&mut self, all: bool) -> Result<()> {
        while let Some((result, bytes)) = self.ring.front() {
            let payload = serde_json::to_vec(result).context("serialize result")?;
            let routing_key = result.nest_id.to_string();
            let result_id = result.result_id;
            let bytes = *bytes;

            match self
                .broker
                .publish(EXCHANGE_RESULTS, &routing_key, &payload, None)
                .await
            {
                Ok(()) => {
                    trace!("flushed result {result_id}");
                    self.ring_bytes -= bytes;
                    self.ring.pop_front();
                    self.flushed.inc();
                    self.backoff.reset();
                    self.next_attempt = Instant::now();
                    self.last_flush_ok = Instant::now();
                }
                Err(e) => {
                    let delay = self.backoff.next();
                    self.next_attempt = Instant::now() + delay;
                    debug!("broker publish failed, retrying in {delay:?}: {e:#}");
                    if all {
                        return Err(e.context("flush interrupted"));
                    }
                    return Ok(());
                }
            }
        }

        // everything flushed; the log can start over
        self.truncate_log().await?;
        Ok(())
    }

    async fn truncate_log(&mut self) -> Result<()> {
        self.file = File::create(&self.log_path)
            .await
            .context("truncate result log")?;
        self.dirty = false;
        self.records_since_sync = 0;
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            pending: self.ring.len(),
            pending_bytes: self.ring_bytes,
            dropped: self.dropped.get(),
            since_last_flush_ok: self.last_flush_ok.elapsed(),
        }
    }
}

/// Handle for the result cache of one worker process
#[derive(Clone)]
pub struct CacheHandle {
    sender: mpsc::Sender<CacheCommand>,
}

impl CacheHandle {
    /// Open (or create) the cache in `dir`, replay unflushed records, and
    /// spawn the actor.
    pub async fn spawn(
        dir: PathBuf,
        broker: Arc<dyn Broker>,
        counters: Counters,
    ) -> Result<CacheHandle> {
        tokio::fs::create_dir_all(&dir)
            .await
            .context("create cache directory")?;
        let log_path = dir.join(LOG_FILE);

        // replay whatever a previous process left behind
        let mut ring = VecDeque::new();
        let mut ring_bytes = 0u64;
        if let Ok(existing) = tokio::fs::read_to_string(&log_path).await {
            let mut corrupt = 0usize;
            for line in existing.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ProbeResult>(line) {
                    Ok(result) => {
                        let bytes = line.len() as u64 + 1;
                        ring_bytes += bytes;
                        ring.push_back((result, bytes));
                    }
                    Err(_) => corrupt += 1,
                }
            }
            if corrupt > 0 {
                warn!("skipped {corrupt} corrupt records while replaying result log");
            }
            if !ring.is_empty() {
                debug!("replaying {} cached results", ring.len());
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .context("open result log")?;

        let (sender, command_rx) = mpsc::channel(64);

        let actor = ResultCacheActor {
            log_path,
            file,
            ring,
            ring_bytes,
            broker,
            command_rx,
            dropped: counters.counter("cache.dropped"),
            flushed: counters.counter("cache.flushed"),
            backoff: Backoff::new(Duration::from_millis(250), Duration::from_secs(30)),
            next_attempt: Instant::now(),
            records_since_sync: 0,
            dirty: false,
            last_flush_ok: Instant::now(),
        };

        tokio::spawn(actor.run());

        Ok(CacheHandle { sender })
    }

    /// Persist one result. Ok means it will eventually reach the broker.
    pub async fn store(&self, result: ProbeResult) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CacheCommand::Store {
                result,
                respond_to: tx,
            })
            .await
            .context("cache actor gone")?;
        rx.await.context("cache actor dropped response")?
    }

    /// Publish everything pending now; errors if the broker is unreachable.
    pub async fn force_flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CacheCommand::ForceFlush { respond_to: tx })
            .await
            .context("cache actor gone")?;
        rx.await.context("cache actor dropped response")?
    }

    pub async fn stats(&self) -> Option<CacheStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CacheCommand::Stats { respond_to: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(CacheCommand::Shutdown).await;
    }
}
