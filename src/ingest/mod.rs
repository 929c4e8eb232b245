//! Result ingestor: raw probe results → live status, incidents, fan-out
//!
//! Consumes `results.ingest` one message at a time so results for a given
//! (service, region) are applied in receipt order. The handler is idempotent
//! on `resultId`; redeliveries and cache replays converge to the same state.
//!
//! ## Per message
//!
//! 1. deserialize; invalid payloads dead-letter
//! 2. look up the service; missing or inactive results are dropped
//! 3. upsert LiveStatus and recompute the aggregated status per strategy
//! 4. advance the incident state machine; persist transitions and emit
//!    notification events
//! 5. re-enqueue the raw result for the metrics aggregator

pub mod incident;
pub mod strategy;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use crate::broker::{
    Broker, Delivery, Disposition, EXCHANGE_DEFAULT, EXCHANGE_NOTIFICATIONS,
    QUEUE_RESULTS_AGGREGATE, QUEUE_RESULTS_INGEST, notification_routing_key,
};
use crate::health::{Counter, Counters};
use crate::model::{
    Incident, LiveStatus, NotificationEvent, NotificationKind, ProbeResult, ProbeStatus,
    RegionObservation, Service,
};
use crate::store::{self, StateStore, keys};

use incident::{IncidentTracker, Transition};

/// TTL on LiveStatus rows
const STATUS_TTL: Duration = Duration::from_secs(300);

/// Recently-seen result ids kept for idempotency
const SEEN_CAPACITY: usize = 8_192;

#[derive(Debug)]
enum IngestCommand {
    Shutdown,
}

struct IngestActor {
    store: Arc<dyn StateStore>,
    broker: Arc<dyn Broker>,
    command_rx: mpsc::Receiver<IngestCommand>,
    deliveries: mpsc::Receiver<Delivery>,
    trackers: HashMap<Uuid, IncidentTracker>,
    seen: HashSet<Uuid>,
    seen_order: VecDeque<Uuid>,
    messages_in: Counter,
    duplicates: Counter,
    dropped: Counter,
    invalid: Counter,
    incidents_opened: Counter,
    incidents_resolved: Counter,
}

impl IngestActor {
    #[instrument(skip(self))]
    async fn run(mut self) {
        debug!("starting ingest actor");

        loop {
            tokio::select! {
                Some(delivery) = self.deliveries.recv() => {
                    self.handle_delivery(delivery).await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        IngestCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("channels closed, shutting down");
                    break;
                }
            }
        }

        debug!("ingest actor stopped");
    }

    async fn handle_delivery(&mut self, delivery: Delivery) {
        self.messages_in.inc();

        let result: ProbeResult = match delivery.parse_json() {
            Ok(result) => result,
            Err(e) => {
                warn!("invalid result payload, dead-lettering: {e}");
                self.invalid.inc();
                delivery.settle(Disposition::DeadLetter).await;
                return;
            }
        };

        match self.process(&result, &delivery.payload).await {
            Ok(()) => delivery.settle(Disposition::Ack).await,
            Err(e) => {
                warn!("failed to process result {}: {e:#}", result.result_id);
                delivery.settle(Disposition::NackRequeue).await;
            }
        }
    }

    /// Idempotent application of one result.
    #[instrument(skip(self, result, raw_payload), fields(service = %result.service_id, region = %result.region_id))]
    async fn process(&mut self, result: &ProbeResult, raw_payload: &[u8]) -> Result<()> {
        if self.seen.contains(&result.result_id) {
            trace!("duplicate result {}, ignoring", result.result_id);
            self.duplicates.inc();
            return Ok(());
        }

        let service: Option<Service> =
            store::get_json(self.store.as_ref(), &keys::service(result.service_id))
                .await
                .context("load service")?;
        let service = match service {
            Some(service) if service.is_active => service,
            _ => {
                trace!("result for missing or inactive service, dropping");
                self.dropped.inc();
                self.mark_seen(result.result_id);
                return Ok(());
            }
        };

        let now = Utc::now();
        let status_key = keys::status(service.nest_id, service.id);

        let mut live: LiveStatus = store::get_json(self.store.as_ref(), &status_key)
            .await
            .context("load live status")?
            .unwrap_or_else(|| LiveStatus {
                service_id: service.id,
                nest_id: service.nest_id,
                last_result: result.clone(),
                per_region: HashMap::new(),
                aggregated_status: crate::model::AggregatedStatus::Unknown,
                updated_at: now,
            });

        live.per_region.insert(
            result.region_id.clone(),
            RegionObservation {
                last_status: result.status,
                last_duration_ms: result.duration_ms,
                last_at: result.started_at,
                last_error_class: result.error_class,
            },
        );
        live.last_result = result.clone();
        live.aggregated_status = strategy::aggregate(
            &live.per_region,
            service.monitoring.strategy,
            &service.monitoring.regions,
            now,
            chrono::Duration::milliseconds(2 * service.interval_ms()),
        );
        live.updated_at = now;

        store::put_json(self.store.as_ref(), &status_key, &live, Some(STATUS_TTL))
            .await
            .context("store live status")?;

        let transition = self
            .advance_incident(&service, live.aggregated_status, result, now)
            .await?;
        self.apply_transition(&service, transition).await?;

        // hand the raw result to the aggregator
        self.broker
            .publish(EXCHANGE_DEFAULT, QUEUE_RESULTS_AGGREGATE, raw_payload, None)
            .await
            .context("enqueue for aggregation")?;

        self.mark_seen(result.result_id);
        Ok(())
    }

    async fn advance_incident(
        &mut self,
        service: &Service,
        aggregated: crate::model::AggregatedStatus,
        result: &ProbeResult,
        now: chrono::DateTime<Utc>,
    ) -> Result<Transition> {
        if !self.trackers.contains_key(&service.id) {
            // seed from the store so a restart resumes the open incident
            let existing: Option<Incident> =
                store::get_json(self.store.as_ref(), &keys::incident(service.nest_id, service.id))
                    .await
                    .context("load incident")?;
            let tracker = match existing {
                Some(incident) if incident.closed_at.is_none() => {
                    debug!("resuming open incident {}", incident.incident_id);
                    IncidentTracker::with_open(incident)
                }
                _ => IncidentTracker::new(),
            };
            self.trackers.insert(service.id, tracker);
        }

        let tracker = self.trackers.get_mut(&service.id).expect("just inserted");
        let error_class = (result.status == ProbeStatus::Down)
            .then_some(result.error_class)
            .flatten();
        Ok(tracker.observe(service, aggregated, error_class, now))
    }

    async fn apply_transition(&mut self, service: &Service, transition: Transition) -> Result<()> {
        let incident_key = keys::incident(service.nest_id, service.id);
        match transition {
            Transition::None => Ok(()),

            Transition::Opened(incident) => {
                self.incidents_opened.inc();
                store::put_json(self.store.as_ref(), &incident_key, &incident, None)
                    .await
                    .context("persist incident")?;
                self.emit_notification(service, NotificationKind::IncidentStarted, incident)
                    .await
            }

            Transition::Updated(incident) => {
                store::put_json(self.store.as_ref(), &incident_key, &incident, None)
                    .await
                    .context("persist incident")
            }

            Transition::Resolved(incident) => {
                self.incidents_resolved.inc();
                self.store
                    .delete(&incident_key)
                    .await
                    .context("clear incident")?;
                self.emit_notification(service, NotificationKind::IncidentResolved, incident)
                    .await
            }
        }
    }

    async fn emit_notification(
        &self,
        service: &Service,
        kind: NotificationKind,
        incident: Incident,
    ) -> Result<()> {
        let event = NotificationEvent {
            kind,
            nest_id: service.nest_id,
            service_id: service.id,
            service_name: service.name.clone(),
            incident: Some(incident),
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_vec(&event).context("serialize notification")?;
        self.broker
            .publish(
                EXCHANGE_NOTIFICATIONS,
                &notification_routing_key(&kind.to_string()),
                &payload,
                None,
            )
            .await
            .context("publish notification event")
    }

    fn mark_seen(&mut self, result_id: Uuid) {
        if self.seen.insert(result_id) {
            self.seen_order.push_back(result_id);
            while self.seen_order.len() > SEEN_CAPACITY {
                if let Some(evicted) = self.seen_order.pop_front() {
                    self.seen.remove(&evicted);
                }
            }
        }
    }
}

/// Handle for controlling the ingest actor
#[derive(Clone)]
pub struct IngestHandle {
    sender: mpsc::Sender<IngestCommand>,
}

impl IngestHandle {
    /// Subscribe to the results queue and spawn the ingest actor.
    pub async fn spawn(
        store: Arc<dyn StateStore>,
        broker: Arc<dyn Broker>,
        counters: Counters,
    ) -> Result<Self> {
        // prefetch a few messages, but apply them strictly in order
        let deliveries = broker.subscribe(QUEUE_RESULTS_INGEST, 16).await?;
        let (sender, command_rx) = mpsc::channel(8);

        let actor = IngestActor {
            store,
            broker,
            command_rx,
            deliveries,
            trackers: HashMap::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            messages_in: counters.counter("ingest.messages_in"),
            duplicates: counters.counter("ingest.duplicates"),
            dropped: counters.counter("ingest.dropped"),
            invalid: counters.counter("ingest.invalid"),
            incidents_opened: counters.counter("ingest.incidents_opened"),
            incidents_resolved: counters.counter("ingest.incidents_resolved"),
        };

        tokio::spawn(actor.run());

        Ok(Self { sender })
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(IngestCommand::Shutdown).await;
    }
}
