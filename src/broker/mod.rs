//! Broker transport: typed pub/sub over a message broker
//!
//! The broker couples scheduler, workers and ingestor with at-least-once
//! delivery. Implementations live behind the `Broker` trait: `amqp` for
//! production (lapin), `memory` for tests and local development.
//!
//! ## Topology
//!
//! - exchange `probes` (topic): commands routed by `region.<regionId>` into
//!   one durable shared queue `probes.<regionId>` per region, consumed by all
//!   approved workers of the region (competing consumers); dead-letters to
//!   `probes.dlq`
//! - exchange `results` (topic, routed by nestId) → queue `results.ingest`
//! - exchange `control` (topic): per-worker routing keys `control.<workerId>`
//!   into non-durable auto-delete queues
//! - exchange `heartbeat` (fanout) → queue `registry.heartbeats`
//! - exchange `notifications` (topic, `notif.<kind>`) → queue
//!   `notifications.events`; per-channel task queues `notifications.webhook`
//!   and `notifications.email` are fed directly
//! - queue `results.aggregate`: raw results re-enqueued by the ingestor for
//!   the aggregator, fed directly (default exchange)
//!
//! ## Delivery contract
//!
//! `subscribe` yields `Delivery` values that must be settled exactly once
//! with an explicit `Disposition`. A handler failure maps to `NackRequeue`;
//! after `MAX_DELIVERIES` requeues the message is dead-lettered instead.

pub mod amqp;
pub mod memory;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

pub const EXCHANGE_PROBES: &str = "probes";
pub const EXCHANGE_RESULTS: &str = "results";
pub const EXCHANGE_CONTROL: &str = "control";
pub const EXCHANGE_HEARTBEAT: &str = "heartbeat";
pub const EXCHANGE_NOTIFICATIONS: &str = "notifications";

/// Default exchange: routing key addresses a queue directly
pub const EXCHANGE_DEFAULT: &str = "";

pub const QUEUE_RESULTS_INGEST: &str = "results.ingest";
pub const QUEUE_RESULTS_AGGREGATE: &str = "results.aggregate";
pub const QUEUE_HEARTBEATS: &str = "registry.heartbeats";
pub const QUEUE_NOTIFICATION_EVENTS: &str = "notifications.events";
pub const QUEUE_WEBHOOK_TASKS: &str = "notifications.webhook";
pub const QUEUE_EMAIL_TASKS: &str = "notifications.email";
pub const QUEUE_PROBES_DLQ: &str = "probes.dlq";

/// Redeliveries before a message is dead-lettered
pub const MAX_DELIVERIES: u32 = 5;

pub fn probe_queue(region_id: &str) -> String {
    format!("probes.{region_id}")
}

pub fn probe_routing_key(region_id: &str) -> String {
    format!("region.{region_id}")
}

pub fn control_queue(worker_id: &str) -> String {
    format!("control.{worker_id}")
}

pub fn notification_routing_key(kind: &str) -> String {
    format!("notif.{kind}")
}

/// Dead-letter queue for a source queue. All probe region queues share one.
pub fn dlq_name(queue: &str) -> String {
    if queue.starts_with("probes.") {
        QUEUE_PROBES_DLQ.to_string()
    } else {
        format!("{queue}.dlq")
    }
}

/// What a consumer decides to do with a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handled; remove from the queue
    Ack,
    /// Transient failure; redeliver (until `MAX_DELIVERIES`)
    NackRequeue,
    /// Permanent failure; move to the dead-letter queue
    DeadLetter,
}

/// One message handed to a consumer, settled exactly once
pub struct Delivery {
    pub payload: Vec<u8>,
    pub routing_key: String,
    pub redelivered: bool,
    settler: Box<dyn Settler>,
}

impl Delivery {
    pub fn new(
        payload: Vec<u8>,
        routing_key: String,
        redelivered: bool,
        settler: Box<dyn Settler>,
    ) -> Self {
        Self {
            payload,
            routing_key,
            redelivered,
            settler,
        }
    }

    /// Deserialize the JSON payload
    pub fn parse_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }

    pub async fn settle(self, disposition: Disposition) {
        self.settler.settle(disposition).await;
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Backend-specific settlement of one delivery
#[async_trait]
pub trait Settler: Send + Sync {
    async fn settle(self: Box<Self>, disposition: Disposition);
}

/// Pub/sub transport over a message broker
///
/// `publish` is fire-and-forget with publisher confirms: a returned `Ok`
/// means the broker accepted the message. `subscribe` delivers one message
/// per slot (bounded by `concurrency`) with manual settlement.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare exchanges, shared queues and bindings. Idempotent.
    async fn declare_topology(&self, regions: &[String]) -> Result<()>;

    /// Publish with confirm; `ttl` becomes a per-message expiration
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// Subscribe to a queue with at most `concurrency` unsettled deliveries
    async fn subscribe(&self, queue: &str, concurrency: u16) -> Result<mpsc::Receiver<Delivery>>;

    /// Current approximate depth (queued + unsettled) of a queue
    async fn queue_depth(&self, queue: &str) -> Result<u64>;
}

/// AMQP topic pattern match: `*` matches exactly one word, `#` matches any
/// number of words (including none).
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(&word), Some(&head)) if word == head => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}
