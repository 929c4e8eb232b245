//! Notification dispatcher: incident transitions → signed webhook and email
//! tasks, plus the webhook delivery worker
//!
//! The dispatcher consumes transition events from the notifications exchange
//! and fans them out into per-channel task queues. Webhook delivery is
//! at-least-once with exponential backoff (1m → 30m, ×2, max 6 attempts);
//! the broker delivery stays unsettled while a task is between attempts, so
//! a crashed dispatcher loses nothing.
//!
//! ## Signing
//!
//! `X-GuardAnt-Signature = HMAC_SHA256(secret, timestamp + "." + body)` with
//! the per-nest secret; receivers must reject timestamps older than five
//! minutes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use crate::broker::{
    Broker, Delivery, Disposition, EXCHANGE_DEFAULT, QUEUE_EMAIL_TASKS, QUEUE_NOTIFICATION_EVENTS,
    QUEUE_WEBHOOK_TASKS,
};
use crate::health::{Counter, Counters};
use crate::model::{EmailTask, Nest, NotificationEvent, Service, WebhookTask};
use crate::store::{self, StateStore, keys};

type HmacSha256 = Hmac<Sha256>;

/// Receivers must reject signatures older than this
pub const SIGNATURE_MAX_AGE_SECS: i64 = 300;

/// Webhook delivery attempts before giving up
pub const MAX_WEBHOOK_ATTEMPTS: u32 = 6;

/// First retry delay; doubles up to [`MAX_RETRY_DELAY`]
const RETRY_BASE: Duration = Duration::from_secs(60);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30 * 60);

/// Compute the webhook signature over `timestamp + "." + body`.
pub fn sign(secret: &str, timestamp: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Receiver-side verification: signature matches and the timestamp is no
/// older than `max_age_secs`.
pub fn verify(
    secret: &str,
    timestamp: &str,
    body: &str,
    signature: &str,
    now_epoch_secs: i64,
    max_age_secs: i64,
) -> bool {
    let Ok(ts) = timestamp.parse::<i64>() else {
        return false;
    };
    if now_epoch_secs - ts > max_age_secs {
        return false;
    }
    sign(secret, timestamp, body) == signature
}

#[derive(Debug)]
enum DispatcherCommand {
    Shutdown,
}

/// Turns incident transition events into per-channel delivery tasks
struct DispatcherActor {
    store: Arc<dyn StateStore>,
    broker: Arc<dyn Broker>,
    command_rx: mpsc::Receiver<DispatcherCommand>,
    deliveries: mpsc::Receiver<Delivery>,
    events_in: Counter,
    tasks_out: Counter,
}

impl DispatcherActor {
    #[instrument(skip(self))]
    async fn run(mut self) {
        debug!("starting notification dispatcher");

        loop {
            tokio::select! {
                Some(delivery) = self.deliveries.recv() => {
                    self.handle_delivery(delivery).await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        DispatcherCommand::Shutdown => {
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

        debug!("notification dispatcher stopped");
    }

    async fn handle_delivery(&mut self, delivery: Delivery) {
        self.events_in.inc();

        let event: NotificationEvent = match delivery.parse_json() {
            Ok(event) => event,
            Err(e) => {
                warn!("invalid notification event: {e}");
                delivery.settle(Disposition::DeadLetter).await;
                return;
            }
        };

        match self.fan_out(&event).await {
            Ok(()) => delivery.settle(Disposition::Ack).await,
            Err(e) => {
                warn!("failed to fan out notification: {e:#}");
                delivery.settle(Disposition::NackRequeue).await;
            }
        }
    }

    #[instrument(skip(self, event), fields(kind = %event.kind, service = %event.service_id))]
    async fn fan_out(&mut self, event: &NotificationEvent) -> Result<()> {
        let service: Option<Service> =
            store::get_json(self.store.as_ref(), &keys::service(event.service_id))
                .await
                .context("load service")?;
        let Some(service) = service else {
            trace!("service gone, dropping notification");
            return Ok(());
        };

        let nest: Option<Nest> = store::get_json(self.store.as_ref(), &keys::nest(event.nest_id))
            .await
            .context("load nest")?;

        let body = serde_json::to_string(event).context("serialize payload")?;
        let timestamp = event.timestamp.timestamp().to_string();

        if !service.notifications.webhooks.is_empty() {
            match nest.as_ref().and_then(|nest| nest.webhook_secret.as_deref()) {
                Some(secret) => {
                    let signature = sign(secret, &timestamp, &body);
                    for url in &service.notifications.webhooks {
                        let task = WebhookTask {
                            url: url.clone(),
                            body: body.clone(),
                            timestamp: timestamp.clone(),
                            signature: signature.clone(),
                        };
                        let payload = serde_json::to_vec(&task).context("serialize task")?;
                        self.broker
                            .publish(EXCHANGE_DEFAULT, QUEUE_WEBHOOK_TASKS, &payload, None)
                            .await
                            .context("enqueue webhook task")?;
                        self.tasks_out.inc();
                    }
                }
                None => {
                    warn!(
                        "nest {} has no webhook secret, skipping {} webhook(s)",
                        event.nest_id,
                        service.notifications.webhooks.len()
                    );
                }
            }
        }

        for address in &service.notifications.emails {
            let task = EmailTask {
                address: address.clone(),
                subject: format!("[GuardAnt] {}: {}", event.service_name, event.kind),
                body: body.clone(),
            };
            let payload = serde_json::to_vec(&task).context("serialize task")?;
            self.broker
                .publish(EXCHANGE_DEFAULT, QUEUE_EMAIL_TASKS, &payload, None)
                .await
                .context("enqueue email task")?;
            self.tasks_out.inc();
        }

        Ok(())
    }
}

/// Handle for the notification dispatcher
#[derive(Clone)]
pub struct DispatcherHandle {
    sender: mpsc::Sender<DispatcherCommand>,
}

impl DispatcherHandle {
    pub async fn spawn(
        store: Arc<dyn StateStore>,
        broker: Arc<dyn Broker>,
        counters: Counters,
    ) -> Result<Self> {
        let deliveries = broker.subscribe(QUEUE_NOTIFICATION_EVENTS, 8).await?;
        let (sender, command_rx) = mpsc::channel(8);

        let actor = DispatcherActor {
            store,
            broker,
            command_rx,
            deliveries,
            events_in: counters.counter("notify.events_in"),
            tasks_out: counters.counter("notify.tasks_out"),
        };

        tokio::spawn(actor.run());

        Ok(Self { sender })
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(DispatcherCommand::Shutdown).await;
    }
}

struct PendingRetry {
    due: Instant,
    attempt: u32,
    task: WebhookTask,
    delivery: Delivery,
}

#[derive(Debug)]
enum WebhookCommand {
    Shutdown,
}

/// Delivers webhook tasks with retry; one instance per hub process
struct WebhookDeliveryActor {
    client: reqwest::Client,
    command_rx: mpsc::Receiver<WebhookCommand>,
    deliveries: mpsc::Receiver<Delivery>,
    pending: Vec<PendingRetry>,
    retry_base: Duration,
    delivered: Counter,
    exhausted: Counter,
}

impl WebhookDeliveryActor {
    fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        (self.retry_base * factor).min(MAX_RETRY_DELAY.max(self.retry_base))
    }

    #[instrument(skip(self))]
    async fn run(mut self) {
        debug!("starting webhook delivery actor");

        loop {
            let next_due = self.pending.iter().map(|p| p.due).min();
            let sleep_until = next_due.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                Some(delivery) = self.deliveries.recv() => {
                    self.handle_task(delivery).await;
                }

                _ = tokio::time::sleep_until(sleep_until), if next_due.is_some() => {
                    self.retry_due().await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        WebhookCommand::Shutdown => {
                            debug!("received shutdown command, requeueing {} pending tasks", self.pending.len());
                            for pending in self.pending.drain(..) {
                                pending.delivery.settle(Disposition::NackRequeue).await;
                            }
                            break;
                        }
                    }
                }

                else => break,
            }
        }

        debug!("webhook delivery actor stopped");
    }

    async fn handle_task(&mut self, delivery: Delivery) {
        let task: WebhookTask = match delivery.parse_json() {
            Ok(task) => task,
            Err(e) => {
                warn!("invalid webhook task: {e}");
                delivery.settle(Disposition::DeadLetter).await;
                return;
            }
        };

        if self.attempt(&task).await {
            self.delivered.inc();
            delivery.settle(Disposition::Ack).await;
        } else {
            let due = Instant::now() + self.retry_delay(1);
            self.pending.push(PendingRetry {
                due,
                attempt: 1,
                task,
                delivery,
            });
        }
    }

    async fn retry_due(&mut self) {
        let now = Instant::now();
        let due: Vec<usize> = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, p)| p.due <= now)
            .map(|(i, _)| i)
            .rev()
            .collect();

        for index in due {
            let mut pending = self.pending.swap_remove(index);
            if self.attempt(&pending.task).await {
                self.delivered.inc();
                pending.delivery.settle(Disposition::Ack).await;
                continue;
            }

            pending.attempt += 1;
            if pending.attempt >= MAX_WEBHOOK_ATTEMPTS {
                warn!(
                    "webhook to {} failed {} times, giving up",
                    pending.task.url, pending.attempt
                );
                self.exhausted.inc();
                pending.delivery.settle(Disposition::DeadLetter).await;
            } else {
                pending.due = Instant::now() + self.retry_delay(pending.attempt);
                self.pending.push(pending);
            }
        }
    }

    /// One POST attempt; any 2xx counts as delivered.
    async fn attempt(&self, task: &WebhookTask) -> bool {
        let result = self
            .client
            .post(&task.url)
            .header("Content-Type", "application/json")
            .header("X-GuardAnt-Signature", &task.signature)
            .header("X-GuardAnt-Timestamp", &task.timestamp)
            .body(task.body.clone())
            .timeout(Duration::from_secs(10))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                trace!("delivered webhook to {}", task.url);
                true
            }
            Ok(response) => {
                debug!("webhook to {} answered {}", task.url, response.status());
                false
            }
            Err(e) => {
                debug!("webhook to {} failed: {e}", task.url);
                false
            }
        }
    }
}

/// Handle for the webhook delivery actor
#[derive(Clone)]
pub struct WebhookDeliveryHandle {
    sender: mpsc::Sender<WebhookCommand>,
}

impl WebhookDeliveryHandle {
    pub async fn spawn(broker: Arc<dyn Broker>, counters: Counters) -> Result<Self> {
        Self::spawn_with_retry_base(broker, counters, RETRY_BASE).await
    }

    /// Like `spawn` but with a custom first-retry delay (tests).
    pub async fn spawn_with_retry_base(
        broker: Arc<dyn Broker>,
        counters: Counters,
        retry_base: Duration,
    ) -> Result<Self> {
        let deliveries = broker.subscribe(QUEUE_WEBHOOK_TASKS, 8).await?;
        let (sender, command_rx) = mpsc::channel(8);

        let actor = WebhookDeliveryActor {
            client: reqwest::Client::builder()
                .user_agent(crate::USER_AGENT)
                .build()
                .expect("Failed to build HTTP client"),
            command_rx,
            deliveries,
            pending: Vec::new(),
            retry_base,
            delivered: counters.counter("notify.webhooks_delivered"),
            exhausted: counters.counter("notify.webhooks_exhausted"),
        };

        tokio::spawn(actor.run());

        Ok(Self { sender })
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(WebhookCommand::Shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_round_trip() {
        let secret = "nest-secret";
        let body = r#"{"type":"incident-started"}"#;
        let timestamp = "1700000000";

        let signature = sign(secret, timestamp, body);
        assert!(verify(
            secret,
            timestamp,
            body,
            &signature,
            1_700_000_060,
            SIGNATURE_MAX_AGE_SECS
        ));
    }

    #[test]
    fn test_tampered_body_fails_verification() {
        let signature = sign("s", "1700000000", "body");
        assert!(!verify(
            "s",
            "1700000000",
            "tampered",
            &signature,
            1_700_000_001,
            SIGNATURE_MAX_AGE_SECS
        ));
    }

    #[test]
    fn test_old_timestamp_rejected() {
        let timestamp = "1700000000";
        let signature = sign("s", timestamp, "body");
        // six minutes later
        assert!(!verify(
            "s",
            timestamp,
            "body",
            &signature,
            1_700_000_360,
            SIGNATURE_MAX_AGE_SECS
        ));
    }

    #[test]
    fn test_signature_is_hex_sha256() {
        let signature = sign("s", "0", "b");
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let counters = Counters::new();
        let (_tx, command_rx) = mpsc::channel(1);
        let (_dtx, deliveries) = mpsc::channel(1);
        let actor = WebhookDeliveryActor {
            client: reqwest::Client::new(),
            command_rx,
            deliveries,
            pending: Vec::new(),
            retry_base: Duration::from_secs(60),
            delivered: counters.counter("d"),
            exhausted: counters.counter("e"),
        };

        assert_eq!(actor.retry_delay(1), Duration::from_secs(60));
        assert_eq!(actor.retry_delay(2), Duration::from_secs(120));
        assert_eq!(actor.retry_delay(5), Duration::from_secs(960));
        // capped at 30 minutes
        assert_eq!(actor.retry_delay(10), Duration::from_secs(1800));
    }
}
