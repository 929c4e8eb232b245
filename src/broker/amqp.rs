//! AMQP broker backend (lapin)
//!
//! One connection is kept for publishing with publisher confirms enabled;
//! each subscription runs on its own connection so a poisoned consumer
//! channel cannot take publishing down with it. Reconnection is automatic
//! with exponential backoff and the topology is redeclared on every
//! reconnect (declarations are idempotent).

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, trace, warn};

use super::{
    Broker, Delivery, Disposition, EXCHANGE_CONTROL, EXCHANGE_HEARTBEAT, EXCHANGE_NOTIFICATIONS,
    EXCHANGE_PROBES, EXCHANGE_RESULTS, MAX_DELIVERIES, QUEUE_EMAIL_TASKS, QUEUE_HEARTBEATS,
    QUEUE_NOTIFICATION_EVENTS, QUEUE_PROBES_DLQ, QUEUE_RESULTS_AGGREGATE, QUEUE_RESULTS_INGEST,
    QUEUE_WEBHOOK_TASKS, Settler, dlq_name, probe_queue, probe_routing_key,
};
use crate::util::Backoff;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Dead-letter exchange all durable queues point at
const DLX: &str = "guardant.dlx";

const CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// AMQP-backed broker transport
pub struct AmqpBroker {
    url: String,
    publish_channel: Mutex<Option<Channel>>,
}

impl AmqpBroker {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            publish_channel: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<Connection> {
        let connecting = Connection::connect(&self.url, ConnectionProperties::default());
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, connecting)
            .await
            .context("broker connect timed out")?
            .context("broker connect failed")?;
        Ok(conn)
    }

    /// Get (or rebuild) the confirmed publish channel.
    async fn publish_channel(&self) -> Result<Channel> {
        let mut guard = self.publish_channel.lock().await;
        if let Some(channel) = guard.as_ref()
            && channel.status().connected()
        {
            return Ok(channel.clone());
        }

        let conn = self.connect().await?;
        let channel = conn.create_channel().await.context("create channel")?;
        channel
            .confirm_select(Default::default())
            .await
            .context("enable publisher confirms")?;
        debug!("publish channel (re)established");
        *guard = Some(channel.clone());
        Ok(channel)
    }
}

/// Declare one queue and its bindings according to its naming convention.
/// Safe to call repeatedly.
async fn declare_queue(channel: &Channel, queue: &str) -> Result<()> {
    let durable = QueueDeclareOptions {
        durable: true,
        ..Default::default()
    };

    if let Some(region) = queue.strip_prefix("probes.")
        && region != "dlq"
    {
        let mut args = FieldTable::default();
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(DLX.into()),
        );
        args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(QUEUE_PROBES_DLQ.into()),
        );
        channel.queue_declare(queue, durable, args).await?;
        channel
            .queue_bind(
                queue,
                EXCHANGE_PROBES,
                &probe_routing_key(region),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        return Ok(());
    }

    if queue.starts_with("control.") {
        // private, dies with its worker
        let options = QueueDeclareOptions {
            durable: false,
            auto_delete: true,
            ..Default::default()
        };
        channel
            .queue_declare(queue, options, FieldTable::default())
            .await?;
        channel
            .queue_bind(
                queue,
                EXCHANGE_CONTROL,
                queue,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        return Ok(());
    }

    let mut args = FieldTable::default();
    if !queue.ends_with(".dlq") && queue != QUEUE_PROBES_DLQ {
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(DLX.into()),
        );
        args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(dlq_name(queue).into()),
        );
    }
    channel.queue_declare(queue, durable, args).await?;

    match queue {
        QUEUE_RESULTS_INGEST => {
            channel
                .queue_bind(
                    queue,
                    EXCHANGE_RESULTS,
                    "#",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }
        QUEUE_HEARTBEATS => {
            channel
                .queue_bind(
                    queue,
                    EXCHANGE_HEARTBEAT,
                    "",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }
        QUEUE_NOTIFICATION_EVENTS => {
            channel
                .queue_bind(
                    queue,
                    EXCHANGE_NOTIFICATIONS,
                    "notif.#",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }
        _ => {}
    }

    if queue.ends_with(".dlq") || queue == QUEUE_PROBES_DLQ {
        channel
            .queue_bind(
                queue,
                DLX,
                queue,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }
    Ok(())
}

async fn declare_exchanges(channel: &Channel) -> Result<()> {
    let durable = ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    };
    for (name, kind) in [
        (EXCHANGE_PROBES, ExchangeKind::Topic),
        (EXCHANGE_RESULTS, ExchangeKind::Topic),
        (EXCHANGE_CONTROL, ExchangeKind::Topic),
        (EXCHANGE_HEARTBEAT, ExchangeKind::Fanout),
        (EXCHANGE_NOTIFICATIONS, ExchangeKind::Topic),
        (DLX, ExchangeKind::Direct),
    ] {
        channel
            .exchange_declare(name, kind, durable.clone(), FieldTable::default())
            .await?;
    }
    Ok(())
}

/// Tracks how often a message has been redelivered so the fifth failure is
/// dead-lettered instead of requeued. Keyed by payload hash since classic
/// queues do not expose a delivery count.
#[derive(Default)]
struct RedeliveryCounts {
    counts: HashMap<u64, u32>,
}

impl RedeliveryCounts {
    fn fingerprint(payload: &[u8]) -> u64 {
        let mut hasher = DefaultHasher::new();
        payload.hash(&mut hasher);
        hasher.finish()
    }

    /// Returns the delivery number for this sighting (1-based).
    fn record(&mut self, payload: &[u8]) -> u32 {
        if self.counts.len() > 10_000 {
            self.counts.clear();
        }
        let entry = self.counts.entry(Self::fingerprint(payload)).or_insert(0);
        *entry += 1;
        *entry
    }

    fn forget(&mut self, payload: &[u8]) {
        self.counts.remove(&Self::fingerprint(payload));
    }
}

struct AmqpSettler {
    acker: lapin::acker::Acker,
    payload: Vec<u8>,
    counts: Arc<std::sync::Mutex<RedeliveryCounts>>,
}

#[async_trait]
impl Settler for AmqpSettler {
    async fn settle(self: Box<Self>, disposition: Disposition) {
        let result = match disposition {
            Disposition::Ack => {
                self.counts.lock().expect("counts lock").forget(&self.payload);
                self.acker.ack(BasicAckOptions::default()).await
            }
            Disposition::NackRequeue => {
                let deliveries = self
                    .counts
                    .lock()
                    .expect("counts lock")
                    .record(&self.payload);
                let requeue = deliveries < MAX_DELIVERIES;
                if !requeue {
                    trace!("delivery limit reached, dead-lettering");
                }
                self.acker
                    .nack(BasicNackOptions {
                        requeue,
                        ..Default::default()
                    })
                    .await
            }
            Disposition::DeadLetter => {
                self.counts.lock().expect("counts lock").forget(&self.payload);
                self.acker
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    })
                    .await
            }
        };
        if let Err(e) = result {
            // channel died; the broker will redeliver the unsettled message
            warn!("failed to settle delivery: {e}");
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_topology(&self, regions: &[String]) -> Result<()> {
        let channel = self.publish_channel().await?;
        declare_exchanges(&channel).await?;
        for region in regions {
            declare_queue(&channel, &probe_queue(region)).await?;
        }
        for queue in [
            QUEUE_RESULTS_INGEST,
            QUEUE_RESULTS_AGGREGATE,
            QUEUE_HEARTBEATS,
            QUEUE_NOTIFICATION_EVENTS,
            QUEUE_WEBHOOK_TASKS,
            QUEUE_EMAIL_TASKS,
            QUEUE_PROBES_DLQ,
        ] {
            declare_queue(&channel, queue).await?;
        }
        debug!("broker topology declared ({} regions)", regions.len());
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        ttl: Option<Duration>,
    ) -> Result<()> {
        let channel = self.publish_channel().await?;

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(CONTENT_TYPE))
            .with_delivery_mode(2);
        if let Some(ttl) = ttl {
            properties =
                properties.with_expiration(ShortString::from(ttl.as_millis().to_string()));
        }

        let publishing = async {
            let confirm = channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    payload,
                    properties,
                )
                .await?
                .await?;
            Ok::<Confirmation, lapin::Error>(confirm)
        };

        let confirm = match tokio::time::timeout(PUBLISH_TIMEOUT, publishing).await {
            Ok(Ok(confirm)) => confirm,
            Ok(Err(e)) => {
                *self.publish_channel.lock().await = None;
                return Err(e).context("publish failed");
            }
            Err(_) => {
                *self.publish_channel.lock().await = None;
                bail!("publish confirm timed out");
            }
        };

        if let Confirmation::Nack(_) = confirm {
            bail!("broker nacked publish to {exchange}/{routing_key}");
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str, concurrency: u16) -> Result<mpsc::Receiver<Delivery>> {
        let (tx, rx) = mpsc::channel(concurrency.max(1) as usize);
        let url = self.url.clone();
        let queue = queue.to_string();
        let counts = Arc::new(std::sync::Mutex::new(RedeliveryCounts::default()));

        tokio::spawn(async move {
            let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(30));
            loop {
                if tx.is_closed() {
                    return;
                }

                let session = async {
                    let conn =
                        Connection::connect(&url, ConnectionProperties::default()).await?;
                    let channel = conn.create_channel().await?;
                    declare_exchanges(&channel).await?;
                    declare_queue(&channel, &queue).await?;
                    channel
                        .basic_qos(concurrency, BasicQosOptions::default())
                        .await?;
                    let consumer = channel
                        .basic_consume(
                            &queue,
                            &format!("guardant-{queue}"),
                            BasicConsumeOptions::default(),
                            FieldTable::default(),
                        )
                        .await?;
                    Ok::<_, anyhow::Error>(consumer)
                };

                let mut consumer = match session.await {
                    Ok(consumer) => {
                        backoff.reset();
                        consumer
                    }
                    Err(e) => {
                        let delay = backoff.next();
                        warn!("consumer on {queue} unavailable ({e}), retrying in {delay:?}");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                };

                while let Some(delivery) = consumer.next().await {
                    let delivery = match delivery {
                        Ok(delivery) => delivery,
                        Err(e) => {
                            warn!("consumer stream error on {queue}: {e}");
                            break;
                        }
                    };
                    let wrapped = Delivery::new(
                        delivery.data.clone(),
                        delivery.routing_key.to_string(),
                        delivery.redelivered,
                        Box::new(AmqpSettler {
                            acker: delivery.acker,
                            payload: delivery.data,
                            counts: counts.clone(),
                        }),
                    );
                    if tx.send(wrapped).await.is_err() {
                        // subscriber dropped; unacked messages are redelivered
                        return;
                    }
                }
                warn!("consumer on {queue} ended, reconnecting");
            }
        });

        Ok(rx)
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64> {
        let channel = self.publish_channel().await?;
        // passive declare returns the current message count
        let state = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .context("passive queue declare")?;
        Ok(state.message_count() as u64)
    }
}
