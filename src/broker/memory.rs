//! In-process broker backend (no external dependencies)
//!
//! Preserves the semantics the components rely on: topic routing, competing
//! consumers, redelivery counting with dead-lettering after `MAX_DELIVERIES`,
//! and publisher failure while "offline" (for outage tests).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::trace;

use super::{
    Broker, Delivery, Disposition, EXCHANGE_CONTROL, EXCHANGE_DEFAULT, EXCHANGE_HEARTBEAT,
    EXCHANGE_NOTIFICATIONS, EXCHANGE_PROBES, EXCHANGE_RESULTS, MAX_DELIVERIES,
    QUEUE_HEARTBEATS, QUEUE_NOTIFICATION_EVENTS, QUEUE_RESULTS_INGEST, Settler, dlq_name,
    probe_routing_key, topic_matches,
};

#[derive(Debug, Clone)]
struct QueuedMessage {
    payload: Vec<u8>,
    routing_key: String,
    deliveries: u32,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<QueuedMessage>,
    /// queued + unsettled
    depth: u64,
}

struct Queue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Queue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }
}

#[derive(Debug, Clone)]
struct Binding {
    exchange: String,
    pattern: String,
    queue: String,
}

#[derive(Default)]
struct Registry {
    queues: HashMap<String, Arc<Queue>>,
    bindings: Vec<Binding>,
}

/// In-memory broker; cheap to clone, all clones share state
#[derive(Clone)]
pub struct MemoryBroker {
    registry: Arc<Mutex<Registry>>,
    offline: Arc<AtomicBool>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate a broker outage: publishes fail until back online.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    async fn get_or_create_queue(&self, name: &str) -> Arc<Queue> {
        let mut registry = self.registry.lock().await;
        self.ensure_queue(&mut registry, name)
    }

    fn ensure_queue(&self, registry: &mut Registry, name: &str) -> Arc<Queue> {
        if let Some(queue) = registry.queues.get(name) {
            return queue.clone();
        }
        let queue = Queue::new();
        registry.queues.insert(name.to_string(), queue.clone());

        // implicit bindings matching the production topology
        let binding = if let Some(region) = name.strip_prefix("probes.") {
            (region != "dlq").then(|| Binding {
                exchange: EXCHANGE_PROBES.to_string(),
                pattern: probe_routing_key(region),
                queue: name.to_string(),
            })
        } else if name.starts_with("control.") {
            Some(Binding {
                exchange: EXCHANGE_CONTROL.to_string(),
                pattern: name.to_string(),
                queue: name.to_string(),
            })
        } else if name == QUEUE_RESULTS_INGEST {
            Some(Binding {
                exchange: EXCHANGE_RESULTS.to_string(),
                pattern: "#".to_string(),
                queue: name.to_string(),
            })
        } else if name == QUEUE_HEARTBEATS {
            Some(Binding {
                exchange: EXCHANGE_HEARTBEAT.to_string(),
                pattern: "#".to_string(),
                queue: name.to_string(),
            })
        } else if name == QUEUE_NOTIFICATION_EVENTS {
            Some(Binding {
                exchange: EXCHANGE_NOTIFICATIONS.to_string(),
                pattern: "notif.#".to_string(),
                queue: name.to_string(),
            })
        } else {
            None
        };
        if let Some(binding) = binding {
            registry.bindings.push(binding);
        }
        queue
    }

    async fn enqueue(&self, queue_name: &str, message: QueuedMessage) {
        let queue = self.get_or_create_queue(queue_name).await;
        let mut state = queue.state.lock().await;
        state.messages.push_back(message);
        state.depth += 1;
        drop(state);
        queue.notify.notify_one();
    }

    /// Number of messages currently parked in a queue's dead-letter queue.
    pub async fn dead_letter_depth(&self, queue: &str) -> u64 {
        self.queue_depth(&dlq_name(queue)).await.unwrap_or(0)
    }
}

struct MemorySettler {
    broker: MemoryBroker,
    queue_name: String,
    queue: Arc<Queue>,
    message: QueuedMessage,
}

#[async_trait]
impl Settler for MemorySettler {
    async fn settle(self: Box<Self>, disposition: Disposition) {
        match disposition {
            Disposition::Ack => {
                let mut state = self.queue.state.lock().await;
                state.depth = state.depth.saturating_sub(1);
            }
            Disposition::NackRequeue => {
                let mut message = self.message;
                message.deliveries += 1;
                {
                    let mut state = self.queue.state.lock().await;
                    state.depth = state.depth.saturating_sub(1);
                }
                if message.deliveries >= MAX_DELIVERIES {
                    trace!(
                        "delivery limit reached on {}, dead-lettering",
                        self.queue_name
                    );
                    self.broker
                        .enqueue(&dlq_name(&self.queue_name), message)
                        .await;
                } else {
                    self.broker.enqueue(&self.queue_name, message).await;
                }
            }
            Disposition::DeadLetter => {
                {
                    let mut state = self.queue.state.lock().await;
                    state.depth = state.depth.saturating_sub(1);
                }
                self.broker
                    .enqueue(&dlq_name(&self.queue_name), self.message)
                    .await;
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_topology(&self, regions: &[String]) -> Result<()> {
        let mut registry = self.registry.lock().await;
        for region in regions {
            let name = super::probe_queue(region);
            self.ensure_queue(&mut registry, &name);
        }
        for queue in [
            QUEUE_RESULTS_INGEST,
            super::QUEUE_RESULTS_AGGREGATE,
            QUEUE_HEARTBEATS,
            QUEUE_NOTIFICATION_EVENTS,
            super::QUEUE_WEBHOOK_TASKS,
            super::QUEUE_EMAIL_TASKS,
            super::QUEUE_PROBES_DLQ,
        ] {
            self.ensure_queue(&mut registry, queue);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        _ttl: Option<Duration>,
    ) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            bail!("broker unreachable (offline)");
        }

        let message = QueuedMessage {
            payload: payload.to_vec(),
            routing_key: routing_key.to_string(),
            deliveries: 0,
        };

        if exchange == EXCHANGE_DEFAULT {
            self.enqueue(routing_key, message).await;
            return Ok(());
        }

        let targets: Vec<String> = {
            let registry = self.registry.lock().await;
            registry
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
                .map(|b| b.queue.clone())
                .collect()
        };

        // unroutable messages are silently dropped, like an AMQP topic
        // exchange without mandatory publishing
        for target in targets {
            self.enqueue(&target, message.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str, concurrency: u16) -> Result<mpsc::Receiver<Delivery>> {
        let queue_name = queue.to_string();
        let queue = self.get_or_create_queue(queue).await;
        let (tx, rx) = mpsc::channel(concurrency.max(1) as usize);
        let broker = self.clone();

        tokio::spawn(async move {
            loop {
                let message = {
                    let mut state = queue.state.lock().await;
                    state.messages.pop_front()
                };
                match message {
                    Some(message) => {
                        let delivery = Delivery::new(
                            message.payload.clone(),
                            message.routing_key.clone(),
                            message.deliveries > 0,
                            Box::new(MemorySettler {
                                broker: broker.clone(),
                                queue_name: queue_name.clone(),
                                queue: queue.clone(),
                                message: message.clone(),
                            }),
                        );
                        if tx.send(delivery).await.is_err() {
                            // subscriber gone; put the popped message back
                            let mut state = queue.state.lock().await;
                            state.messages.push_front(message);
                            return;
                        }
                    }
                    None => queue.notify.notified().await,
                }
            }
        });

        Ok(rx)
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64> {
        let registry = self.registry.lock().await;
        match registry.queues.get(queue) {
            Some(queue) => Ok(queue.state.lock().await.depth),
            None => Ok(0),
        }
    }
}
