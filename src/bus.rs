//! Publish/Consume Primitives
//!
//! A thin message-bus wrapper over the broker: JSON publish to an
//! exchange + routing key, and ephemeral exclusive consumers bound to a
//! binding key. `LapinBus` talks AMQP; `MemoryBus` is an in-process bus with
//! the same observable semantics, used by tests and broker-less development.
//!
//! Consumers ack after the delivery has been handed to the session,
//! successful or not. Redelivering a frame the session could not handle
//! would just loop, so delivery here is at-most-once; the platform database
//! is the durable record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::RelayError;

/// Buffered deliveries per consumer before the broker-side reader backs off.
const INBOX_CAPACITY: usize = 64;

/// An active ephemeral consumer.
///
/// `inbox` receives each delivered message as parsed JSON. Dropping the
/// subscription without calling [`cancel`](Self::cancel) leaves cleanup to
/// the broker's auto-delete rules; calling it releases the queue eagerly.
pub struct BusSubscription {
    pub inbox: mpsc::Receiver<Value>,
    teardown: Option<Box<dyn Teardown>>,
}

impl BusSubscription {
    /// Stops consumption and releases the queue and binding, best-effort.
    pub async fn cancel(mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown.run().await;
        }
    }
}

#[async_trait]
trait Teardown: Send {
    async fn run(self: Box<Self>);
}

/// Message bus operations the relay consumes.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes `message` as JSON to `exchange` under `routing_key`.
    ///
    /// Non-persistent, fire-and-forget: loss on broker restart is acceptable
    /// because user content is durably persisted by the application layer
    /// before it is ever published.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Value,
    ) -> Result<(), RelayError>;

    /// Declares an exclusive, auto-delete, server-named queue bound to
    /// `binding_key` on `exchange` and starts consuming into the returned
    /// subscription's inbox.
    async fn subscribe(
        &self,
        exchange: &str,
        binding_key: &str,
    ) -> Result<BusSubscription, RelayError>;
}

// ============================================================================
// AMQP bus (lapin)
// ============================================================================

/// AMQP-backed bus. One connection and one channel, created at startup and
/// shared by every session; lapin serializes operations on the channel
/// internally.
pub struct LapinBus {
    channel: Channel,
    _connection: Connection,
}

impl LapinBus {
    /// Connects to the broker and opens the shared channel.
    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        debug!("AMQP channel opened");
        Ok(LapinBus {
            channel,
            _connection: connection,
        })
    }

    /// The shared channel, for topology declaration at startup.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }
}

#[async_trait]
impl MessageBus for LapinBus {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Value,
    ) -> Result<(), RelayError> {
        let payload =
            serde_json::to_vec(message).map_err(|e| RelayError::Bus(e.to_string()))?;
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        exchange: &str,
        binding_key: &str,
    ) -> Result<BusSubscription, RelayError> {
        // Server-named, exclusive, auto-delete: abandoned queues are
        // reclaimed by the broker even if our explicit teardown never runs.
        let queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let queue_name = queue.name().as_str().to_string();

        self.channel
            .queue_bind(
                &queue_name,
                exchange,
                binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let consumer_tag = format!("relay-{}", uuid::Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(
                &queue_name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("Consumer stream error: {}", e);
                        break;
                    }
                };

                let mut receiver_gone = false;
                match serde_json::from_slice::<Value>(&delivery.data) {
                    Ok(value) => {
                        if tx.send(value).await.is_err() {
                            receiver_gone = true;
                        }
                    }
                    Err(e) => warn!("Dropping non-JSON delivery: {}", e),
                }

                // Ack regardless of handling outcome to avoid redelivery
                // loops on a frame the session can never process.
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    warn!("Failed to ack delivery: {}", e);
                    break;
                }
                if receiver_gone {
                    break;
                }
            }
        });

        Ok(BusSubscription {
            inbox: rx,
            teardown: Some(Box::new(LapinTeardown {
                channel: self.channel.clone(),
                consumer_tag,
                queue_name,
                exchange: exchange.to_string(),
                binding_key: binding_key.to_string(),
            })),
        })
    }
}

struct LapinTeardown {
    channel: Channel,
    consumer_tag: String,
    queue_name: String,
    exchange: String,
    binding_key: String,
}

#[async_trait]
impl Teardown for LapinTeardown {
    async fn run(self: Box<Self>) {
        // Each step best-effort: the queue is exclusive and auto-delete, so
        // broker-side cleanup covers whatever fails here. Logged at warn so
        // operators can spot broker resource pressure.
        if let Err(e) = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
        {
            warn!("Consumer cancel failed for {}: {}", self.queue_name, e);
        }
        if let Err(e) = self
            .channel
            .queue_unbind(
                &self.queue_name,
                &self.exchange,
                &self.binding_key,
                FieldTable::default(),
            )
            .await
        {
            warn!("Queue unbind failed for {}: {}", self.queue_name, e);
        }
        if let Err(e) = self
            .channel
            .queue_delete(&self.queue_name, QueueDeleteOptions::default())
            .await
        {
            warn!("Queue delete failed for {}: {}", self.queue_name, e);
        }
        debug!("Released ephemeral queue {}", self.queue_name);
    }
}

// ============================================================================
// In-Memory bus (for testing and development)
// ============================================================================

type BindingMap = HashMap<(String, String), Vec<MemoryBinding>>;

struct MemoryBinding {
    queue_id: uuid::Uuid,
    tx: mpsc::Sender<Value>,
}

/// In-process bus with exact binding-key matching.
///
/// The relay only binds literal keys (no topic wildcards), so exact matching
/// reproduces broker fanout for every key the relay computes.
pub struct MemoryBus {
    bindings: Arc<Mutex<BindingMap>>,
}

impl MemoryBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        MemoryBus {
            bindings: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of live queues bound anywhere on the bus.
    ///
    /// Abandoned subscriptions (receiver dropped without cancel) are pruned
    /// lazily, mirroring broker auto-delete.
    pub fn bound_queue_count(&self) -> usize {
        let mut bindings = self.bindings.lock().unwrap();
        bindings.retain(|_, queues| {
            queues.retain(|b| !b.tx.is_closed());
            !queues.is_empty()
        });
        bindings.values().map(Vec::len).sum()
    }

    /// Number of live queues bound to one binding key.
    pub fn bound_queue_count_for(&self, exchange: &str, binding_key: &str) -> usize {
        let mut bindings = self.bindings.lock().unwrap();
        match bindings.get_mut(&(exchange.to_string(), binding_key.to_string())) {
            Some(queues) => {
                queues.retain(|b| !b.tx.is_closed());
                queues.len()
            }
            None => 0,
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Value,
    ) -> Result<(), RelayError> {
        let senders: Vec<mpsc::Sender<Value>> = {
            let mut bindings = self.bindings.lock().unwrap();
            match bindings.get_mut(&(exchange.to_string(), routing_key.to_string())) {
                Some(queues) => {
                    // Prune abandoned queues on publish, like broker auto-delete.
                    queues.retain(|b| !b.tx.is_closed());
                    queues.iter().map(|b| b.tx.clone()).collect()
                }
                None => Vec::new(),
            }
        };

        // No bound queue means the message is dropped, matching exchange
        // semantics for an unmatched routing key.
        for tx in senders {
            let _ = tx.send(message.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        exchange: &str,
        binding_key: &str,
    ) -> Result<BusSubscription, RelayError> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let queue_id = uuid::Uuid::new_v4();
        let key = (exchange.to_string(), binding_key.to_string());

        self.bindings
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .push(MemoryBinding { queue_id, tx });

        Ok(BusSubscription {
            inbox: rx,
            teardown: Some(Box::new(MemoryTeardown {
                bindings: self.bindings.clone(),
                key,
                queue_id,
            })),
        })
    }
}

struct MemoryTeardown {
    bindings: Arc<Mutex<BindingMap>>,
    key: (String, String),
    queue_id: uuid::Uuid,
}

#[async_trait]
impl Teardown for MemoryTeardown {
    async fn run(self: Box<Self>) {
        let mut bindings = self.bindings.lock().unwrap();
        if let Some(queues) = bindings.get_mut(&self.key) {
            queues.retain(|b| b.queue_id != self.queue_id);
            if queues.is_empty() {
                bindings.remove(&self.key);
            }
        }
    }
}
