//! Broker abstraction consumed by Manager and Responder.
//!
//! spec.md §1 treats "general-purpose AMQP framing" as out of scope: the
//! core consumes a pre-existing AMQP client rather than hand-rolling wire
//! framing. `lapin` is that pre-existing client (see DESIGN.md for why
//! 0-9-1 rather than the nominal 0-8). Grounded on the teacher's
//! `MessagingProvider` (`tasker_shared::messaging::service`): "a struct/enum,
//! not a trait object... wraps the actual messaging backend" so call sites
//! get zero-cost dispatch and tests can swap in an in-memory backend without
//! a live broker, exactly as `MessagingProvider::new_in_memory()` does for
//! the teacher's queue code.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties};
use tokio::sync::mpsc;

use mtrpc_shared::config::ExchangeKind;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("AMQP connection error: {0}")]
    Connection(String),
    #[error("AMQP channel error: {0}")]
    Channel(String),
    #[error("unknown consumer tag {0:?}")]
    UnknownConsumerTag(String),
}

impl From<lapin::Error> for BrokerError {
    fn from(e: lapin::Error) -> Self {
        BrokerError::Channel(e.to_string())
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// One delivered message, broker-agnostic (spec.md §3 Task's source data).
#[derive(Debug, Clone)]
pub struct BrokerDelivery {
    pub consumer_tag: String,
    pub routing_key: String,
    pub reply_to: Option<String>,
    pub delivery_tag: u64,
    pub body: Vec<u8>,
}

fn lapin_exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

/// A connected broker handle. One instance is owned by each of Manager and
/// Responder (spec.md §2: "one broker connection each").
#[derive(Clone)]
pub enum Broker {
    Lapin(LapinBroker),
    InMemory(InMemoryBroker),
}

impl Broker {
    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> BrokerResult<()> {
        match self {
            Broker::Lapin(b) => b.declare_exchange(name, kind, durable).await,
            Broker::InMemory(b) => b.declare_exchange(name, kind, durable),
        }
    }

    pub async fn declare_queue(&self, name: &str, durable: bool, auto_delete: bool) -> BrokerResult<()> {
        match self {
            Broker::Lapin(b) => b.declare_queue(name, durable, auto_delete).await,
            Broker::InMemory(b) => b.declare_queue(name, durable, auto_delete),
        }
    }

    pub async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        match self {
            Broker::Lapin(b) => b.bind_queue(queue, exchange, routing_key).await,
            Broker::InMemory(b) => b.bind_queue(queue, exchange, routing_key),
        }
    }

    pub async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        match self {
            Broker::Lapin(b) => b.set_prefetch(count).await,
            Broker::InMemory(_) => Ok(()),
        }
    }

    /// Register a consumer on `queue`; deliveries stream into the returned
    /// channel until the broker closes or `queue` has no more producers.
    pub async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<mpsc::Receiver<BrokerDelivery>> {
        match self {
            Broker::Lapin(b) => b.consume(queue, consumer_tag).await,
            Broker::InMemory(b) => b.consume(queue, consumer_tag),
        }
    }

    pub async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        match self {
            Broker::Lapin(b) => b.ack(delivery_tag).await,
            Broker::InMemory(b) => b.ack(delivery_tag),
        }
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        persistent: bool,
        reply_to: Option<&str>,
    ) -> BrokerResult<()> {
        match self {
            Broker::Lapin(b) => b.publish(exchange, routing_key, payload, persistent, reply_to).await,
            Broker::InMemory(b) => b.publish(exchange, routing_key, payload, persistent, reply_to),
        }
    }

    pub async fn close(&self) -> BrokerResult<()> {
        match self {
            Broker::Lapin(b) => b.close().await,
            Broker::InMemory(_) => Ok(()),
        }
    }
}

/// Connects a fresh `Broker`; the retry wrapper in `mtrpc-shared::resilience`
/// calls this repeatedly on transport failure (spec.md §4.4, §5).
#[derive(Clone)]
pub enum BrokerFactory {
    Lapin { uri: String },
    InMemory(InMemoryBus),
}

impl BrokerFactory {
    pub async fn connect(&self) -> BrokerResult<Broker> {
        match self {
            BrokerFactory::Lapin { uri } => Ok(Broker::Lapin(LapinBroker::connect(uri).await?)),
            BrokerFactory::InMemory(bus) => Ok(Broker::InMemory(InMemoryBroker::new(bus.clone()))),
        }
    }
}

/// The real backend: one `lapin` connection plus its one channel (§5
/// "Resource scoping": acquired in the starting action, released
/// unconditionally in the final one).
#[derive(Clone)]
pub struct LapinBroker {
    connection: Arc<Connection>,
    channel: Arc<lapin::Channel>,
    consumer_tags: Arc<StdMutex<HashMap<String, String>>>,
}

impl LapinBroker {
    pub async fn connect(uri: &str) -> BrokerResult<Self> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let channel = connection.create_channel().await?;
        Ok(Self {
            connection: Arc::new(connection),
            channel: Arc::new(channel),
            consumer_tags: Arc::new(StdMutex::new(HashMap::new())),
        })
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> BrokerResult<()> {
        self.channel
            .exchange_declare(
                name,
                lapin_exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, durable: bool, auto_delete: bool) -> BrokerResult<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        self.channel
            .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    /// Per spec.md §4.4: one consumer per queue, `consumer_tag == queue`, so
    /// the consume callback can recover the binding from the tag alone.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<mpsc::Receiver<BrokerDelivery>> {
        use futures::StreamExt;

        let mut consumer = self
            .channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await?;

        self.consumer_tags
            .lock()
            .unwrap()
            .insert(consumer_tag.to_string(), queue.to_string());

        let (tx, rx) = mpsc::channel(64);
        let consumer_tag = consumer_tag.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let Ok(delivery) = delivery else {
                    tracing::warn!(consumer_tag = %consumer_tag, "consumer stream error, ending forwarder");
                    break;
                };
                let reply_to = delivery.properties.reply_to().as_ref().map(|s| s.to_string());
                let routing_key = delivery.routing_key.to_string();
                let msg = BrokerDelivery {
                    consumer_tag: consumer_tag.clone(),
                    routing_key,
                    reply_to,
                    delivery_tag: delivery.delivery_tag,
                    body: delivery.data.clone(),
                };
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.channel.basic_ack(delivery_tag, BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        persistent: bool,
        reply_to: Option<&str>,
    ) -> BrokerResult<()> {
        let mut properties = BasicProperties::default();
        if persistent {
            properties = properties.with_delivery_mode(2);
        }
        if let Some(reply_to) = reply_to {
            properties = properties.with_reply_to(reply_to.into());
        }
        self.channel
            .basic_publish(exchange, routing_key, BasicPublishOptions::default(), &payload, properties)
            .await?
            .await?;
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        self.channel
            .close(0, "shutting down")
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        self.connection
            .close(0, "shutting down")
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(())
    }
}

/// A single process-wide simulated exchange/queue topology, shared between
/// the in-memory Manager-side and Responder-side `Broker` handles so tests
/// can exercise the full request/response path without a live broker.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<StdMutex<InMemoryBusState>>,
}

#[derive(Default)]
struct InMemoryBusState {
    /// exchange -> (routing_key -> queue names bound to it)
    bindings: HashMap<String, Vec<(String, String)>>,
    /// queue -> sender to whichever consumer is currently attached
    consumers: HashMap<String, mpsc::Sender<BrokerDelivery>>,
    next_delivery_tag: u64,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

/// The test backend: routes `publish` calls directly into the matching
/// consumer's channel, matching the teacher's `MessagingProvider::InMemory`
/// used across integration tests.
#[derive(Clone)]
pub struct InMemoryBroker {
    bus: InMemoryBus,
}

impl InMemoryBroker {
    pub fn new(bus: InMemoryBus) -> Self {
        Self { bus }
    }

    fn declare_exchange(&self, _name: &str, _kind: ExchangeKind, _durable: bool) -> BrokerResult<()> {
        Ok(())
    }

    fn declare_queue(&self, name: &str, _durable: bool, _auto_delete: bool) -> BrokerResult<()> {
        let mut state = self.bus.inner.lock().unwrap();
        state.consumers.entry(name.to_string()).or_insert_with(|| mpsc::channel(1).0);
        Ok(())
    }

    fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        let mut state = self.bus.inner.lock().unwrap();
        state
            .bindings
            .entry(exchange.to_string())
            .or_default()
            .push((routing_key.to_string(), queue.to_string()));
        Ok(())
    }

    fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<mpsc::Receiver<BrokerDelivery>> {
        let (tx, rx) = mpsc::channel(64);
        let mut state = self.bus.inner.lock().unwrap();
        state.consumers.insert(queue.to_string(), tx);
        let _ = consumer_tag;
        Ok(rx)
    }

    fn ack(&self, _delivery_tag: u64) -> BrokerResult<()> {
        Ok(())
    }

    fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>, _persistent: bool, reply_to: Option<&str>) -> BrokerResult<()> {
        let (queue, tag, sender) = {
            let mut state = self.bus.inner.lock().unwrap();
            let queue = state
                .bindings
                .get(exchange)
                .and_then(|bindings| {
                    bindings
                        .iter()
                        .find(|(rk, _)| rk == routing_key || matches_topic(rk, routing_key))
                        .map(|(_, q)| q.clone())
                })
                .ok_or_else(|| BrokerError::Channel(format!("no queue bound for {exchange}/{routing_key}")))?;
            state.next_delivery_tag += 1;
            let tag = state.next_delivery_tag;
            let sender = state
                .consumers
                .get(&queue)
                .cloned()
                .ok_or_else(|| BrokerError::Channel(format!("no consumer attached to queue {queue}")))?;
            (queue, tag, sender)
        };
        let msg = BrokerDelivery {
            consumer_tag: queue,
            routing_key: routing_key.to_string(),
            reply_to: reply_to.map(str::to_string),
            delivery_tag: tag,
            body: payload,
        };
        sender
            .try_send(msg)
            .map_err(|e| BrokerError::Channel(format!("in-memory publish failed: {e}")))?;
        Ok(())
    }
}

/// `#` matches any number of dot-separated segments, `*` matches exactly one,
/// anything else must match literally -- the AMQP topic-exchange rules the
/// real broker applies, reimplemented only far enough for in-memory tests
/// exercising a topic binding such as `rpc.#`.
fn matches_topic(pattern: &str, routing_key: &str) -> bool {
    let pattern_segs: Vec<&str> = pattern.split('.').collect();
    let key_segs: Vec<&str> = routing_key.split('.').collect();
    topic_match(&pattern_segs, &key_segs)
}

fn topic_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.first() {
        None => key.is_empty(),
        Some(&"#") => {
            if pattern.len() == 1 {
                return true;
            }
            (0..=key.len()).any(|i| topic_match(&pattern[1..], &key[i..]))
        }
        Some(&"*") => !key.is_empty() && topic_match(&pattern[1..], &key[1..]),
        Some(seg) => key.first() == Some(seg) && topic_match(&pattern[1..], &key[1..]),
    }
}
