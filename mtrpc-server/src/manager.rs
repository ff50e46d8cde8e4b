//! The Manager actor (spec.md §4.4): owns the consume-side broker
//! connection, declares the configured topology, starts the Responder, and
//! spawns one worker per consumed message.
//!
//! Grounded on `RPCManager` in `mtrpc/server/threads.py`: `init()` computes
//! one queue per binding (see `crate::queue_naming`) and starts the
//! responder; `amqp_init()` declares and binds each queue and issues one
//! `basic_consume` per queue with `consumer_tag == queue`; `get_and_go()` is
//! the consume callback that builds the access dict, records the task under
//! the shared mutex, acks only if recorded, and starts a task thread;
//! `final_action()` closes the connection, requests the responder to stop
//! if it hasn't already, and joins it.

use std::collections::HashMap;
use std::sync::Arc;

use mtrpc_shared::config::BindingConfig;
use mtrpc_shared::resilience::{connect_with_retry, RetryMetrics, RetryPolicy};
use mtrpc_tree::{AccessContext, MethodTree};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::broker::{Broker, BrokerDelivery, BrokerFactory};
use crate::control_plane::{ControlPlane, Severity, StoppingDescriptor, Task};
use crate::queue_naming::queue_name;
use crate::responder::Responder;
use crate::worker::execute_task;

pub struct ManagerConfig {
    pub client_id: String,
    pub prefetch_count: u16,
    pub retry_policy: RetryPolicy,
}

/// Resolves each consumer's queue name to the binding it was declared from,
/// so the consume callback can recover access-key/keyhole patterns from
/// nothing but the delivery's consumer tag, the way `queue == consumer_tag`
/// lets `get_and_go` look binding properties up by queue name alone.
struct QueueBinding {
    queue: String,
    binding: BindingConfig,
}

pub struct Manager {
    factory: BrokerFactory,
    config: ManagerConfig,
    bindings: Vec<BindingConfig>,
    exchange_kind: Box<dyn Fn(&str) -> mtrpc_shared::config::ExchangeKind + Send>,
    tree: Arc<MethodTree>,
    control_plane: Arc<ControlPlane>,
    responder: Responder,
    final_callback: Option<Arc<dyn Fn() + Send + Sync>>,
    metrics: RetryMetrics,
}

impl Manager {
    pub fn new(
        factory: BrokerFactory,
        config: ManagerConfig,
        bindings: Vec<BindingConfig>,
        exchange_kind: Box<dyn Fn(&str) -> mtrpc_shared::config::ExchangeKind + Send>,
        tree: Arc<MethodTree>,
        control_plane: Arc<ControlPlane>,
        responder: Responder,
        final_callback: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Self {
        Self {
            factory,
            config,
            bindings,
            exchange_kind,
            tree,
            control_plane,
            responder,
            final_callback,
            metrics: RetryMetrics::default(),
        }
    }

    /// Runs until a stop has been requested (by this manager, by the
    /// responder, or because every consumer stream closed), then runs the
    /// final action and returns.
    pub async fn run(self) {
        let responder_handle: JoinHandle<()> = tokio::spawn(self.responder.run());

        let broker = match connect_with_retry(&self.config.retry_policy, &self.metrics, || self.factory.connect()).await {
            Ok(broker) => broker,
            Err(err) => {
                tracing::error!(error = %err, "manager failed to connect, requesting shutdown");
                self.control_plane
                    .begin_stopping(StoppingDescriptor::new(format!("connect failure: {err}"), Severity::Critical, true))
                    .await;
                self.finish(broker_placeholder(), responder_handle).await;
                return;
            }
        };

        let queue_bindings = match self.declare_topology(&broker).await {
            Ok(qb) => qb,
            Err(err) => {
                tracing::error!(error = %err, "manager failed to declare topology, requesting shutdown");
                self.control_plane
                    .begin_stopping(StoppingDescriptor::new(format!("topology failure: {err}"), Severity::Critical, true))
                    .await;
                self.finish(broker, responder_handle).await;
                return;
            }
        };

        let (merged_tx, mut merged_rx) = mpsc::channel::<BrokerDelivery>(256);
        let mut by_queue = HashMap::new();
        for qb in queue_bindings {
            match broker.consume(&qb.queue, &qb.queue).await {
                Ok(mut rx) => {
                    let tx = merged_tx.clone();
                    tokio::spawn(async move {
                        while let Some(delivery) = rx.recv().await {
                            if tx.send(delivery).await.is_err() {
                                break;
                            }
                        }
                    });
                    by_queue.insert(qb.queue.clone(), qb.binding);
                }
                Err(err) => {
                    tracing::error!(queue = %qb.queue, error = %err, "failed to start consuming queue");
                }
            }
        }
        drop(merged_tx);

        let wakeup: Arc<Notify> = self.control_plane.wakeup_handle();
        loop {
            tokio::select! {
                maybe_delivery = merged_rx.recv() => {
                    match maybe_delivery {
                        Some(delivery) => self.handle_delivery(delivery, &broker, &by_queue).await,
                        None => {
                            tracing::warn!("every consumer stream closed, stopping");
                            self.control_plane
                                .begin_stopping(StoppingDescriptor::new("all consumers closed", Severity::Warning, true))
                                .await;
                        }
                    }
                }
                _ = wakeup.notified() => {}
            }
            if self.control_plane.is_stopping().await.is_some() {
                break;
            }
        }

        self.finish(broker, responder_handle).await;
    }

    async fn declare_topology(&self, broker: &Broker) -> Result<Vec<QueueBinding>, crate::broker::BrokerError> {
        let mut out = Vec::with_capacity(self.bindings.len());
        for binding in &self.bindings {
            let queue = queue_name(&self.config.client_id, &binding.exchange, &binding.routing_key);
            broker.declare_queue(&queue, true, true).await?;
            let kind = (self.exchange_kind)(&binding.exchange);
            broker.declare_exchange(&binding.exchange, kind, true).await?;
            broker.bind_queue(&queue, &binding.exchange, &binding.routing_key).await?;
            out.push(QueueBinding { queue, binding: binding.clone() });
        }
        broker.set_prefetch(self.config.prefetch_count).await?;
        Ok(out)
    }

    async fn handle_delivery(&self, delivery: BrokerDelivery, broker: &Broker, by_queue: &HashMap<String, BindingConfig>) {
        let Some(binding) = by_queue.get(&delivery.consumer_tag) else {
            tracing::warn!(consumer_tag = %delivery.consumer_tag, "delivery from unknown consumer tag, dropping");
            return;
        };

        let mut access_context = AccessContext::new();
        access_context
            .insert("exchange", binding.exchange.clone())
            .insert("queue", delivery.consumer_tag.clone())
            .insert("rk", binding.routing_key.clone())
            .insert("rk_split", split_joined(&binding.routing_key))
            .insert("rk_revsplit", reversed_split_joined(&binding.routing_key))
            .insert("msg_rk", delivery.routing_key.clone())
            .insert("msg_rk_split", split_joined(&delivery.routing_key))
            .insert("msg_rk_revsplit", reversed_split_joined(&delivery.routing_key))
            .insert("delivery_info", delivery_info_summary(&delivery))
            .insert("reply_to", delivery.reply_to.clone().unwrap_or_default());

        let task_id = self.control_plane.allocate_task_id();
        let task = Task {
            id: task_id,
            request_body: delivery.body,
            access_context,
            access_key_pattern: binding.access_key_pattern.clone(),
            access_keyhole_pattern: binding.access_keyhole_pattern.clone(),
            reply_to: delivery.reply_to.clone(),
        };

        if !self.control_plane.try_record_task(task.clone()).await {
            tracing::debug!(task_id, "shutdown in progress, leaving delivery unacked for redelivery");
            return;
        }

        if let Err(err) = broker.ack(delivery.delivery_tag).await {
            tracing::error!(task_id, error = %err, "failed to ack delivery after recording task");
        }

        tracing::debug!(task_id, method_hint = %binding.routing_key, "task recorded, spawning worker");
        self.control_plane.worker_spawned();
        let control_plane = Arc::clone(&self.control_plane);
        let tree = Arc::clone(&self.tree);
        let results_tx = self.control_plane.results_sender();
        tokio::spawn(async move {
            execute_task(task, tree, results_tx).await;
            control_plane.worker_finished();
        });
    }

    async fn finish(&self, broker: Broker, responder_handle: JoinHandle<()>) {
        if let Err(err) = broker.close().await {
            tracing::warn!(error = %err, "error closing manager's broker connection");
        }

        if self.control_plane.is_stopping().await.is_none() {
            self.control_plane
                .begin_stopping(StoppingDescriptor::new("manager stopped without a prior request", Severity::Warning, true))
                .await;
        }

        if let Err(err) = responder_handle.await {
            tracing::error!(error = %err, "responder task panicked");
        }

        if let Some(callback) = &self.final_callback {
            callback();
        }
    }
}

/// A never-consumed `Broker` used only on the early-connect-failure path,
/// where there is nothing real to close.
fn broker_placeholder() -> Broker {
    Broker::InMemory(crate::broker::InMemoryBroker::new(crate::broker::InMemoryBus::new()))
}

/// `"{rk_split}"`-style access-context field (spec.md §3, §6): the routing
/// key split on `.`, joined back with `,` since `AccessContext` fields are
/// flat strings rather than the original's Python list (`create_access_dict`
/// in `examples/original_source/mtrpc/server/threads.py` hands the list
/// itself to `%`-formatting, which `"{rk_split[2]}"`-style patterns index
/// into; a keyhole regex searched against the comma-joined form preserves
/// the ability to match on a particular segment or on segment count).
fn split_joined(routing_key: &str) -> String {
    routing_key.split('.').collect::<Vec<_>>().join(",")
}

fn reversed_split_joined(routing_key: &str) -> String {
    let mut segments: Vec<&str> = routing_key.split('.').collect();
    segments.reverse();
    segments.join(",")
}

/// `"{delivery_info}"` access-context field: a rendering of the delivery
/// metadata `create_access_dict` passes through as a dict, flattened to the
/// fields this broker surface actually carries.
fn delivery_info_summary(delivery: &BrokerDelivery) -> String {
    format!(
        "delivery_tag={},routing_key={},consumer_tag={}",
        delivery.delivery_tag, delivery.routing_key, delivery.consumer_tag
    )
}
