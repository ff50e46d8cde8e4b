//! The Responder actor (spec.md §4.5): owns the publish-side broker
//! connection, drains the result FIFO, and is the sole writer of the
//! stopping descriptor.
//!
//! Grounded on `RPCResponder` in `mtrpc/server/threads.py`: its `main_loop`
//! drains `result_fifo` "while not (stopping and (stopping.force or not
//! task_dict))", turns a `Stopping` sentinel into `self.stopping` under the
//! shared mutex, and otherwise publishes and drops the task from
//! `task_dict`. `final_action` closes the wake-up pipe, closes the AMQP
//! connection, then snapshots `task_dict` against live `RPCTaskThread`
//! instances and logs any discrepancy.

use std::sync::Arc;

use mtrpc_shared::config::ExchangeKind;
use mtrpc_shared::resilience::{retry_action, RetryMetrics, RetryPolicy};
use tokio::sync::mpsc;

use crate::broker::{Broker, BrokerFactory};
use crate::control_plane::{ControlPlane, ResultMessage};

pub struct ResponderConfig {
    pub response_exchange: String,
    pub retry_policy: RetryPolicy,
}

pub struct Responder {
    factory: BrokerFactory,
    config: ResponderConfig,
    control_plane: Arc<ControlPlane>,
    results_rx: mpsc::UnboundedReceiver<ResultMessage>,
    metrics: RetryMetrics,
}

impl Responder {
    pub fn new(
        factory: BrokerFactory,
        config: ResponderConfig,
        control_plane: Arc<ControlPlane>,
        results_rx: mpsc::UnboundedReceiver<ResultMessage>,
    ) -> Self {
        Self {
            factory,
            config,
            control_plane,
            results_rx,
            metrics: RetryMetrics::default(),
        }
    }

    /// Runs to completion: declares the response exchange, drains results
    /// until the drain condition is satisfied, then runs the final action.
    /// Returns the `Broker` handle so the caller can observe whether it
    /// closed cleanly (tests only; production callers discard it).
    pub async fn run(mut self) {
        let mut broker = match self.connect_and_declare().await {
            Ok(broker) => broker,
            Err(err) => {
                tracing::error!(error = %err, "responder failed to initialize, giving up without draining");
                return;
            }
        };

        self.main_loop(&mut broker).await;
        self.final_action(&broker).await;
    }

    async fn connect_and_declare(&self) -> Result<Broker, mtrpc_shared::ServerError> {
        let factory = self.factory.clone();
        let exchange = self.config.response_exchange.clone();
        connect_with_retry_and_declare(&factory, &exchange, &self.config.retry_policy, &self.metrics).await
    }

    async fn main_loop(&mut self, broker: &mut Broker) {
        loop {
            let stopping = self.control_plane.is_stopping().await;
            if let Some(descriptor) = &stopping {
                let in_flight = self.control_plane.in_flight_count().await;
                if descriptor.force || in_flight == 0 {
                    break;
                }
            }

            let Some(message) = self.results_rx.recv().await else {
                tracing::warn!("result FIFO sender dropped, responder stopping");
                break;
            };

            match message {
                ResultMessage::Stop(descriptor) => {
                    self.control_plane.begin_stopping(descriptor).await;
                }
                ResultMessage::Response { task_id, reply_to, payload } => {
                    let Some(reply_to) = reply_to else {
                        tracing::warn!(task_id, "result has no reply_to, dropping");
                        self.control_plane.complete_task(task_id).await;
                        continue;
                    };
                    if let Err(err) = self.publish_reply(broker, &reply_to, payload).await {
                        tracing::error!(task_id, error = %err, "failed to publish reply after exhausting retries");
                    }
                    self.control_plane.complete_task(task_id).await;
                }
            }
        }
    }

    async fn publish_reply(&self, broker: &mut Broker, reply_to: &str, payload: Vec<u8>) -> Result<(), mtrpc_shared::ServerError> {
        let exchange = self.config.response_exchange.clone();
        let factory = self.factory.clone();
        // `RefCell` so the action and reconnect closures can share one
        // handle: the action clones it out to publish, the reconnect swaps
        // in a freshly (re)connected one after a failure.
        let current = std::cell::RefCell::new(broker.clone());
        let result = retry_action(
            &self.config.retry_policy,
            &self.metrics,
            || {
                let exchange = exchange.clone();
                let reply_to = reply_to.to_string();
                let payload = payload.clone();
                let broker = current.borrow().clone();
                async move { broker.publish(&exchange, &reply_to, payload, true, None).await }
            },
            || {
                let factory = factory.clone();
                async move {
                    let reconnected = factory.connect().await?;
                    *current.borrow_mut() = reconnected;
                    Ok::<(), crate::broker::BrokerError>(())
                }
            },
        )
        .await;
        *broker = current.into_inner();
        result
    }

    async fn final_action(&self, broker: &Broker) {
        if let Err(err) = broker.close().await {
            tracing::warn!(error = %err, "error closing responder's broker connection");
        }

        let incomplete = self.control_plane.incomplete_tasks().await;
        let live_workers = self.control_plane.live_worker_count();
        if !incomplete.is_empty() {
            if live_workers > 0 {
                tracing::warn!(
                    incomplete = incomplete.len(),
                    live_workers,
                    "RPC tasks not completed; their results will be dropped"
                );
                if incomplete.len() as i64 != live_workers {
                    tracing::warn!("incomplete task count and live worker count disagree; some workers likely crashed");
                }
            } else {
                tracing::warn!(
                    incomplete = incomplete.len(),
                    "RPC tasks not completed and no live workers remain; some workers likely crashed"
                );
            }
        }
    }
}

async fn connect_with_retry_and_declare(
    factory: &BrokerFactory,
    exchange: &str,
    policy: &RetryPolicy,
    metrics: &RetryMetrics,
) -> Result<Broker, mtrpc_shared::ServerError> {
    let broker = mtrpc_shared::resilience::connect_with_retry(policy, metrics, || factory.connect()).await?;
    broker
        .declare_exchange(exchange, ExchangeKind::Direct, true)
        .await
        .map_err(|e| mtrpc_shared::ServerError::Amqp { attempts: 1, detail: e.to_string() })?;
    Ok(broker)
}
