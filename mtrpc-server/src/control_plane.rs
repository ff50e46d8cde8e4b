//! The state Manager and Responder share (spec.md §5): the in-flight task
//! map and the Responder's stopping descriptor, jointly guarded by one
//! mutex, plus the FIFO result queue and the wake-up signal.
//!
//! Grounded on `mtrpc/server/threads.py`'s shared `task_dict` / `mutex` /
//! `result_fifo` triple, which `RPCManager.init` requires the manager and
//! responder to be constructed with the very same objects. The original's
//! OS pipe (`resp_stopping_fd_r` / `stopping_fd_w`), read via `select(2)`
//! alongside the AMQP socket, becomes a `tokio::sync::Notify` here: an
//! async-native "readiness signal" with the same role.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use mtrpc_tree::AccessContext;
use tokio::sync::{mpsc, Mutex, Notify};

/// Severity a stop request should be logged at, mirroring the original's
/// `loglevel` field of its `Stopping` namedtuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// A request to stop the server (spec.md §5). `force` tells the Responder
/// not to wait for in-flight tasks to drain before it gives up.
#[derive(Debug, Clone)]
pub struct StoppingDescriptor {
    pub reason: String,
    pub severity: Severity,
    pub force: bool,
}

impl StoppingDescriptor {
    pub fn new(reason: impl Into<String>, severity: Severity, force: bool) -> Self {
        Self {
            reason: reason.into(),
            severity,
            force,
        }
    }
}

/// One in-flight request, recorded between consume-ack and worker result
/// (spec.md §3 Task).
#[derive(Debug, Clone)]
pub struct Task {
    pub id: u64,
    pub request_body: Vec<u8>,
    pub access_context: AccessContext,
    pub access_key_pattern: String,
    pub access_keyhole_pattern: String,
    pub reply_to: Option<String>,
}

/// What a worker (or the manager, for a stop request) enqueues onto the
/// shared result FIFO.
#[derive(Debug)]
pub enum ResultMessage {
    Response {
        task_id: u64,
        reply_to: Option<String>,
        payload: Vec<u8>,
    },
    Stop(StoppingDescriptor),
}

struct ControlPlaneState {
    tasks: HashMap<u64, Task>,
    stopping: Option<StoppingDescriptor>,
}

/// Jointly guards the in-flight task map and the stopping descriptor
/// (spec.md §5's core invariant), and carries the FIFO/wake-up channels
/// built alongside it.
pub struct ControlPlane {
    state: Mutex<ControlPlaneState>,
    results_tx: mpsc::UnboundedSender<ResultMessage>,
    wakeup: Arc<Notify>,
    next_task_id: AtomicU64,
    live_workers: AtomicI64,
}

impl ControlPlane {
    /// Construct a control plane and the result-FIFO receiver the Responder
    /// owns (the original's `result_fifo` is handed to both sides at
    /// construction time; here the sender side lives in `ControlPlane` and
    /// the receiver is returned once, to its one owner).
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ResultMessage>) {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let plane = Arc::new(Self {
            state: Mutex::new(ControlPlaneState {
                tasks: HashMap::new(),
                stopping: None,
            }),
            results_tx,
            wakeup: Arc::new(Notify::new()),
            next_task_id: AtomicU64::new(1),
            live_workers: AtomicI64::new(0),
        });
        (plane, results_rx)
    }

    pub fn allocate_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn wakeup_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wakeup)
    }

    pub fn results_sender(&self) -> mpsc::UnboundedSender<ResultMessage> {
        self.results_tx.clone()
    }

    /// Record a freshly-consumed task, unless the responder has already
    /// started stopping (spec.md §5: "ack only after the task is recorded,
    /// and never record a new task once stopping has begun"). Returns
    /// whether the task was recorded — the caller acks the delivery only on
    /// `true`, matching `get_and_go`'s `task_recorded` guard.
    pub async fn try_record_task(&self, task: Task) -> bool {
        let mut state = self.state.lock().await;
        if state.stopping.is_some() {
            return false;
        }
        state.tasks.insert(task.id, task);
        true
    }

    /// Drop a completed task from the in-flight map (Responder, after a
    /// successfully published reply).
    pub async fn complete_task(&self, task_id: u64) {
        let mut state = self.state.lock().await;
        state.tasks.remove(&task_id);
    }

    /// Record a stop request — from the Manager, a signal handler, or the
    /// Responder itself relaying a `Stop` sentinel it already dequeued —
    /// then wake the manager so its select loop notices. The first caller
    /// to observe `stopping == None` also enqueues a `Stop` sentinel on the
    /// result FIFO (spec.md §2: "Manager tells Responder to stop via a
    /// sentinel on the FIFO"), which is what unblocks the Responder's
    /// blocking `results_rx.recv()` when there is no in-flight work left to
    /// wake it otherwise. A later call (including the Responder's own,
    /// after it dequeues that very sentinel) finds `stopping` already set
    /// and does not enqueue again.
    pub async fn begin_stopping(&self, descriptor: StoppingDescriptor) {
        let first = {
            let mut state = self.state.lock().await;
            if state.stopping.is_none() {
                state.stopping = Some(descriptor.clone());
                true
            } else {
                false
            }
        };
        if first {
            let _ = self.results_tx.send(ResultMessage::Stop(descriptor));
        }
        self.wakeup.notify_waiters();
    }

    pub async fn is_stopping(&self) -> Option<StoppingDescriptor> {
        self.state.lock().await.stopping.clone()
    }

    /// Escalate an already-begun stop to `force=true` (spec.md §6: the
    /// configured stop timeout expiring without a clean drain). A no-op if
    /// no stop has been requested yet, or if it is already forced.
    pub async fn escalate_force(&self) {
        let mut state = self.state.lock().await;
        if let Some(descriptor) = &mut state.stopping {
            descriptor.force = true;
        }
    }

    pub async fn in_flight_count(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    /// A snapshot of still-incomplete tasks, for the Responder's final
    /// discrepancy check against live worker count (spec.md §5, grounded on
    /// `RPCResponder.final_action`'s `not_completed` vs `task_threads`
    /// comparison).
    pub async fn incomplete_tasks(&self) -> Vec<Task> {
        self.state.lock().await.tasks.values().cloned().collect()
    }

    pub fn worker_spawned(&self) {
        self.live_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_finished(&self) {
        self.live_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn live_worker_count(&self) -> i64 {
        self.live_workers.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: u64) -> Task {
        Task {
            id,
            request_body: Vec::new(),
            access_context: AccessContext::new(),
            access_key_pattern: "{full_name}".into(),
            access_keyhole_pattern: ".".into(),
            reply_to: None,
        }
    }

    #[tokio::test]
    async fn task_is_recorded_while_not_stopping() {
        let (plane, _rx) = ControlPlane::new();
        assert!(plane.try_record_task(task(1)).await);
        assert_eq!(plane.in_flight_count().await, 1);
    }

    #[tokio::test]
    async fn no_new_task_is_recorded_once_stopping_has_begun() {
        let (plane, _rx) = ControlPlane::new();
        plane
            .begin_stopping(StoppingDescriptor::new("shutdown", Severity::Info, false))
            .await;
        assert!(!plane.try_record_task(task(1)).await);
        assert_eq!(plane.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn completing_a_task_removes_it_from_the_in_flight_map() {
        let (plane, _rx) = ControlPlane::new();
        plane.try_record_task(task(1)).await;
        plane.complete_task(1).await;
        assert_eq!(plane.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn stopping_is_sticky_to_the_first_descriptor() {
        let (plane, _rx) = ControlPlane::new();
        plane
            .begin_stopping(StoppingDescriptor::new("first", Severity::Info, false))
            .await;
        plane
            .begin_stopping(StoppingDescriptor::new("second", Severity::Error, true))
            .await;
        let descriptor = plane.is_stopping().await.unwrap();
        assert_eq!(descriptor.reason, "first");
    }

    #[tokio::test]
    async fn escalate_force_sets_force_on_an_already_begun_stop() {
        let (plane, _rx) = ControlPlane::new();
        plane
            .begin_stopping(StoppingDescriptor::new("graceful", Severity::Info, false))
            .await;
        plane.escalate_force().await;
        assert!(plane.is_stopping().await.unwrap().force);
    }

    #[tokio::test]
    async fn escalate_force_is_a_no_op_before_stopping_begins() {
        let (plane, _rx) = ControlPlane::new();
        plane.escalate_force().await;
        assert!(plane.is_stopping().await.is_none());
    }

    #[tokio::test]
    async fn begin_stopping_unblocks_a_recv_with_no_in_flight_work() {
        let (plane, mut rx) = ControlPlane::new();
        plane
            .begin_stopping(StoppingDescriptor::new("idle shutdown", Severity::Info, false))
            .await;
        let message = tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv())
            .await
            .expect("begin_stopping must enqueue a sentinel so an idle recv() unblocks")
            .unwrap();
        assert!(matches!(message, ResultMessage::Stop(_)));
    }

    #[tokio::test]
    async fn begin_stopping_only_enqueues_a_sentinel_once() {
        let (plane, mut rx) = ControlPlane::new();
        plane
            .begin_stopping(StoppingDescriptor::new("first", Severity::Info, false))
            .await;
        plane
            .begin_stopping(StoppingDescriptor::new("second", Severity::Error, true))
            .await;
        assert!(matches!(rx.recv().await.unwrap(), ResultMessage::Stop(_)));
        // drop the sender so a second, unexpected sentinel would show up as a
        // `None` close rather than hang the test.
        drop(plane);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn worker_count_tracks_spawns_and_completions() {
        let (plane, _rx) = ControlPlane::new();
        plane.worker_spawned();
        plane.worker_spawned();
        plane.worker_finished();
        assert_eq!(plane.live_worker_count(), 1);
    }
}
