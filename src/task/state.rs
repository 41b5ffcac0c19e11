//! The execution lifecycle shared by every task variant.
//!
//! # State machine
//! ```text
//! Idle -> Scheduled -> Starting -> Working -> Completing -> Idle
//!              \            \          \
//!               \            \          \-> Failed -> Idle
//!                \            \-> Failed -> Idle
//!                 \-> Failed -> Idle
//! ```
//! `Scheduled` covers the window between submission and the first step
//! (non-zero delays, queue wait). `Failed` is terminal for a run, not for
//! the task object: once the run settles the state returns to `Idle` and
//! the task may be submitted again.
//!
//! The three steps (start, work, complete) execute in strict order. Before
//! each step the engine checks for cancellation and stop requests; the work
//! step additionally races the work future against the cancellation token so
//! a blocked worker is woken. Whatever the outcome, the settle hook runs
//! last: state back to `Idle`, pending result handles resolved.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::dispatch::Dispatcher;
use crate::error::{FailureCause, TaskError};
use crate::task::listener::{ListenerSet, TaskListener};
use crate::task::properties::{PropertyBag, PropertyMap};
use crate::util::{lock_unpoisoned, random_task_id};

/// Where a task's steps (and its listener callbacks) execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Affinity {
    /// The single ordered main lane.
    Main,
    /// Any worker from the bounded pool.
    #[default]
    Background,
}

/// Lifecycle state of a task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// No run in flight; the task accepts submission.
    Idle,
    /// Submitted, waiting for its delay or a lane slot.
    Scheduled,
    /// Start step: listeners are being notified.
    Starting,
    /// Work step in progress.
    Working,
    /// Work finished; completion notifications and chain forwarding.
    Completing,
    /// The run aborted or errored; collapses to `Idle` on settle.
    Failed,
}

impl TaskState {
    /// Whether a run is in flight. `Scheduled` counts: a task waiting out
    /// its delay already holds the single-run reservation.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TaskState::Scheduled | TaskState::Starting | TaskState::Working | TaskState::Completing
        )
    }
}

/// Serializable point-in-time view of a task, for logs and dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub state: TaskState,
    pub cancelled: bool,
    pub stop_requested: bool,
    pub affinity: Affinity,
    pub delay_ms: u64,
}

/// State shared by every task variant: identity, lifecycle, flags,
/// properties, and listeners.
///
/// The lifecycle is one value behind one mutex; cancellation is a token
/// (sticky flag + wake-up); the stop request is a plain atomic checked at
/// step boundaries. Each container has its own guard, so no cross-container
/// atomicity is implied — the single-run guarantee comes from the atomic
/// `Idle -> Scheduled` gate in [`TaskCore::reserve`].
pub struct TaskCore {
    id: String,
    affinity: Affinity,
    delay: Duration,
    state: Mutex<TaskState>,
    cancel: CancellationToken,
    stop_requested: AtomicBool,
    properties: PropertyBag,
    listeners: ListenerSet,
}

impl TaskCore {
    pub(crate) fn new(id: Option<String>) -> Self {
        Self {
            id: id.unwrap_or_else(random_task_id),
            affinity: Affinity::default(),
            delay: Duration::ZERO,
            state: Mutex::new(TaskState::Idle),
            cancel: CancellationToken::new(),
            stop_requested: AtomicBool::new(false),
            properties: PropertyBag::new(),
            listeners: ListenerSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn affinity(&self) -> Affinity {
        self.affinity
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub(crate) fn set_affinity(&mut self, affinity: Affinity) {
        self.affinity = affinity;
    }

    pub(crate) fn set_delay(&mut self, delay: Duration) {
        self.delay = delay;
    }

    pub fn state(&self) -> TaskState {
        *lock_unpoisoned(&self.state)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Request interruption of the current run (if any), mark cancelled,
    /// and request stop. Idempotent; effective before submission too.
    pub fn cancel(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        tracing::debug!(task = %self.id, "cancel requested");
    }

    /// Set the stop flag without interrupting in-flight work; honored at
    /// the next step boundary. Idempotent.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        tracing::debug!(task = %self.id, "stop requested");
    }

    pub fn bag(&self) -> &PropertyBag {
        &self.properties
    }

    pub fn listeners(&self) -> &ListenerSet {
        &self.listeners
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            state: self.state(),
            cancelled: self.is_cancelled(),
            stop_requested: self.is_stop_requested(),
            affinity: self.affinity,
            delay_ms: self.delay.as_millis() as u64,
        }
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Claim the single-run reservation: `Idle -> Scheduled`.
    ///
    /// Any other state means a run is in flight (or still settling) and the
    /// conflicting submission fails synchronously.
    pub(crate) fn reserve(&self) -> Result<(), TaskError> {
        let mut state = lock_unpoisoned(&self.state);
        match *state {
            TaskState::Idle => {
                *state = TaskState::Scheduled;
                Ok(())
            }
            _ => Err(TaskError::AlreadyRunning {
                task_id: self.id.clone(),
            }),
        }
    }

    pub(crate) fn transition(&self, next: TaskState) {
        *lock_unpoisoned(&self.state) = next;
        tracing::trace!(task = %self.id, state = ?next, "state transition");
    }

    /// The unconditional settle: state back to `Idle` regardless of outcome.
    pub(crate) fn finish(&self) {
        *lock_unpoisoned(&self.state) = TaskState::Idle;
    }

    /// Abort condition checked before each step. Cancellation outranks a
    /// plain stop request.
    pub(crate) fn checkpoint(&self) -> Result<(), FailureCause> {
        if self.is_cancelled() {
            Err(FailureCause::Cancelled)
        } else if self.is_stop_requested() {
            Err(FailureCause::StopRequested)
        } else {
            Ok(())
        }
    }

    pub(crate) fn notify_started(&self, dispatcher: &Dispatcher) {
        for listener in self.listeners.snapshot() {
            let id = self.id.clone();
            dispatcher.notify(
                self.affinity,
                Box::pin(async move { listener.on_started(&id).await }),
            );
        }
    }

    pub(crate) fn notify_completed(&self, dispatcher: &Dispatcher) {
        for listener in self.listeners.snapshot() {
            let id = self.id.clone();
            dispatcher.notify(
                self.affinity,
                Box::pin(async move { listener.on_completed(&id).await }),
            );
        }
    }

    pub(crate) fn notify_failed(&self, dispatcher: &Dispatcher, cause: &FailureCause) {
        for listener in self.listeners.snapshot() {
            let id = self.id.clone();
            let cause = cause.clone();
            dispatcher.notify(
                self.affinity,
                Box::pin(async move { listener.on_failed(&id, &cause).await }),
            );
        }
    }
}

impl std::fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCore")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("affinity", &self.affinity)
            .finish()
    }
}

/// Control and inspection surface shared by every task variant.
///
/// Bring this trait into scope to use `cancel`, `request_stop`, the listener
/// registry, and the property bag on any task type.
pub trait TaskControl {
    /// The shared engine state backing this task.
    fn core(&self) -> &TaskCore;

    fn id(&self) -> &str {
        self.core().id()
    }

    fn affinity(&self) -> Affinity {
        self.core().affinity()
    }

    fn delay(&self) -> Duration {
        self.core().delay()
    }

    fn state(&self) -> TaskState {
        self.core().state()
    }

    /// Whether a run is in flight (scheduled counts).
    fn is_running(&self) -> bool {
        self.core().state().is_in_flight()
    }

    fn is_cancelled(&self) -> bool {
        self.core().is_cancelled()
    }

    fn is_stop_requested(&self) -> bool {
        self.core().is_stop_requested()
    }

    fn cancel(&self) {
        self.core().cancel()
    }

    fn request_stop(&self) {
        self.core().request_stop()
    }

    fn snapshot(&self) -> TaskSnapshot {
        self.core().snapshot()
    }

    // Listener registry.

    fn add_listener(&self, listener: Arc<dyn TaskListener>) {
        self.core().listeners().add(listener)
    }

    fn add_listeners(&self, listeners: Vec<Arc<dyn TaskListener>>) {
        self.core().listeners().add_all(listeners)
    }

    fn remove_listener(&self, listener: &Arc<dyn TaskListener>) {
        self.core().listeners().remove(listener)
    }

    fn remove_listener_at(&self, position: usize) {
        self.core().listeners().remove_at(position)
    }

    fn clear_listeners(&self) {
        self.core().listeners().clear()
    }

    // Property bag.

    fn add_property(&self, key: &str, value: Value) {
        self.core().bag().insert(key, value)
    }

    fn add_properties(&self, values: PropertyMap) {
        self.core().bag().extend(values)
    }

    fn property(&self, key: &str) -> Option<Value> {
        self.core().bag().get(key)
    }

    fn remove_property(&self, key: &str) -> Option<Value> {
        self.core().bag().remove(key)
    }

    fn clear_properties(&self) {
        self.core().bag().clear()
    }

    /// Copy of the whole property bag.
    fn properties(&self) -> PropertyMap {
        self.core().bag().snapshot()
    }
}

/// Internal seam between the dispatcher and the task variants.
#[async_trait]
pub(crate) trait Executable: TaskControl + Send + Sync {
    /// The work step.
    async fn work(&self) -> anyhow::Result<()>;

    /// Runs after a successful complete step; pipeline stages forward to
    /// their successor here.
    async fn after_completed(&self, dispatcher: &Dispatcher) {
        let _ = dispatcher;
    }

    /// Runs exactly once when the run settles, after the state has returned
    /// to `Idle`. Value tasks resolve their pending result handle here.
    fn settle(&self, outcome: &Result<(), FailureCause>) {
        let _ = outcome;
    }
}

/// Drive one full run of `task`: steps, notifications, settle.
pub(crate) async fn run(task: Arc<dyn Executable>, dispatcher: Dispatcher) {
    let outcome = run_steps(task.as_ref(), &dispatcher).await;
    let core = task.core();
    match &outcome {
        Ok(()) => tracing::debug!(task = %core.id(), "task completed"),
        Err(cause) => {
            core.transition(TaskState::Failed);
            tracing::debug!(task = %core.id(), %cause, "task failed");
            core.notify_failed(&dispatcher, cause);
        }
    }
    core.finish();
    task.settle(&outcome);
}

async fn run_steps(task: &dyn Executable, dispatcher: &Dispatcher) -> Result<(), FailureCause> {
    let core = task.core();

    core.checkpoint()?;
    core.transition(TaskState::Starting);
    core.notify_started(dispatcher);

    core.checkpoint()?;
    core.transition(TaskState::Working);
    let cancelled = core.cancel_token();
    tokio::select! {
        biased;
        _ = cancelled.cancelled() => return Err(FailureCause::Cancelled),
        result = task.work() => result.map_err(FailureCause::from_work_error)?,
    }

    core.checkpoint()?;
    core.transition(TaskState::Completing);
    core.notify_completed(dispatcher);
    task.after_completed(dispatcher).await;
    Ok(())
}
