//! The dispatcher: main lane, worker pool, delays, and shutdown.
//!
//! One `Dispatcher` value owns both execution paths. The main lane is a
//! single driver task consuming an unbounded job queue, so zero-delay
//! main-affinity jobs run strictly in submission order. Background jobs are
//! spawned onto the runtime but gated by a semaphore holding
//! `min(cores × multiplier, cap)` permits, fixed at construction.
//!
//! There is no global instance: construct the dispatcher once at process
//! start and pass it by reference. Cloning is cheap and clones share the
//! same lanes. `shutdown` is explicit; a fresh engine is a fresh value.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherConfig;
use crate::error::{FailureCause, TaskError};
use crate::hardware::SystemCores;
use crate::task::{run, Affinity, Executable, TaskControl};
use crate::util::lock_unpoisoned;

use futures::future::BoxFuture;

type Job = BoxFuture<'static, ()>;

tokio::task_local! {
    static ON_MAIN_LANE: bool;
}

/// Handle to the engine's execution lanes.
///
/// Must be created inside a tokio runtime. [`shutdown`](Self::shutdown)
/// must not be awaited from inside task work running on this dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    main_tx: mpsc::UnboundedSender<Job>,
    pool: Arc<Semaphore>,
    pool_size: usize,
    shutdown: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Dispatcher with default sizing, probing the host core count.
    pub fn new() -> Self {
        Self::with_config(DispatcherConfig::default())
    }

    /// Dispatcher with explicit sizing.
    pub fn with_config(config: DispatcherConfig) -> Self {
        let pool_size = config.pool_size(&SystemCores);
        let (main_tx, main_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let driver = tokio::spawn(drive_main_lane(main_rx, shutdown.clone()));
        tracing::info!(pool_size, "dispatcher started");
        Self {
            inner: Arc::new(Inner {
                main_tx,
                pool: Arc::new(Semaphore::new(pool_size)),
                pool_size,
                shutdown,
                driver: Mutex::new(Some(driver)),
            }),
        }
    }

    /// Number of permits in the background pool.
    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_terminated(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Whether the calling code is executing on the main lane.
    pub fn on_main_lane() -> bool {
        ON_MAIN_LANE.try_with(|on| *on).unwrap_or(false)
    }

    /// Stop intake and wind the lanes down: jobs already queued on the main
    /// lane run to completion, in-flight background work finishes, and
    /// delayed or queued-but-unstarted jobs are abandoned (their tasks
    /// settle as cancelled). Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        tracing::info!("dispatcher shutting down");
        self.inner.shutdown.cancel();

        let driver = lock_unpoisoned(&self.inner.driver).take();
        if let Some(handle) = driver {
            if Self::on_main_lane() {
                tracing::warn!("shutdown called from the main lane; skipping drain wait");
            } else if let Err(err) = handle.await {
                tracing::warn!(error = %err, "main lane driver ended abnormally");
            }
        }

        // All permits back means no background job is still running.
        if let Ok(_all) = self
            .inner
            .pool
            .acquire_many(self.inner.pool_size as u32)
            .await
        {
            tracing::debug!("background pool drained");
        }
        self.inner.pool.close();
    }

    pub(crate) fn check_active(&self) -> Result<(), TaskError> {
        if self.inner.shutdown.is_cancelled() {
            Err(TaskError::Terminated)
        } else {
            Ok(())
        }
    }

    /// Reserve and dispatch in one call: the synchronous `AlreadyRunning`
    /// gate, then routing by affinity and delay.
    pub(crate) fn submit_task(&self, task: Arc<dyn Executable>) -> Result<(), TaskError> {
        self.check_active()?;
        task.core().reserve()?;
        self.dispatch_reserved(task);
        Ok(())
    }

    /// Route a task that already holds its single-run reservation.
    pub(crate) fn dispatch_reserved(&self, task: Arc<dyn Executable>) {
        let affinity = task.core().affinity();
        let delay = task.core().delay();
        tracing::debug!(
            task = %task.core().id(),
            affinity = ?affinity,
            delay_ms = delay.as_millis() as u64,
            "task submitted"
        );
        let dispatcher = self.clone();
        match affinity {
            Affinity::Main if delay.is_zero() => {
                // Synchronous enqueue: submission order is execution order.
                let job_task = task.clone();
                let job: Job = Box::pin(async move { run(job_task, dispatcher).await });
                if self.inner.main_tx.send(job).is_err() {
                    abandon(&task);
                }
            }
            Affinity::Main => {
                let main_tx = self.inner.main_tx.clone();
                let shutdown = self.inner.shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            let job_task = task.clone();
                            let job: Job = Box::pin(async move { run(job_task, dispatcher).await });
                            if main_tx.send(job).is_err() {
                                abandon(&task);
                            }
                        }
                        _ = shutdown.cancelled() => abandon(&task),
                    }
                });
            }
            Affinity::Background => {
                let pool = self.inner.pool.clone();
                let shutdown = self.inner.shutdown.clone();
                tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.cancelled() => {
                                abandon(&task);
                                return;
                            }
                        }
                    }
                    let permit = tokio::select! {
                        acquired = pool.acquire_owned() => match acquired {
                            Ok(permit) => permit,
                            Err(_) => {
                                abandon(&task);
                                return;
                            }
                        },
                        _ = shutdown.cancelled() => {
                            abandon(&task);
                            return;
                        }
                    };
                    run(task, dispatcher).await;
                    drop(permit);
                });
            }
        }
    }

    /// Dispatch one listener callback with the originating task's affinity.
    /// Background callbacks consume pool permits like any other work.
    pub(crate) fn notify(&self, affinity: Affinity, job: Job) {
        match affinity {
            Affinity::Main => {
                if self.inner.main_tx.send(job).is_err() {
                    tracing::debug!("dropping notification; dispatcher is shut down");
                }
            }
            Affinity::Background => {
                if self.inner.shutdown.is_cancelled() {
                    tracing::debug!("dropping notification; dispatcher is shut down");
                    return;
                }
                let pool = self.inner.pool.clone();
                let shutdown = self.inner.shutdown.clone();
                tokio::spawn(async move {
                    let permit = tokio::select! {
                        acquired = pool.acquire_owned() => match acquired {
                            Ok(permit) => permit,
                            Err(_) => return,
                        },
                        _ = shutdown.cancelled() => return,
                    };
                    job.await;
                    drop(permit);
                });
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pool_size", &self.inner.pool_size)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Settle a task whose run will never start: state back to idle, pending
/// result handles resolved as cancelled. Listener notification is skipped;
/// the lanes that would carry it are going away.
fn abandon(task: &Arc<dyn Executable>) {
    tracing::debug!(task = %task.core().id(), "abandoning unstarted task");
    task.core().finish();
    task.settle(&Err(FailureCause::Cancelled));
}

/// Consume the main-lane queue, one job at a time, in arrival order. On
/// shutdown the queue is closed and whatever is already buffered still runs.
async fn drive_main_lane(mut rx: mpsc::UnboundedReceiver<Job>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            job = rx.recv() => match job {
                Some(job) => ON_MAIN_LANE.scope(true, job).await,
                None => break,
            },
            _ = shutdown.cancelled() => {
                rx.close();
                while let Some(job) = rx.recv().await {
                    ON_MAIN_LANE.scope(true, job).await;
                }
                break;
            }
        }
    }
    tracing::debug!("main lane driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::error::FailureCause;
    use crate::task::{
        ActionTask, Affinity, PipelineTask, TaskControl, TaskListener, TaskState, ValueTask,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};
    use tokio::sync::Notify;

    fn small_dispatcher() -> Dispatcher {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Dispatcher::with_config(DispatcherConfig {
            core_count: Some(1),
            ..Default::default()
        })
    }

    /// Listener recording events and waking a waiter on failure/completion.
    #[derive(Default)]
    struct Recorder {
        started: AtomicU32,
        completed: AtomicU32,
        failed: AtomicU32,
        cancelled_causes: AtomicU32,
        stop_causes: AtomicU32,
        settled: Notify,
    }

    impl Recorder {
        async fn wait_settled(&self) {
            self.settled.notified().await;
        }
    }

    #[async_trait]
    impl TaskListener for Recorder {
        async fn on_started(&self, _task_id: &str) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_completed(&self, _task_id: &str) {
            self.completed.fetch_add(1, Ordering::SeqCst);
            self.settled.notify_one();
        }

        async fn on_failed(&self, _task_id: &str, cause: &FailureCause) {
            self.failed.fetch_add(1, Ordering::SeqCst);
            match cause {
                FailureCause::Cancelled => {
                    self.cancelled_causes.fetch_add(1, Ordering::SeqCst);
                }
                FailureCause::StopRequested => {
                    self.stop_causes.fetch_add(1, Ordering::SeqCst);
                }
                FailureCause::Execution(_) => {}
            }
            self.settled.notify_one();
        }
    }

    #[tokio::test]
    async fn end_to_end_background_value_task() {
        let dispatcher = small_dispatcher();
        let task = Arc::new(
            ValueTask::new(-1, || async { Ok(21 * 2) }).with_affinity(Affinity::Background),
        );
        let handle = task.submit(&dispatcher).unwrap();
        assert_eq!(handle.join().await, 42);
        assert_eq!(task.result(), Some(42));
        assert_eq!(task.state(), TaskState::Idle);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn double_submission_fails_while_first_run_proceeds() {
        let dispatcher = small_dispatcher();
        let release = Arc::new(Notify::new());
        let gate = release.clone();
        let task = Arc::new(ValueTask::new(-1, move || {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(21 * 2)
            }
        }));

        let handle = task.submit(&dispatcher).unwrap();
        let second = task.submit(&dispatcher);
        assert!(matches!(second, Err(TaskError::AlreadyRunning { .. })));

        release.notify_one();
        assert_eq!(handle.join().await, 42);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn resubmission_after_settle_succeeds() {
        let dispatcher = small_dispatcher();
        let task = Arc::new(ValueTask::new(0, || async { Ok(7) }));
        assert_eq!(task.submit(&dispatcher).unwrap().join().await, 7);
        assert_eq!(task.submit(&dispatcher).unwrap().join().await, 7);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn failing_work_yields_the_default_result() {
        let dispatcher = small_dispatcher();
        let task = Arc::new(ValueTask::new(-1, || async {
            Err::<i64, _>(anyhow::anyhow!("disk on fire"))
        }));
        assert_eq!(task.submit(&dispatcher).unwrap().join().await, -1);
        assert_eq!(task.state(), TaskState::Idle);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn failing_work_surfaces_through_outcome() {
        let dispatcher = small_dispatcher();
        let task = Arc::new(ValueTask::new(-1, || async {
            Err::<i64, _>(anyhow::anyhow!("disk on fire"))
        }));
        let outcome = task.submit(&dispatcher).unwrap().outcome().await;
        match outcome {
            Err(TaskError::Failed { cause, .. }) => {
                assert!(matches!(cause, FailureCause::Execution(_)));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_before_submission_skips_work_and_notifies_cancelled() {
        let dispatcher = small_dispatcher();
        let ran = Arc::new(AtomicU32::new(0));
        let observed = ran.clone();
        let recorder = Arc::new(Recorder::default());

        let task = Arc::new(
            ActionTask::new(move || {
                observed.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .with_listener(recorder.clone()),
        );
        task.cancel();
        task.submit(&dispatcher).unwrap();

        recorder.wait_settled().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.failed.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.cancelled_causes.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.started.load(Ordering::SeqCst), 0);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn stop_request_aborts_with_its_own_cause() {
        let dispatcher = small_dispatcher();
        let recorder = Arc::new(Recorder::default());
        let task =
            Arc::new(ActionTask::new(|| async { Ok(()) }).with_listener(recorder.clone()));
        task.request_stop();
        task.submit(&dispatcher).unwrap();

        recorder.wait_settled().await;
        assert_eq!(recorder.failed.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.stop_causes.load(Ordering::SeqCst), 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_interrupts_blocked_work() {
        let dispatcher = small_dispatcher();
        let recorder = Arc::new(Recorder::default());
        let task = Arc::new(
            ValueTask::new(-1, || async {
                // Blocks until interrupted.
                std::future::pending::<()>().await;
                Ok(0)
            })
            .with_listener(recorder.clone()),
        );
        let handle = task.submit(&dispatcher).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.cancel();
        assert_eq!(handle.join().await, -1);
        recorder.wait_settled().await;
        assert_eq!(recorder.cancelled_causes.load(Ordering::SeqCst), 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn listeners_fire_started_then_completed() {
        let dispatcher = small_dispatcher();
        let recorder = Arc::new(Recorder::default());
        let task =
            Arc::new(ActionTask::new(|| async { Ok(()) }).with_listener(recorder.clone()));
        task.submit(&dispatcher).unwrap();
        recorder.wait_settled().await;
        assert_eq!(recorder.started.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.completed.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.failed.load(Ordering::SeqCst), 0);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn main_lane_runs_zero_delay_tasks_in_submission_order() {
        let dispatcher = small_dispatcher();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for n in 0..5u32 {
            let order = order.clone();
            tasks.push(Arc::new(
                ActionTask::new(move || {
                    let order = order.clone();
                    async move {
                        assert!(Dispatcher::on_main_lane());
                        lock_unpoisoned(&order).push(n);
                        Ok(())
                    }
                })
                .with_affinity(Affinity::Main),
            ));
        }
        for task in &tasks {
            task.submit(&dispatcher).unwrap();
        }
        dispatcher.shutdown().await;
        assert_eq!(*lock_unpoisoned(&order), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn delayed_main_task_begins_no_earlier_than_its_delay() {
        let dispatcher = small_dispatcher();
        let delay = Duration::from_millis(80);
        let started_at = Arc::new(Mutex::new(None));
        let stamp = started_at.clone();
        let submitted_at = Instant::now();
        let recorder = Arc::new(Recorder::default());

        let task = Arc::new(
            ActionTask::new(move || {
                *lock_unpoisoned(&stamp) = Some(Instant::now());
                async { Ok(()) }
            })
            .with_affinity(Affinity::Main)
            .with_delay(delay)
            .with_listener(recorder.clone()),
        );
        task.submit(&dispatcher).unwrap();
        recorder.wait_settled().await;

        let started = lock_unpoisoned(&started_at).expect("task never ran");
        assert!(started.duration_since(submitted_at) >= delay);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn delayed_task_is_overtaken_by_later_zero_delay_task() {
        let dispatcher = small_dispatcher();
        let order = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::new(Recorder::default());

        let slow_order = order.clone();
        let slow = Arc::new(
            ActionTask::new(move || {
                lock_unpoisoned(&slow_order).push("delayed");
                async { Ok(()) }
            })
            .with_affinity(Affinity::Main)
            .with_delay(Duration::from_millis(60))
            .with_listener(recorder.clone()),
        );
        let fast_order = order.clone();
        let fast = Arc::new(
            ActionTask::new(move || {
                lock_unpoisoned(&fast_order).push("immediate");
                async { Ok(()) }
            })
            .with_affinity(Affinity::Main),
        );

        slow.submit(&dispatcher).unwrap();
        fast.submit(&dispatcher).unwrap();
        recorder.wait_settled().await;

        assert_eq!(
            *lock_unpoisoned(&order),
            vec!["immediate".to_string(), "delayed".to_string()]
        );
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn chained_stage_receives_output_and_properties() {
        let dispatcher = small_dispatcher();
        let recorder = Arc::new(Recorder::default());

        let stage_a = Arc::new(
            PipelineTask::new(|n: i32| async move { Ok(n * 2) })
                .with_input(21)
                .with_property("trace", json!("abc")),
        );
        let stage_b = Arc::new(
            PipelineTask::new(|n: i32| async move { Ok(n.to_string()) })
                .with_listener(recorder.clone()),
        );
        stage_a.set_next(stage_b.clone()).unwrap();

        stage_a.submit(&dispatcher).unwrap();
        recorder.wait_settled().await;

        assert_eq!(stage_b.input(), Some(42));
        assert_eq!(stage_b.output(), Some("42".to_string()));
        assert_eq!(stage_b.property("trace"), Some(json!("abc")));
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn failed_stage_leaves_successor_untouched() {
        let dispatcher = small_dispatcher();
        let recorder = Arc::new(Recorder::default());

        let stage_a = Arc::new(
            PipelineTask::new(|_: i32| async move { Err::<i32, _>(anyhow::anyhow!("nope")) })
                .with_input(1)
                .with_listener(recorder.clone()),
        );
        let stage_b: Arc<PipelineTask<i32, i32>> =
            Arc::new(PipelineTask::new(|n| async move { Ok(n) }));
        stage_a.set_next(stage_b.clone()).unwrap();

        stage_a.submit(&dispatcher).unwrap();
        recorder.wait_settled().await;

        assert_eq!(stage_b.input(), None);
        assert_eq!(stage_b.state(), TaskState::Idle);
        assert!(!stage_b.is_cancelled());
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn submission_after_shutdown_is_refused() {
        let dispatcher = small_dispatcher();
        dispatcher.shutdown().await;
        assert!(dispatcher.is_terminated());

        let task = Arc::new(ActionTask::new(|| async { Ok(()) }));
        assert!(matches!(
            task.submit(&dispatcher),
            Err(TaskError::Terminated)
        ));
        assert_eq!(task.state(), TaskState::Idle);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_drains_background_work() {
        let dispatcher = small_dispatcher();
        let done = Arc::new(AtomicU32::new(0));
        let observed = done.clone();
        let task = Arc::new(ValueTask::new(0u32, move || {
            let observed = observed.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                observed.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            }
        }));
        let handle = task.submit(&dispatcher).unwrap();
        // Give the job time to claim its permit before intake stops.
        tokio::time::sleep(Duration::from_millis(5)).await;
        dispatcher.shutdown().await;
        dispatcher.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(handle.join().await, 1);
    }

    #[tokio::test]
    async fn abandoned_delayed_task_settles_with_default() {
        let dispatcher = small_dispatcher();
        let task = Arc::new(
            ValueTask::new(-1, || async { Ok(99) }).with_delay(Duration::from_secs(30)),
        );
        let handle = task.submit(&dispatcher).unwrap();
        dispatcher.shutdown().await;
        assert_eq!(handle.join().await, -1);
        assert_eq!(task.state(), TaskState::Idle);
    }

    #[tokio::test]
    async fn on_main_lane_is_false_off_lane() {
        assert!(!Dispatcher::on_main_lane());
    }

    #[tokio::test]
    async fn pool_size_is_fixed_at_construction() {
        let dispatcher = small_dispatcher();
        assert_eq!(dispatcher.pool_size(), 8);
        dispatcher.shutdown().await;
    }

    #[test]
    fn blocking_join_works_off_runtime() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (dispatcher, handle) = runtime.block_on(async {
            let dispatcher = small_dispatcher();
            let task = Arc::new(ValueTask::new(-1, || async { Ok(5) }));
            let handle = task.submit(&dispatcher).unwrap();
            (dispatcher, handle)
        });
        assert_eq!(handle.join_blocking(), 5);
        runtime.block_on(dispatcher.shutdown());
    }
}
