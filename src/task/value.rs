//! Value-producing task and its result handle.
//!
//! A `ValueTask` always resolves: the handle yields the computed value when
//! the run succeeds and the configured default when it fails, is cancelled,
//! or is abandoned at shutdown. Callers who want the failure itself use
//! [`ResultHandle::outcome`].

use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::dispatch::Dispatcher;
use crate::error::{FailureCause, TaskError};
use crate::task::listener::TaskListener;
use crate::task::state::{Affinity, Executable, TaskControl, TaskCore};
use crate::util::lock_unpoisoned;

type ValueFn<T> = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// A unit of work producing a value of type `T`.
///
/// ```
/// # tokio_test::block_on(async {
/// use std::sync::Arc;
/// use tasklane::{Dispatcher, ValueTask};
///
/// let dispatcher = Dispatcher::new();
/// let task = Arc::new(ValueTask::new(-1, || async { Ok(21 * 2) }));
/// assert_eq!(task.execute(&dispatcher).await.unwrap(), 42);
/// dispatcher.shutdown().await;
/// # });
/// ```
pub struct ValueTask<T> {
    core: TaskCore,
    work: ValueFn<T>,
    default: T,
    result: Mutex<Option<T>>,
    pending: Mutex<Option<oneshot::Sender<Result<T, FailureCause>>>>,
}

impl<T> ValueTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Wrap async work returning `T`. `default` is what retrieval yields
    /// whenever the run does not produce a value.
    pub fn new<F, Fut>(default: T, work: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::build(None, default, work)
    }

    /// Same as [`new`](Self::new) with an explicit task id.
    pub fn with_id<F, Fut>(id: impl Into<String>, default: T, work: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::build(Some(id.into()), default, work)
    }

    fn build<F, Fut>(id: Option<String>, default: T, work: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            core: TaskCore::new(id),
            work: Arc::new(move || Box::pin(work())),
            default,
            result: Mutex::new(None),
            pending: Mutex::new(None),
        }
    }

    pub fn with_affinity(mut self, affinity: Affinity) -> Self {
        self.core.set_affinity(affinity);
        self
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.core.set_delay(delay);
        self
    }

    pub fn with_listener(self, listener: Arc<dyn TaskListener>) -> Self {
        self.add_listener(listener);
        self
    }

    pub fn with_property(self, key: &str, value: Value) -> Self {
        self.add_property(key, value);
        self
    }

    /// The value the last successful run produced, if any.
    pub fn result(&self) -> Option<T> {
        lock_unpoisoned(&self.result).clone()
    }

    /// The configured fallback value.
    pub fn default_result(&self) -> &T {
        &self.default
    }

    /// Submit and receive a handle. The handle resolves when the run
    /// settles; only the retriever blocks on it.
    pub fn submit(
        self: &Arc<Self>,
        dispatcher: &Dispatcher,
    ) -> Result<ResultHandle<T>, TaskError> {
        dispatcher.check_active()?;
        self.core.reserve()?;
        let (tx, rx) = oneshot::channel();
        *lock_unpoisoned(&self.pending) = Some(tx);
        dispatcher.dispatch_reserved(self.clone());
        Ok(ResultHandle {
            task_id: self.core.id().to_string(),
            default: self.default.clone(),
            rx,
        })
    }

    /// Submit and wait for the result in one call.
    pub async fn execute(self: &Arc<Self>, dispatcher: &Dispatcher) -> Result<T, TaskError> {
        Ok(self.submit(dispatcher)?.join().await)
    }
}

impl<T> TaskControl for ValueTask<T> {
    fn core(&self) -> &TaskCore {
        &self.core
    }
}

#[async_trait]
impl<T> Executable for ValueTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn work(&self) -> anyhow::Result<()> {
        let value = (self.work)().await?;
        *lock_unpoisoned(&self.result) = Some(value);
        Ok(())
    }

    fn settle(&self, outcome: &Result<(), FailureCause>) {
        let Some(tx) = lock_unpoisoned(&self.pending).take() else {
            return;
        };
        let payload = match outcome {
            Ok(()) => Ok(self
                .result()
                .unwrap_or_else(|| self.default.clone())),
            Err(cause) => Err(cause.clone()),
        };
        let _ = tx.send(payload);
    }
}

impl<T> PartialEq for ValueTask<T> {
    fn eq(&self, other: &Self) -> bool {
        self.core.id() == other.core.id()
    }
}

impl<T> std::fmt::Debug for ValueTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueTask")
            .field("id", &self.core.id())
            .field("state", &self.core.state())
            .finish()
    }
}

/// Retrieval end of a value-producing submission.
///
/// Resolves once the run settles. Dropping the handle does not affect the
/// run.
#[derive(Debug)]
pub struct ResultHandle<T> {
    task_id: String,
    default: T,
    rx: oneshot::Receiver<Result<T, FailureCause>>,
}

impl<T> ResultHandle<T> {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Wait for the run to settle; yields the computed value, or the
    /// default if the run failed, was cancelled, or was abandoned.
    pub async fn join(self) -> T {
        match self.rx.await {
            Ok(Ok(value)) => value,
            Ok(Err(cause)) => {
                tracing::debug!(task = %self.task_id, %cause, "yielding default result");
                self.default
            }
            Err(_) => self.default,
        }
    }

    /// Like [`join`](Self::join), but surfaces the failure instead of
    /// degrading to the default.
    pub async fn outcome(self) -> Result<T, TaskError> {
        match self.rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(cause)) => Err(TaskError::Failed {
                task_id: self.task_id,
                cause,
            }),
            Err(_) => Err(TaskError::Failed {
                task_id: self.task_id,
                cause: FailureCause::Cancelled,
            }),
        }
    }

    /// Blocking form of [`join`](Self::join) for non-async callers. Must
    /// not be called from inside the runtime.
    pub fn join_blocking(self) -> T {
        match self.rx.blocking_recv() {
            Ok(Ok(value)) => value,
            Ok(Err(cause)) => {
                tracing::debug!(task = %self.task_id, %cause, "yielding default result");
                self.default
            }
            Err(_) => self.default,
        }
    }

    /// Non-blocking poll: `None` while the run is still in flight.
    pub fn try_join(&mut self) -> Option<T>
    where
        T: Clone,
    {
        match self.rx.try_recv() {
            Ok(Ok(value)) => Some(value),
            Ok(Err(_)) => Some(self.default.clone()),
            Err(oneshot::error::TryRecvError::Closed) => Some(self.default.clone()),
            Err(oneshot::error::TryRecvError::Empty) => None,
        }
    }
}
