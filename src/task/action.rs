//! Fire-and-forget task wrapping work with no return value.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::dispatch::Dispatcher;
use crate::error::TaskError;
use crate::task::listener::TaskListener;
use crate::task::state::{Affinity, Executable, TaskControl, TaskCore};

type ActionFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A unit of work with no result.
///
/// ```
/// # tokio_test::block_on(async {
/// use std::sync::Arc;
/// use tasklane::{ActionTask, Dispatcher};
///
/// let dispatcher = Dispatcher::new();
/// let task = Arc::new(ActionTask::from_fn(|| println!("hello")));
/// task.submit(&dispatcher).unwrap();
/// dispatcher.shutdown().await;
/// # });
/// ```
pub struct ActionTask {
    core: TaskCore,
    work: ActionFn,
}

impl ActionTask {
    /// Wrap an async unit of work.
    pub fn new<F, Fut>(work: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            core: TaskCore::new(None),
            work: Arc::new(move || Box::pin(work())),
        }
    }

    /// Same as [`new`](Self::new) with an explicit task id.
    pub fn with_id<F, Fut>(id: impl Into<String>, work: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            core: TaskCore::new(Some(id.into())),
            work: Arc::new(move || Box::pin(work())),
        }
    }

    /// Adapt a plain callback into a task. The callback runs synchronously
    /// on whichever lane executes the task.
    pub fn from_fn<F>(callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::new(move || {
            callback();
            std::future::ready(Ok(()))
        })
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

    /// Submit for execution. Fails synchronously with `AlreadyRunning` if a
    /// run is in flight, or `Terminated` after dispatcher shutdown.
    pub fn submit(self: &Arc<Self>, dispatcher: &Dispatcher) -> Result<(), TaskError> {
        dispatcher.submit_task(self.clone())
    }
}

impl TaskControl for ActionTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }
}

#[async_trait]
impl Executable for ActionTask {
    async fn work(&self) -> anyhow::Result<()> {
        (self.work)().await
    }
}

impl PartialEq for ActionTask {
    fn eq(&self, other: &Self) -> bool {
        self.core.id() == other.core.id()
    }
}

impl std::fmt::Debug for ActionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionTask")
            .field("id", &self.core.id())
            .field("state", &self.core.state())
            .finish()
    }
}
