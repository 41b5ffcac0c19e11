//! Pipeline stage: a task consuming an input and producing an output, with
//! an optional auto-submitted successor.
//!
//! Chains are linear and wired at configuration time: each stage knows only
//! its immediate successor, and the successor reference is immutable once
//! set. On success the stage merges its properties into the successor's bag
//! (this stage's values win per key), hands over its output as the
//! successor's input, and submits the successor on the same dispatcher. A
//! failed stage leaves its successor untouched.

use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::dispatch::Dispatcher;
use crate::error::TaskError;
use crate::task::listener::TaskListener;
use crate::task::properties::PropertyMap;
use crate::task::state::{Affinity, Executable, TaskControl, TaskCore};
use crate::util::lock_unpoisoned;

type StageFn<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, anyhow::Result<O>> + Send + Sync>;

/// Type-erased successor: accepts the upstream output and merged properties,
/// then submits itself.
trait NextStage<I>: Send + Sync {
    fn feed(&self, input: I, properties: PropertyMap);
    fn submit_stage(self: Arc<Self>, dispatcher: &Dispatcher) -> Result<(), TaskError>;
}

/// A chainable unit of work mapping an input `I` to an output `O`.
///
/// Stages that need no input use `I = ()` and set it at construction:
///
/// ```
/// # tokio_test::block_on(async {
/// use std::sync::Arc;
/// use tasklane::{Dispatcher, PipelineTask};
///
/// let dispatcher = Dispatcher::new();
/// let fetch = Arc::new(
///     PipelineTask::new(|()| async { Ok("payload".to_string()) }).with_input(()),
/// );
/// let measure = Arc::new(PipelineTask::new(|text: String| async move {
///     Ok(text.len())
/// }));
/// fetch.set_next(measure).unwrap();
/// fetch.submit(&dispatcher).unwrap();
/// dispatcher.shutdown().await;
/// # });
/// ```
pub struct PipelineTask<I, O> {
    core: TaskCore,
    work: StageFn<I, O>,
    input: Mutex<Option<I>>,
    output: Mutex<Option<O>>,
    next: OnceLock<Arc<dyn NextStage<O>>>,
}

impl<I, O> PipelineTask<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// Wrap async work mapping `I` to `O`. The input arrives either from
    /// [`with_input`](Self::with_input)/[`set_input`](Self::set_input) or
    /// from the upstream stage; running without one fails the work step.
    pub fn new<F, Fut>(work: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        Self::build(None, work)
    }

    /// Same as [`new`](Self::new) with an explicit task id.
    pub fn with_id<F, Fut>(id: impl Into<String>, work: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        Self::build(Some(id.into()), work)
    }

    fn build<F, Fut>(id: Option<String>, work: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        Self {
            core: TaskCore::new(id),
            work: Arc::new(move |input| Box::pin(work(input))),
            input: Mutex::new(None),
            output: Mutex::new(None),
            next: OnceLock::new(),
        }
    }

    pub fn with_input(self, input: I) -> Self {
        self.set_input(input);
        self
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

    pub fn set_input(&self, input: I) {
        *lock_unpoisoned(&self.input) = Some(input);
    }

    pub fn input(&self) -> Option<I> {
        lock_unpoisoned(&self.input).clone()
    }

    /// The output of the last successful run, if any.
    pub fn output(&self) -> Option<O> {
        lock_unpoisoned(&self.output).clone()
    }

    /// Wire the successor stage. The reference is immutable: a second call
    /// fails with `SuccessorAlreadySet`.
    pub fn set_next<P>(&self, next: Arc<PipelineTask<O, P>>) -> Result<(), TaskError>
    where
        P: Clone + Send + Sync + 'static,
    {
        self.next
            .set(next)
            .map_err(|_| TaskError::SuccessorAlreadySet {
                task_id: self.core.id().to_string(),
            })
    }

    pub fn has_next(&self) -> bool {
        self.next.get().is_some()
    }

    /// Submit this stage. Downstream stages are submitted automatically as
    /// their predecessors complete.
    pub fn submit(self: &Arc<Self>, dispatcher: &Dispatcher) -> Result<(), TaskError> {
        dispatcher.submit_task(self.clone())
    }
}

impl<I, O> TaskControl for PipelineTask<I, O> {
    fn core(&self) -> &TaskCore {
        &self.core
    }
}

#[async_trait]
impl<I, O> Executable for PipelineTask<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    async fn work(&self) -> anyhow::Result<()> {
        let input = self
            .input()
            .ok_or_else(|| anyhow::anyhow!("pipeline stage {} has no input", self.core.id()))?;
        let output = (self.work)(input).await?;
        *lock_unpoisoned(&self.output) = Some(output);
        Ok(())
    }

    async fn after_completed(&self, dispatcher: &Dispatcher) {
        let Some(next) = self.next.get() else {
            return;
        };
        let Some(output) = self.output() else {
            return;
        };
        next.feed(output, self.core.bag().snapshot());
        if let Err(err) = next.clone().submit_stage(dispatcher) {
            tracing::warn!(
                task = %self.core.id(),
                error = %err,
                "could not submit successor stage"
            );
        }
    }
}

impl<I, O> NextStage<I> for PipelineTask<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    fn feed(&self, input: I, properties: PropertyMap) {
        self.core.bag().extend(properties);
        self.set_input(input);
    }

    fn submit_stage(self: Arc<Self>, dispatcher: &Dispatcher) -> Result<(), TaskError> {
        dispatcher.submit_task(self)
    }
}

impl<I, O> PartialEq for PipelineTask<I, O> {
    fn eq(&self, other: &Self) -> bool {
        self.core.id() == other.core.id()
    }
}

impl<I, O> std::fmt::Debug for PipelineTask<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineTask")
            .field("id", &self.core.id())
            .field("state", &self.core.state())
            .field("has_next", &self.next.get().is_some())
            .finish()
    }
}
