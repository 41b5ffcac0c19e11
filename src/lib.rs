//! # tasklane
//!
//! A uniform way to run units of work either on a single ordered "main"
//! lane or on a bounded worker pool, with lifecycle listeners, cooperative
//! cancellation, result retrieval, and chaining of dependent stages.
//!
//! ## Architecture
//!
//! ```text
//!   ActionTask / ValueTask / PipelineTask
//!        │  submit(&dispatcher)
//!        ▼
//!   ┌──────────────────────────────────────┐
//!   │              Dispatcher              │
//!   │  ┌────────────┐   ┌───────────────┐  │
//!   │  │ main lane  │   │  worker pool  │  │
//!   │  │ (ordered)  │   │ min(8c, 24)   │  │
//!   │  └────────────┘   └───────────────┘  │
//!   └──────────────────────────────────────┘
//!        │ start → work → complete
//!        ▼
//!   listeners (on_started / on_completed / on_failed),
//!   dispatched with the task's own affinity
//! ```
//!
//! ## Example
//!
//! ```
//! # tokio_test::block_on(async {
//! use std::sync::Arc;
//! use tasklane::{Dispatcher, ValueTask};
//!
//! let dispatcher = Dispatcher::new();
//!
//! let answer = Arc::new(ValueTask::new(-1, || async { Ok(21 * 2) }));
//! assert_eq!(answer.execute(&dispatcher).await.unwrap(), 42);
//!
//! // A second run of the same instance is a plain re-submission.
//! assert_eq!(answer.execute(&dispatcher).await.unwrap(), 42);
//!
//! dispatcher.shutdown().await;
//! # });
//! ```
//!
//! ## Modules
//! - `task`: the task variants and their shared control surface
//! - `dispatch`: the main lane, worker pool, and delay scheduling
//! - `config` / `hardware`: pool sizing and the core-count probe
//! - `error`: submission errors and run-failure causes

pub mod config;
pub mod dispatch;
pub mod error;
pub mod hardware;
pub mod task;
pub mod util;

pub use config::DispatcherConfig;
pub use dispatch::Dispatcher;
pub use error::{FailureCause, TaskError};
pub use task::{
    ActionTask, Affinity, ListenerSet, PipelineTask, PropertyBag, PropertyMap, ResultHandle,
    TaskControl, TaskCore, TaskListener, TaskSnapshot, TaskState, ValueTask,
};
