//! # Mediaflow Engine
//!
//! An orchestrator for media-processing pipelines. A workflow definition
//! is an ordered list of named operations; each operation is executed by
//! a pluggable handler against a media package.
//!
//! ## Features
//!
//! - **Asynchronous steps**: every operation runs in its own dispatched job
//! - **Pause and resume**: handlers may hold a workflow for external input
//! - **Failure protocol**: per-operation catch workflows spliced in on error
//! - **Property templating**: `${key}` placeholders resolved at each step
//! - **Indexed queries**: filters, paging and statistics over instances
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowEngine                          │
//! │  (start/resume/stop, one operation per step, failure splice) │
//! └─────────────────────────────────────────────────────────────┘
//!          │ update                              │ create_job
//!          ▼                                     ▼
//! ┌──────────────────────┐           ┌──────────────────────────┐
//! │    WorkflowIndex     │           │       JobDispatcher      │
//! │ (instance snapshots) │           │  (queued step jobs)      │
//! └──────────────────────┘           └──────────────────────────┘
//!                                                │
//!                                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StepWorkerPool                           │
//! │  (pulls queued jobs, calls WorkflowEngine::process_step)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use mediaflow_engine::prelude::*;
//!
//! let dispatcher = Arc::new(InMemoryJobDispatcher::new());
//! let engine = Arc::new(WorkflowEngine::new(
//!     Arc::new(InMemoryWorkflowIndex::new()),
//!     dispatcher.clone(),
//!     EngineConfig::from_env(),
//! ));
//! register_builtin_handlers(engine.handlers())?;
//!
//! let pool = StepWorkerPool::new(
//!     engine.clone(),
//!     dispatcher.queue(),
//!     engine.config().step_worker_config(),
//! );
//! pool.start().await?;
//!
//! let definition = WorkflowDefinition::new("publish")
//!     .with_operation(OperationDefinition::new("continue"));
//! let workflow = engine
//!     .start(&definition, MediaPackage::new("mp-1"), None, BTreeMap::new())
//!     .await?;
//! ```

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod handler;
pub mod listener;
pub mod metadata;
pub mod persistence;
pub mod template;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::dispatch::{
        InMemoryJobDispatcher, Job, JobDispatcher, JobStatus, StepKind, StepWorkerConfig,
        StepWorkerPool,
    };
    pub use crate::engine::{EngineError, WorkflowEngine};
    pub use crate::handler::{
        register_builtin_handlers, Action, OperationError, OperationHandler, OperationResult,
        ResumableOperationHandler,
    };
    pub use crate::listener::{WorkflowListener, WorkflowStateListener};
    pub use crate::metadata::{CatalogMetadata, MetadataService};
    pub use crate::persistence::{InMemoryWorkflowIndex, WorkflowIndex, WorkflowQuery};
    pub use crate::workflow::{
        MediaPackage, OperationDefinition, OperationState, WorkflowDefinition, WorkflowInstance,
        WorkflowState,
    };
}

// Re-export key types at crate root
pub use config::EngineConfig;
pub use dispatch::{InMemoryJobDispatcher, JobDispatcher, StepWorkerConfig, StepWorkerPool};
pub use engine::{EngineError, WorkflowEngine};
pub use handler::{
    HandlerRegistry, OperationError, OperationHandler, OperationResult, ResumableOperationHandler,
};
pub use listener::{ListenerError, WorkflowListener, WorkflowStateListener};
pub use persistence::{InMemoryWorkflowIndex, WorkflowIndex, WorkflowQuery};
pub use workflow::{
    MediaPackage, OperationDefinition, OperationState, WorkflowDefinition, WorkflowInstance,
    WorkflowState,
};
