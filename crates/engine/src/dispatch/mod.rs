//! Asynchronous step dispatch
//!
//! ```text
//! WorkflowEngine ──create_job/update_job──▶ JobDispatcher
//!        ▲                                      │ QUEUED
//!        │ process_step                         ▼
//!        └──────────────── StepWorkerPool ◀── StepQueue
//! ```
//!
//! Every job triggers exactly one engine step. A step either schedules
//! exactly one follow-up job or stops scheduling.

mod job;
mod memory;
mod worker;

pub use job::{DispatchError, Job, JobDispatcher, JobStatus, StepKind, WORKFLOW_JOB_TYPE};
pub use memory::{InMemoryJobDispatcher, StepQueue};
pub use worker::{StepWorkerConfig, StepWorkerError, StepWorkerPool, StepWorkerStatus};
