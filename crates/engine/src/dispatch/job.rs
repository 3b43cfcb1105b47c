//! Jobs and the JobDispatcher trait

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::WorkflowState;

/// Job type used for every workflow step
pub const WORKFLOW_JOB_TYPE: &str = "mediaflow.workflow";

/// Error type for dispatcher operations
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Job not found
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// Job could not be placed on the queue
    #[error("dispatch queue unavailable: {0}")]
    Unavailable(String),

    /// Job is missing required arguments or carries malformed ones
    #[error("invalid job: {0}")]
    InvalidJob(String),
}

/// Kind of engine step a job triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    /// Move an instantiated workflow to RUNNING; the job id is the workflow id
    StartWorkflow,
    /// Resume a paused workflow; args are `[workflow_id, step_sequence, properties_json]`
    Resume,
    /// Run the current operation; args are `[workflow_id, step_sequence]`
    StartOperation,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StartWorkflow => write!(f, "START_WORKFLOW"),
            Self::Resume => write!(f, "RESUME"),
            Self::StartOperation => write!(f, "START_OPERATION"),
        }
    }
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Instantiated,
    Queued,
    Running,
    Paused,
    Finished,
    Failed,
    Deleted,
}

impl JobStatus {
    /// Job status mirroring a workflow state; FAILING leaves the job as is
    pub fn for_workflow_state(state: WorkflowState) -> Option<JobStatus> {
        match state {
            WorkflowState::Instantiated => Some(JobStatus::Queued),
            WorkflowState::Running => Some(JobStatus::Running),
            WorkflowState::Paused => Some(JobStatus::Paused),
            WorkflowState::Stopped => Some(JobStatus::Deleted),
            WorkflowState::Succeeded => Some(JobStatus::Finished),
            WorkflowState::Failed => Some(JobStatus::Failed),
            WorkflowState::Failing => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instantiated => write!(f, "instantiated"),
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Finished => write!(f, "finished"),
            Self::Failed => write!(f, "failed"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

/// A unit of asynchronous work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub kind: StepKind,
    pub args: Vec<String>,
    pub payload: Option<String>,
    pub status: JobStatus,
    pub date_created: DateTime<Utc>,
    pub date_started: Option<DateTime<Utc>>,
    pub date_completed: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(job_type: impl Into<String>, kind: StepKind, args: Vec<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_type: job_type.into(),
            kind,
            args,
            payload: None,
            status: JobStatus::Instantiated,
            date_created: Utc::now(),
            date_started: None,
            date_completed: None,
        }
    }

    /// Workflow this job belongs to
    pub fn workflow_id(&self) -> Result<Uuid, DispatchError> {
        match self.kind {
            StepKind::StartWorkflow => Ok(self.id),
            StepKind::Resume | StepKind::StartOperation => {
                let raw = self.args.first().ok_or_else(|| {
                    DispatchError::InvalidJob(format!(
                        "{} job {} has no workflow id",
                        self.kind, self.id
                    ))
                })?;
                Uuid::parse_str(raw).map_err(|e| {
                    DispatchError::InvalidJob(format!("job {} workflow id {}: {}", self.id, raw, e))
                })
            }
        }
    }

    /// Step sequence the job was scheduled with, if it carries one
    pub fn step_sequence(&self) -> Result<Option<u64>, DispatchError> {
        if self.kind == StepKind::StartWorkflow {
            return Ok(None);
        }
        self.args
            .get(1)
            .map(|raw| {
                raw.parse().map_err(|e| {
                    DispatchError::InvalidJob(format!(
                        "job {} step sequence {}: {}",
                        self.id, raw, e
                    ))
                })
            })
            .transpose()
    }

    /// Move to a new status, stamping start and completion times
    pub fn transition(&mut self, status: JobStatus) {
        let now = Utc::now();
        match status {
            JobStatus::Running if self.date_started.is_none() => self.date_started = Some(now),
            JobStatus::Finished | JobStatus::Failed | JobStatus::Deleted => {
                self.date_completed = Some(now)
            }
            _ => {}
        }
        self.status = status;
    }
}

/// Queue of asynchronous engine steps
///
/// A job created with `start_immediately` (or later updated to QUEUED) is
/// handed to a step worker exactly once per transition to QUEUED.
#[async_trait]
pub trait JobDispatcher: Send + Sync + 'static {
    /// Create a job, queueing it right away if `start_immediately` is set
    async fn create_job(
        &self,
        job_type: &str,
        kind: StepKind,
        args: Vec<String>,
        payload: Option<String>,
        start_immediately: bool,
    ) -> Result<Job, DispatchError>;

    async fn get_job(&self, id: Uuid) -> Result<Job, DispatchError>;

    /// Persist job changes; a transition to QUEUED dispatches the job
    async fn update_job(&self, job: &Job) -> Result<Job, DispatchError>;
}
