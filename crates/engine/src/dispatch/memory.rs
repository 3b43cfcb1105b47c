//! In-memory implementation of JobDispatcher

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

use super::job::*;

/// Receiving end of the step queue, shared by all step workers
#[derive(Clone)]
pub struct StepQueue {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
}

impl StepQueue {
    /// Wait for the next queued job; `None` once the dispatcher is gone
    pub async fn next(&self) -> Option<Job> {
        self.rx.lock().await.recv().await
    }
}

/// In-memory implementation of JobDispatcher
///
/// Jobs live in a map; every transition to QUEUED pushes a copy onto an
/// unbounded channel consumed through [`StepQueue`]. The trampoline puts at
/// most one step per workflow in flight, so the queue is bounded by the
/// number of live workflows.
pub struct InMemoryJobDispatcher {
    jobs: RwLock<HashMap<Uuid, Job>>,
    queue_tx: mpsc::UnboundedSender<Job>,
    queue: StepQueue,
}

impl InMemoryJobDispatcher {
    pub fn new() -> Self {
        let (queue_tx, rx) = mpsc::unbounded_channel();
        Self {
            jobs: RwLock::new(HashMap::new()),
            queue_tx,
            queue: StepQueue {
                rx: Arc::new(Mutex::new(rx)),
            },
        }
    }

    /// Handle for step workers
    pub fn queue(&self) -> StepQueue {
        self.queue.clone()
    }

    /// Get the number of jobs
    pub fn job_count(&self) -> usize {
        self.jobs.read().len()
    }

    /// Count jobs of one kind, e.g. scheduled operation steps
    pub fn count_jobs(&self, kind: StepKind) -> usize {
        self.jobs.read().values().filter(|j| j.kind == kind).count()
    }

    /// Count jobs in a status
    pub fn count_by_status(&self, status: JobStatus) -> usize {
        self.jobs
            .read()
            .values()
            .filter(|j| j.status == status)
            .count()
    }

    fn enqueue(&self, job: &Job) -> Result<(), DispatchError> {
        debug!(job_id = %job.id, kind = %job.kind, "Dispatching job");
        self.queue_tx
            .send(job.clone())
            .map_err(|_| DispatchError::Unavailable("step queue closed".to_string()))
    }
}

impl Default for InMemoryJobDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobDispatcher for InMemoryJobDispatcher {
    async fn create_job(
        &self,
        job_type: &str,
        kind: StepKind,
        args: Vec<String>,
        payload: Option<String>,
        start_immediately: bool,
    ) -> Result<Job, DispatchError> {
        let mut job = Job::new(job_type, kind, args);
        job.payload = payload;
        if start_immediately {
            job.status = JobStatus::Queued;
        }

        self.jobs.write().insert(job.id, job.clone());
        if start_immediately {
            self.enqueue(&job)?;
        }
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Job, DispatchError> {
        self.jobs
            .read()
            .get(&id)
            .cloned()
            .ok_or(DispatchError::JobNotFound(id))
    }

    async fn update_job(&self, job: &Job) -> Result<Job, DispatchError> {
        let previous = {
            let mut jobs = self.jobs.write();
            let previous = jobs
                .get(&job.id)
                .map(|j| j.status)
                .ok_or(DispatchError::JobNotFound(job.id))?;
            jobs.insert(job.id, job.clone());
            previous
        };

        if job.status == JobStatus::Queued && previous != JobStatus::Queued {
            self.enqueue(job)?;
        }
        Ok(job.clone())
    }
}
