//! Step worker pool
//!
//! Consumes queued jobs and runs one engine step per job with bounded
//! concurrency. Workers hold no workflow state between steps; each step
//! reads the instance it needs from the index.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::job::{Job, JobDispatcher, JobStatus, StepKind};
use super::memory::StepQueue;
use crate::engine::WorkflowEngine;

/// Step worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepWorkerConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Maximum concurrently executing steps
    pub max_concurrency: usize,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for StepWorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("step-worker-{}", Uuid::now_v7()),
            max_concurrency: 4,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl StepWorkerConfig {
    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Step worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepWorkerStatus {
    /// Consuming steps
    Running,
    /// Finishing in-flight steps, not taking new ones
    Draining,
    Stopped,
}

/// Step worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum StepWorkerError {
    /// Pool already running
    #[error("step worker pool is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out with {0} steps in flight")]
    ShutdownTimeout(usize),
}

/// Pool of workers executing engine steps
///
/// # Example
///
/// ```ignore
/// let dispatcher = Arc::new(InMemoryJobDispatcher::new());
/// let engine = Arc::new(WorkflowEngine::new(index, dispatcher.clone(), config));
///
/// let pool = StepWorkerPool::new(engine, dispatcher.queue(), StepWorkerConfig::default());
/// pool.start().await?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct StepWorkerPool {
    engine: Arc<WorkflowEngine>,
    queue: StepQueue,
    config: StepWorkerConfig,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<StepWorkerStatus>,
    active_steps: Arc<Semaphore>,
    consume_handle: Mutex<Option<JoinHandle<()>>>,
}

impl StepWorkerPool {
    /// Create a new step worker pool
    pub fn new(engine: Arc<WorkflowEngine>, queue: StepQueue, config: StepWorkerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let max_concurrency = config.max_concurrency.max(1);

        Self {
            engine,
            queue,
            config,
            shutdown_tx,
            status: RwLock::new(StepWorkerStatus::Stopped),
            active_steps: Arc::new(Semaphore::new(max_concurrency)),
            consume_handle: Mutex::new(None),
        }
    }

    /// Start consuming steps
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), StepWorkerError> {
        {
            let mut status = self.status.write();
            if *status != StepWorkerStatus::Stopped {
                return Err(StepWorkerError::AlreadyRunning);
            }
            *status = StepWorkerStatus::Running;
        }

        info!(
            worker_id = %self.config.worker_id,
            max_concurrency = self.config.max_concurrency,
            "Starting step worker pool"
        );

        self.shutdown_tx.send_replace(false);
        self.start_consume_loop();
        Ok(())
    }

    /// Stop taking steps and wait for in-flight steps to finish
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), StepWorkerError> {
        {
            let mut status = self.status.write();
            if *status == StepWorkerStatus::Stopped {
                return Ok(());
            }
            *status = StepWorkerStatus::Draining;
        }

        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);

        let handle = self.consume_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Consume loop ended abnormally: {}", e);
            }
        }

        let max = self.config.max_concurrency.max(1);
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let available = self.active_steps.available_permits();
            if available == max {
                debug!("All steps completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(remaining_steps = max - available, "Shutdown timeout reached");
                *self.status.write() = StepWorkerStatus::Stopped;
                return Err(StepWorkerError::ShutdownTimeout(max - available));
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        *self.status.write() = StepWorkerStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "Step worker pool stopped");
        Ok(())
    }

    /// Get current status
    pub fn status(&self) -> StepWorkerStatus {
        *self.status.read()
    }

    /// Steps currently executing
    pub fn active_steps(&self) -> usize {
        self.config.max_concurrency.max(1) - self.active_steps.available_permits()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    fn start_consume_loop(&self) {
        let engine = Arc::clone(&self.engine);
        let queue = self.queue.clone();
        let active_steps = Arc::clone(&self.active_steps);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                let stopping = *shutdown_rx.borrow();
                if stopping {
                    break;
                }

                // Reserve capacity before taking a job so saturated workers leave it queued
                let permit = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    permit = Arc::clone(&active_steps).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let job = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    job = queue.next() => match job {
                        Some(job) => job,
                        None => {
                            debug!("Step queue closed");
                            break;
                        }
                    },
                };

                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    run_step(&engine, job).await;
                    drop(permit);
                });
            }

            debug!("Consume loop exited");
        });

        *self.consume_handle.lock() = Some(handle);
    }
}

/// Execute one job, tracking status for the step jobs the engine does not mirror
async fn run_step(engine: &WorkflowEngine, job: Job) {
    let tracked = job.kind != StepKind::StartWorkflow;
    let dispatcher = engine.dispatcher();

    if tracked {
        mark_job(dispatcher.as_ref(), job.id, JobStatus::Running).await;
    }

    let outcome = engine.process_step(&job).await;
    let status = match &outcome {
        Ok(()) => JobStatus::Finished,
        Err(e) => {
            error!(job_id = %job.id, kind = %job.kind, "Step failed: {}", e);
            JobStatus::Failed
        }
    };

    if tracked {
        mark_job(dispatcher.as_ref(), job.id, status).await;
    }
}

async fn mark_job(dispatcher: &dyn JobDispatcher, id: Uuid, status: JobStatus) {
    let result = async {
        let mut job = dispatcher.get_job(id).await?;
        job.transition(status);
        dispatcher.update_job(&job).await
    }
    .await;

    if let Err(e) = result {
        warn!(job_id = %id, %status, "Failed to update job status: {}", e);
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
