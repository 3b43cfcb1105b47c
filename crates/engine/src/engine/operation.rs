//! Single operation step execution

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use super::EngineError;
use crate::handler::{Action, HandlerRegistry, OperationError, OperationResult};
use crate::workflow::{OperationState, WorkflowInstance};

/// Result of running one operation through its handler
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Handler returned; `None` means CONTINUE
    Completed(Option<OperationResult>),
    /// Handler failed; the operation is already marked FAILED
    Failed(OperationError),
}

/// Runs the current operation of an instance against its handler
///
/// INSTANTIATED operations are started (or skipped when their conditions
/// say so), PAUSED operations are resumed. Every outcome other than a
/// pause is followed by the handler's `destroy` hook.
#[derive(Debug, Clone)]
pub struct OperationExecutor {
    handlers: Arc<HandlerRegistry>,
}

impl OperationExecutor {
    pub fn new(handlers: Arc<HandlerRegistry>) -> Self {
        Self { handlers }
    }

    /// Execute the current operation
    ///
    /// Returns an error only for structural problems (no current
    /// operation). Handler failures come back as [`StepOutcome::Failed`].
    #[instrument(skip(self, workflow, resume_properties), fields(workflow_id = %workflow.id))]
    pub async fn execute(
        &self,
        workflow: &mut WorkflowInstance,
        resume_properties: Option<&BTreeMap<String, String>>,
    ) -> Result<StepOutcome, EngineError> {
        let (operation, position, state, skip) = {
            let op = workflow.current_operation().ok_or_else(|| {
                EngineError::IllegalState(format!(
                    "workflow {} has no current operation",
                    workflow.id
                ))
            })?;
            (op.id.clone(), op.position, op.state, op.should_skip())
        };

        let Some(handler) = self.handlers.lookup(&operation) else {
            let error = OperationError::new(format!(
                "no handler registered for operation {}",
                operation
            ))
            .with_type("handler_not_found");
            mark_failed(workflow, position);
            return Ok(StepOutcome::Failed(error));
        };

        if let Some(op) = workflow.operation_mut(position) {
            op.date_started.get_or_insert_with(Utc::now);
        }

        let empty = BTreeMap::new();
        let outcome = match state {
            OperationState::Instantiated if skip => {
                debug!(%operation, position, "Skipping operation");
                handler.skip(workflow).await
            }
            OperationState::Instantiated => {
                debug!(%operation, position, "Starting operation");
                handler.start(workflow).await
            }
            OperationState::Paused => match handler.as_resumable() {
                Some(resumable) => {
                    debug!(%operation, position, "Resuming operation");
                    resumable
                        .resume(workflow, resume_properties.unwrap_or(&empty))
                        .await
                }
                None => Err(OperationError::new(format!(
                    "operation {} is paused but its handler is not resumable",
                    operation
                ))
                .with_type("not_resumable")),
            },
            other => {
                return Err(EngineError::IllegalState(format!(
                    "operation {} cannot be executed in state {}",
                    operation, other
                )))
            }
        };

        match outcome {
            Ok(result) => {
                let paused = result.as_ref().is_some_and(|r| r.action == Action::Pause);
                if !paused {
                    if let Err(e) = handler.destroy(workflow).await {
                        warn!(%operation, "Operation cleanup failed: {}", e);
                    }
                }
                Ok(StepOutcome::Completed(result))
            }
            Err(error) => {
                warn!(%operation, position, "Operation failed: {}", error);
                mark_failed(workflow, position);
                Ok(StepOutcome::Failed(error))
            }
        }
    }
}

fn mark_failed(workflow: &mut WorkflowInstance, position: usize) {
    if let Some(op) = workflow.operation_mut(position) {
        op.state = OperationState::Failed;
        op.date_completed = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::handler::{HoldHandler, OperationHandler};
    use crate::workflow::{MediaPackage, OperationDefinition, WorkflowDefinition};

    #[derive(Default)]
    struct Recording {
        starts: AtomicUsize,
        skips: AtomicUsize,
        destroys: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl OperationHandler for Recording {
        async fn start(
            &self,
            _workflow: &WorkflowInstance,
        ) -> Result<Option<OperationResult>, OperationError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(OperationError::new("start failed"));
            }
            Ok(None)
        }

        async fn skip(
            &self,
            _workflow: &WorkflowInstance,
        ) -> Result<Option<OperationResult>, OperationError> {
            self.skips.fetch_add(1, Ordering::SeqCst);
            Ok(Some(OperationResult::skip()))
        }

        async fn destroy(&self, _workflow: &WorkflowInstance) -> Result<(), OperationError> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup(
        handler: Arc<dyn OperationHandler>,
        op: OperationDefinition,
    ) -> (OperationExecutor, WorkflowInstance) {
        let registry = HandlerRegistry::new();
        registry.register(op.id.clone(), handler).unwrap();
        let wf = WorkflowInstance::new(
            &WorkflowDefinition::new("wf").with_operation(op),
            MediaPackage::new("mp"),
            None,
            BTreeMap::new(),
        );
        (OperationExecutor::new(Arc::new(registry)), wf)
    }

    #[tokio::test]
    async fn test_start_then_destroy() {
        let handler = Arc::new(Recording::default());
        let (executor, mut wf) = setup(handler.clone(), OperationDefinition::new("op"));

        let outcome = executor.execute(&mut wf, None).await.expect("should execute");
        assert_eq!(outcome, StepOutcome::Completed(None));
        assert_eq!(handler.starts.load(Ordering::SeqCst), 1);
        assert_eq!(handler.destroys.load(Ordering::SeqCst), 1);
        assert!(wf.operations[0].date_started.is_some());
    }

    #[tokio::test]
    async fn test_skip_condition_calls_skip() {
        let handler = Arc::new(Recording::default());
        let (executor, mut wf) = setup(
            handler.clone(),
            OperationDefinition::new("op").with_execute_condition("false"),
        );

        let outcome = executor.execute(&mut wf, None).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Completed(Some(r)) if r.action == Action::Skip));
        assert_eq!(handler.starts.load(Ordering::SeqCst), 0);
        assert_eq!(handler.skips.load(Ordering::SeqCst), 1);
        assert_eq!(handler.destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_marks_operation_failed() {
        let handler = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        let (executor, mut wf) = setup(handler.clone(), OperationDefinition::new("op"));

        let outcome = executor.execute(&mut wf, None).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Failed(e) if e.message == "start failed"));
        assert_eq!(wf.operations[0].state, OperationState::Failed);
        assert_eq!(handler.destroys.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pause_skips_destroy_and_resume_continues() {
        let (executor, mut wf) = setup(
            Arc::new(HoldHandler::default()),
            OperationDefinition::new("hold"),
        );

        let outcome = executor.execute(&mut wf, None).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Completed(Some(r)) if r.action == Action::Pause));

        wf.operations[0].state = OperationState::Paused;
        let props = BTreeMap::from([("k".to_string(), "v".to_string())]);
        let outcome = executor.execute(&mut wf, Some(&props)).await.unwrap();
        assert!(matches!(
            outcome,
            StepOutcome::Completed(Some(r)) if r.action == Action::Continue && r.properties == props
        ));
    }

    #[tokio::test]
    async fn test_resume_non_resumable_fails_operation() {
        let (executor, mut wf) =
            setup(Arc::new(Recording::default()), OperationDefinition::new("op"));
        wf.operations[0].state = OperationState::Paused;

        let outcome = executor.execute(&mut wf, None).await.unwrap();
        assert!(matches!(
            outcome,
            StepOutcome::Failed(e) if e.error_type.as_deref() == Some("not_resumable")
        ));
        assert_eq!(wf.operations[0].state, OperationState::Failed);
    }

    #[tokio::test]
    async fn test_missing_handler_fails_operation() {
        let executor = OperationExecutor::new(Arc::new(HandlerRegistry::new()));
        let mut wf = WorkflowInstance::new(
            &WorkflowDefinition::new("wf")
                .with_operation(OperationDefinition::new("ghost")),
            MediaPackage::new("mp"),
            None,
            BTreeMap::new(),
        );

        let outcome = executor.execute(&mut wf, None).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Failed(_)));
        assert_eq!(wf.operations[0].state, OperationState::Failed);
    }

    #[tokio::test]
    async fn test_no_current_operation_is_structural_error() {
        let (executor, mut wf) =
            setup(Arc::new(Recording::default()), OperationDefinition::new("op"));
        wf.operations[0].state = OperationState::Succeeded;

        let result = executor.execute(&mut wf, None).await;
        assert!(matches!(result, Err(EngineError::IllegalState(_))));
    }
}
