//! Workflow engine
//!
//! Owns workflow-level state transitions and the step trampoline. Each
//! call to [`WorkflowEngine::run_workflow_operation`] executes exactly one
//! operation and then either schedules exactly one follow-up step or stops.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::operation::{OperationExecutor, StepOutcome};
use super::EngineError;
use crate::config::EngineConfig;
use crate::dispatch::{Job, JobDispatcher, JobStatus, StepKind, WORKFLOW_JOB_TYPE};
use crate::handler::{Action, HandlerRegistry, OperationError, OperationHandler, OperationResult};
use crate::listener::{ListenerId, ListenerRegistry, WorkflowListener};
use crate::metadata::{populate_metadata, MetadataService};
use crate::persistence::{IndexError, WorkflowIndex, WorkflowQuery, WorkflowSet, WorkflowStatistics};
use crate::template::TemplateEngine;
use crate::workflow::{
    DefinitionRegistry, MediaPackage, OperationState, WorkflowDefinition, WorkflowInstance,
    WorkflowState,
};

/// The workflow engine
///
/// # Example
///
/// ```ignore
/// let dispatcher = Arc::new(InMemoryJobDispatcher::new());
/// let engine = Arc::new(WorkflowEngine::new(
///     Arc::new(InMemoryWorkflowIndex::new()),
///     dispatcher.clone(),
///     EngineConfig::from_env(),
/// ));
/// engine.register_handler("inspect", Arc::new(InspectHandler))?;
///
/// let workers =
///     StepWorkerPool::new(engine.clone(), dispatcher.queue(), StepWorkerConfig::default());
/// workers.start().await?;
///
/// let workflow = engine.start(&definition, mediapackage, None, BTreeMap::new()).await?;
/// ```
pub struct WorkflowEngine {
    index: Arc<dyn WorkflowIndex>,
    dispatcher: Arc<dyn JobDispatcher>,
    handlers: Arc<HandlerRegistry>,
    definitions: DefinitionRegistry,
    executor: OperationExecutor,
    templates: TemplateEngine,
    metadata_services: RwLock<Vec<Arc<dyn MetadataService>>>,
    listeners: ListenerRegistry,
    config: EngineConfig,
}

impl WorkflowEngine {
    /// Create a new engine over an index and a dispatcher
    pub fn new(
        index: Arc<dyn WorkflowIndex>,
        dispatcher: Arc<dyn JobDispatcher>,
        config: EngineConfig,
    ) -> Self {
        let handlers = Arc::new(HandlerRegistry::new());
        Self {
            index,
            dispatcher,
            executor: OperationExecutor::new(Arc::clone(&handlers)),
            handlers,
            definitions: DefinitionRegistry::new(),
            templates: TemplateEngine::new(config.process_properties.clone()),
            metadata_services: RwLock::new(Vec::new()),
            listeners: ListenerRegistry::new(config.listener_capacity),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<dyn WorkflowIndex> {
        &self.index
    }

    pub fn dispatcher(&self) -> &Arc<dyn JobDispatcher> {
        &self.dispatcher
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Bind a handler to an operation name
    pub fn register_handler(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn OperationHandler>,
    ) -> Result<(), EngineError> {
        Ok(self.handlers.register(name, handler)?)
    }

    pub fn unregister_handler(&self, name: &str) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.unregister(name)
    }

    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.definitions
    }

    pub fn register_definition(&self, definition: WorkflowDefinition) -> Result<(), EngineError> {
        Ok(self.definitions.register_definition(definition)?)
    }

    pub fn unregister_definition(&self, id: &str) -> Option<WorkflowDefinition> {
        self.definitions.unregister_definition(id)
    }

    pub fn get_definition(&self, id: &str) -> Result<WorkflowDefinition, EngineError> {
        self.definitions
            .get_definition(id)
            .ok_or_else(|| EngineError::DefinitionNotFound(id.to_string()))
    }

    pub fn list_definitions(&self) -> Vec<WorkflowDefinition> {
        self.definitions.list_definitions()
    }

    /// Whether every operation (catch workflows included) has a handler
    pub fn is_runnable(&self, definition: &WorkflowDefinition) -> bool {
        self.handlers.is_runnable(definition, &self.definitions)
    }

    pub fn add_metadata_service(&self, service: Arc<dyn MetadataService>) {
        self.metadata_services.write().push(service);
    }

    /// Register a listener for state and operation changes
    ///
    /// Fails with [`ListenerError::NoRuntime`] outside a tokio runtime.
    ///
    /// [`ListenerError::NoRuntime`]: crate::listener::ListenerError::NoRuntime
    pub fn add_workflow_listener(
        &self,
        listener: Arc<dyn WorkflowListener>,
    ) -> Result<ListenerId, EngineError> {
        Ok(self.listeners.add(listener)?)
    }

    pub fn remove_workflow_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create, persist and dispatch a new workflow
    ///
    /// On any failure after the instance is built, the instance is marked
    /// FAILED and persisted on a best-effort basis before the original
    /// error is returned.
    #[instrument(
        skip(self, definition, mediapackage, properties),
        fields(definition = %definition.id)
    )]
    pub async fn start(
        &self,
        definition: &WorkflowDefinition,
        mediapackage: MediaPackage,
        parent_id: Option<Uuid>,
        properties: BTreeMap<String, String>,
    ) -> Result<WorkflowInstance, EngineError> {
        if definition.id.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "workflow definition must have an id".to_string(),
            ));
        }
        if definition.operations.is_empty() {
            return Err(EngineError::InvalidArgument(format!(
                "workflow definition {} has no operations",
                definition.id
            )));
        }
        if mediapackage.identifier.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "media package must have an identifier".to_string(),
            ));
        }

        if let Some(parent) = parent_id {
            match self.index.get_workflow_by_id(parent).await {
                Ok(_) => {}
                Err(IndexError::NotFound(_)) => return Err(EngineError::ParentNotFound(parent)),
                Err(e) => return Err(e.into()),
            }
        }

        let mut workflow = WorkflowInstance::new(definition, mediapackage, parent_id, properties);
        match self.prepare_and_dispatch(&mut workflow, definition).await {
            Ok(()) => {
                info!(
                    workflow_id = %workflow.id,
                    mediapackage = %workflow.mediapackage.identifier,
                    "Started workflow"
                );
                Ok(workflow)
            }
            Err(e) => {
                error!(definition = %definition.id, "Unable to start workflow: {}", e);
                workflow.state = WorkflowState::Failed;
                workflow.add_error_message(e.to_string());
                if workflow.id.is_nil() {
                    warn!("Failed workflow was never assigned an id, not persisting");
                } else if let Err(persist) = self.update(&workflow).await {
                    error!(
                        workflow_id = %workflow.id,
                        "Unable to persist failed workflow: {}", persist
                    );
                }
                Err(e)
            }
        }
    }

    async fn prepare_and_dispatch(
        &self,
        workflow: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
    ) -> Result<(), EngineError> {
        *workflow = self.templates.apply(&*workflow, &workflow.properties)?;

        let services = self.metadata_services.read().clone();
        populate_metadata(&mut workflow.mediapackage, &services).await;

        let mut args = vec![
            serde_json::to_string(definition)?,
            serde_json::to_string(&workflow.mediapackage)?,
        ];
        if let Some(parent) = workflow.parent_id {
            args.push(parent.to_string());
        }

        let job = self
            .dispatcher
            .create_job(WORKFLOW_JOB_TYPE, StepKind::StartWorkflow, args, None, false)
            .await?;
        workflow.id = job.id;

        // Persisting INSTANTIATED queues the start job
        self.update(workflow).await
    }

    /// Resume a paused workflow with additional properties
    ///
    /// The handler's `resume` runs asynchronously in a RESUME step.
    #[instrument(skip(self, properties))]
    pub async fn resume(
        &self,
        id: Uuid,
        properties: BTreeMap<String, String>,
    ) -> Result<WorkflowInstance, EngineError> {
        let workflow = self.index.get_workflow_by_id(id).await?;
        if workflow.state != WorkflowState::Paused {
            return Err(EngineError::IllegalState(format!(
                "workflow {} is {}, only paused workflows can be resumed",
                id, workflow.state
            )));
        }

        let mut workflow = self.templates.apply(&workflow, &properties)?;
        workflow.state = WorkflowState::Running;
        workflow.step_sequence += 1;
        self.update(&workflow).await?;

        let args = vec![
            id.to_string(),
            workflow.step_sequence.to_string(),
            serde_json::to_string(&properties)?,
        ];
        self.schedule(StepKind::Resume, args).await?;

        info!(workflow_id = %id, "Resumed workflow");
        Ok(workflow)
    }

    /// Stop a workflow; an in-flight step still runs to completion
    #[instrument(skip(self))]
    pub async fn stop(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.transition_externally(id, WorkflowState::Stopped).await
    }

    /// Pause a workflow until it is resumed
    #[instrument(skip(self))]
    pub async fn suspend(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.transition_externally(id, WorkflowState::Paused).await
    }

    async fn transition_externally(
        &self,
        id: Uuid,
        state: WorkflowState,
    ) -> Result<WorkflowInstance, EngineError> {
        let mut workflow = self.index.get_workflow_by_id(id).await?;
        if workflow.state.is_terminal() {
            return Err(EngineError::IllegalState(format!(
                "workflow {} is already {}",
                id, workflow.state
            )));
        }
        if workflow.state == state {
            return Ok(workflow);
        }

        info!(workflow_id = %id, from = %workflow.state, to = %state, "Changing workflow state");
        workflow.state = state;
        self.update(&workflow).await?;
        Ok(workflow)
    }

    /// Remove a terminal workflow from the index
    #[instrument(skip(self))]
    pub async fn remove(&self, id: Uuid) -> Result<(), EngineError> {
        let workflow = self.index.get_workflow_by_id(id).await?;
        if !workflow.state.is_terminal() {
            return Err(EngineError::IllegalState(format!(
                "workflow {} is {}, stop it before removing",
                id, workflow.state
            )));
        }
        self.index.remove(id).await?;
        Ok(())
    }

    // =========================================================================
    // Step Execution
    // =========================================================================

    /// Execute one dispatched job
    #[instrument(skip(self, job), fields(job_id = %job.id, kind = %job.kind))]
    pub async fn process_step(&self, job: &Job) -> Result<(), EngineError> {
        let workflow_id = job.workflow_id()?;
        let workflow = self.index.get_workflow_by_id(workflow_id).await?;

        // A resume or a newer step superseded this one
        if let Some(sequence) = job.step_sequence()? {
            if sequence != workflow.step_sequence {
                debug!(
                    %workflow_id,
                    sequence,
                    current = workflow.step_sequence,
                    "Discarding stale step"
                );
                return Ok(());
            }
        }

        match job.kind {
            StepKind::StartWorkflow => {
                if workflow.state != WorkflowState::Instantiated {
                    debug!(%workflow_id, state = %workflow.state, "Workflow already started");
                    return Ok(());
                }
                self.run_workflow(workflow).await?;
            }
            StepKind::StartOperation => {
                if !workflow.state.is_scheduling() {
                    debug!(%workflow_id, state = %workflow.state, "Discarding operation step");
                    return Ok(());
                }
                self.run_workflow_operation(workflow, None).await?;
            }
            StepKind::Resume => {
                if workflow.state != WorkflowState::Running {
                    debug!(%workflow_id, state = %workflow.state, "Discarding resume step");
                    return Ok(());
                }
                let raw = job.args.get(2).map(String::as_str).unwrap_or("{}");
                let properties: BTreeMap<String, String> = serde_json::from_str(raw)?;
                self.run_workflow_operation(workflow, Some(properties)).await?;
            }
        }
        Ok(())
    }

    /// Move an instantiated workflow to RUNNING and schedule its first operation
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    pub async fn run_workflow(
        &self,
        mut workflow: WorkflowInstance,
    ) -> Result<WorkflowInstance, EngineError> {
        if workflow.state != WorkflowState::Instantiated {
            return Err(EngineError::IllegalState(format!(
                "workflow {} is {}, expected INSTANTIATED",
                workflow.id, workflow.state
            )));
        }
        let position = workflow.current_operation().map(|op| op.position);
        if position != Some(0) {
            return Err(EngineError::IllegalState(format!(
                "workflow {} must start at operation 0, found {:?}",
                workflow.id, position
            )));
        }

        workflow.state = WorkflowState::Running;
        workflow.step_sequence += 1;
        self.update(&workflow).await?;
        self.schedule_operation(&workflow).await?;
        Ok(workflow)
    }

    /// Run the current operation and decide what happens next
    ///
    /// The persisted state is re-read after the handler returns; if it no
    /// longer matches the state this step started from, the persisted
    /// value wins. This is last-writer-wins, not a lock. A step whose
    /// sequence was superseded meanwhile (by a resume) records its result
    /// but leaves scheduling to the newer step.
    #[instrument(skip(self, workflow, resume_properties), fields(workflow_id = %workflow.id))]
    pub async fn run_workflow_operation(
        &self,
        workflow: WorkflowInstance,
        resume_properties: Option<BTreeMap<String, String>>,
    ) -> Result<WorkflowInstance, EngineError> {
        let state0 = workflow.state;
        let sequence0 = workflow.step_sequence;
        let mut workflow = self.templates.apply(&workflow, &workflow.properties)?;
        let position = workflow
            .current_operation()
            .map(|op| op.position)
            .ok_or_else(|| {
                EngineError::IllegalState(format!(
                    "workflow {} has no current operation",
                    workflow.id
                ))
            })?;

        match self
            .executor
            .execute(&mut workflow, resume_properties.as_ref())
            .await?
        {
            StepOutcome::Completed(result) => {
                self.apply_operation_result(&mut workflow, position, result)?
            }
            StepOutcome::Failed(error) => {
                self.apply_operation_exception(&mut workflow, position, &error)?
            }
        }

        if workflow.current_operation().is_none() {
            let failed =
                workflow.state == WorkflowState::Failing || workflow.has_fatal_failure();
            workflow.state = if failed {
                WorkflowState::Failed
            } else {
                WorkflowState::Succeeded
            };
            self.update(&workflow).await?;
            info!(workflow_id = %workflow.id, state = %workflow.state, "Workflow finished");
            return Ok(workflow);
        }

        let persisted = self.index.get_workflow_by_id(workflow.id).await?;
        if persisted.state != state0 {
            info!(
                workflow_id = %workflow.id,
                expected = %state0,
                found = %persisted.state,
                "Workflow state changed during step, keeping persisted state"
            );
            workflow.state = persisted.state;
        }
        let superseded = persisted.step_sequence != sequence0;
        if superseded {
            info!(
                workflow_id = %workflow.id,
                sequence = sequence0,
                current = persisted.step_sequence,
                "Step superseded, not scheduling the next operation"
            );
            workflow.step_sequence = persisted.step_sequence;
        }

        if workflow.state == WorkflowState::Instantiated {
            return Err(EngineError::IllegalState(format!(
                "workflow {} reverted to INSTANTIATED while running",
                workflow.id
            )));
        }

        let scheduling = workflow.state.is_scheduling() && !superseded;
        if scheduling {
            workflow.step_sequence += 1;
        }
        self.update(&workflow).await?;
        if scheduling {
            self.schedule_operation(&workflow).await?;
        }
        Ok(workflow)
    }

    /// Apply a handler result to the current operation and persist
    #[instrument(skip(self, workflow, result), fields(workflow_id = %workflow.id))]
    pub async fn handle_operation_result(
        &self,
        mut workflow: WorkflowInstance,
        result: Option<OperationResult>,
    ) -> Result<WorkflowInstance, EngineError> {
        let position = self.current_position(&workflow)?;
        self.apply_operation_result(&mut workflow, position, result)?;
        self.update(&workflow).await?;
        Ok(workflow)
    }

    /// Record a handler failure on the current operation and persist
    #[instrument(skip(self, workflow, error), fields(workflow_id = %workflow.id))]
    pub async fn handle_operation_exception(
        &self,
        mut workflow: WorkflowInstance,
        error: &OperationError,
    ) -> Result<WorkflowInstance, EngineError> {
        let position = self.current_position(&workflow)?;
        self.apply_operation_exception(&mut workflow, position, error)?;
        self.update(&workflow).await?;
        Ok(workflow)
    }

    fn current_position(&self, workflow: &WorkflowInstance) -> Result<usize, EngineError> {
        workflow
            .current_operation()
            .map(|op| op.position)
            .ok_or_else(|| {
                EngineError::IllegalState(format!(
                    "workflow {} has no current operation",
                    workflow.id
                ))
            })
    }

    fn apply_operation_result(
        &self,
        workflow: &mut WorkflowInstance,
        position: usize,
        result: Option<OperationResult>,
    ) -> Result<(), EngineError> {
        let result = result.unwrap_or_else(OperationResult::proceed);

        if let Some(mediapackage) = result.mediapackage {
            workflow.mediapackage = mediapackage;
        }
        if !result.properties.is_empty() {
            workflow.properties.extend(result.properties);
            *workflow = self.templates.apply(&*workflow, &workflow.properties)?;
        }

        let operation = workflow
            .operation(position)
            .map(|op| op.id.clone())
            .ok_or_else(|| {
                EngineError::IllegalState(format!(
                    "workflow {} has no operation {}",
                    workflow.id, position
                ))
            })?;

        let hold = match result.action {
            Action::Pause => {
                let handler = self
                    .handlers
                    .lookup(&operation)
                    .ok_or_else(|| EngineError::NotResumable(operation.clone()))?;
                let resumable = handler
                    .as_resumable()
                    .ok_or_else(|| EngineError::NotResumable(operation.clone()))?;
                resumable
                    .hold_state_url(workflow)
                    .map(|url| (url, resumable.hold_action_title()))
            }
            Action::Continue | Action::Skip => None,
        };

        let Some(op) = workflow.operation_mut(position) else {
            return Err(EngineError::IllegalState(format!(
                "workflow has no operation {}",
                position
            )));
        };
        op.time_in_queue = result.time_in_queue;

        match result.action {
            Action::Continue | Action::Skip => {
                op.state = if result.action == Action::Continue {
                    OperationState::Succeeded
                } else {
                    OperationState::Skipped
                };
                op.date_completed = Some(Utc::now());
                op.clear_hold_state();
                debug!(%operation, position, state = %op.state, "Operation completed");
            }
            Action::Pause => {
                op.state = OperationState::Paused;
                op.continuable = result.continuable;
                op.abortable = result.abortable;
                if let Some((url, title)) = hold {
                    op.hold_state_url = Some(url);
                    op.hold_action_title = Some(title);
                }
                workflow.state = WorkflowState::Paused;
                info!(workflow_id = %workflow.id, %operation, "Workflow paused");
            }
        }
        Ok(())
    }

    fn apply_operation_exception(
        &self,
        workflow: &mut WorkflowInstance,
        position: usize,
        error: &OperationError,
    ) -> Result<(), EngineError> {
        workflow.add_error_message(error.message.clone());

        let (operation, fail_workflow, catch_id) = workflow
            .operation(position)
            .map(|op| {
                (
                    op.id.clone(),
                    op.fail_workflow_on_exception,
                    op.exception_handler_workflow.clone(),
                )
            })
            .ok_or_else(|| {
                EngineError::IllegalState(format!(
                    "workflow {} has no operation {}",
                    workflow.id, position
                ))
            })?;

        if fail_workflow {
            match catch_id {
                None => {
                    workflow.state = WorkflowState::Failed;
                }
                Some(catch_id) => match self.definitions.get_definition(&catch_id) {
                    Some(catch_workflow) => {
                        info!(
                            workflow_id = %workflow.id,
                            %operation,
                            catch_workflow = %catch_id,
                            "Switching to exception handler workflow"
                        );
                        workflow.state = WorkflowState::Failing;
                        workflow.splice(position, &catch_workflow);
                    }
                    None => {
                        error!(
                            workflow_id = %workflow.id,
                            catch_workflow = %catch_id,
                            "Exception handler workflow is not registered"
                        );
                        workflow.add_error_message(format!(
                            "exception handler workflow {} not found",
                            catch_id
                        ));
                        workflow.state = WorkflowState::Failed;
                    }
                },
            }
        }

        if let Some(op) = workflow.operation_mut(position) {
            op.state = OperationState::Failed;
            op.date_completed.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Persist an instance, mirror its job status and notify listeners
    pub async fn update(&self, workflow: &WorkflowInstance) -> Result<(), EngineError> {
        let previous = match self.index.get_workflow_by_id(workflow.id).await {
            Ok(previous) => Some(previous),
            Err(IndexError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        self.index.update(workflow).await?;

        if let Some(status) = JobStatus::for_workflow_state(workflow.state) {
            let mut job = self.dispatcher.get_job(workflow.id).await?;
            if job.status != status {
                job.transition(status);
                self.dispatcher.update_job(&job).await?;
            }
        }

        self.listeners.notify(previous.as_ref(), workflow);
        Ok(())
    }

    async fn schedule_operation(&self, workflow: &WorkflowInstance) -> Result<Job, EngineError> {
        let args = vec![workflow.id.to_string(), workflow.step_sequence.to_string()];
        self.schedule(StepKind::StartOperation, args).await
    }

    async fn schedule(&self, kind: StepKind, args: Vec<String>) -> Result<Job, EngineError> {
        let job = self
            .dispatcher
            .create_job(WORKFLOW_JOB_TYPE, kind, args, None, true)
            .await?;
        debug!(job_id = %job.id, %kind, "Scheduled step");
        Ok(job)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_workflow_by_id(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        Ok(self.index.get_workflow_by_id(id).await?)
    }

    pub async fn get_workflow_instances(
        &self,
        query: &WorkflowQuery,
    ) -> Result<WorkflowSet, EngineError> {
        Ok(self.index.get_workflow_instances(query).await?)
    }

    pub async fn count_workflow_instances(
        &self,
        state: Option<WorkflowState>,
        operation: Option<&str>,
    ) -> Result<u64, EngineError> {
        Ok(self.index.count_workflow_instances(state, operation).await?)
    }

    pub async fn get_statistics(&self) -> Result<WorkflowStatistics, EngineError> {
        Ok(self.index.get_statistics().await?)
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("handlers", &self.handlers)
            .field("definitions", &self.definitions.len())
            .field("listeners", &self.listeners)
            .finish()
    }
}
