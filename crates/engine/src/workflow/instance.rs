//! Workflow and operation instances
//!
//! An instance is the unit of execution and persistence. Every step works
//! on its own copy read from the index and writes a fresh copy back.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use super::definition::{OperationDefinition, WorkflowDefinition};
use super::mediapackage::MediaPackage;
use super::state::{OperationState, WorkflowState};

/// One operation of a running workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationInstance {
    /// Operation name, used as the handler key
    pub id: String,

    /// Index into the instance's operation sequence
    pub position: usize,

    pub state: OperationState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Configuration, resolved by templating between steps
    #[serde(default)]
    pub configuration: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_handler_workflow: Option<String>,

    pub fail_workflow_on_exception: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_condition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_condition: Option<String>,

    /// Whether a paused operation may be continued by a user
    #[serde(default)]
    pub continuable: bool,

    /// Whether a paused operation may be aborted by a user
    #[serde(default)]
    pub abortable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_action_title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_state_url: Option<Url>,

    /// Milliseconds the handler's work spent queued
    #[serde(default)]
    pub time_in_queue: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_started: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_completed: Option<DateTime<Utc>>,
}

impl OperationInstance {
    /// Create an instantiated operation from its definition
    pub fn from_definition(definition: &OperationDefinition, position: usize) -> Self {
        Self {
            id: definition.id.clone(),
            position,
            state: OperationState::Instantiated,
            description: definition.description.clone(),
            configuration: definition.configuration.clone(),
            exception_handler_workflow: definition.exception_handler_workflow.clone(),
            fail_workflow_on_exception: definition.fail_workflow_on_exception,
            execute_condition: definition.execute_condition.clone(),
            skip_condition: definition.skip_condition.clone(),
            continuable: false,
            abortable: false,
            hold_action_title: None,
            hold_state_url: None,
            time_in_queue: 0,
            date_started: None,
            date_completed: None,
        }
    }

    /// Look up a configuration value
    pub fn configuration(&self, key: &str) -> Option<&str> {
        self.configuration.get(key).map(String::as_str)
    }

    /// Evaluate the resolved `if` / `unless` conditions
    ///
    /// A non-blank execute condition other than `true` skips the operation,
    /// as does a skip condition equal to `true`.
    pub fn should_skip(&self) -> bool {
        let execute = self
            .execute_condition
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());
        if let Some(condition) = execute {
            if !condition.eq_ignore_ascii_case("true") {
                return true;
            }
        }

        self.skip_condition
            .as_deref()
            .map_or(false, |c| c.trim().eq_ignore_ascii_case("true"))
    }

    pub(crate) fn clear_hold_state(&mut self) {
        self.hold_action_title = None;
        self.hold_state_url = None;
    }
}

/// One live execution of a definition against a payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Adopted from the initial step's job id
    pub id: Uuid,

    /// Originating definition id
    pub template: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    pub state: WorkflowState,

    pub operations: Vec<OperationInstance>,

    pub mediapackage: MediaPackage,

    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,

    #[serde(default)]
    pub error_messages: Vec<String>,

    /// Sequence of the most recently scheduled operation step.
    /// Step jobs carrying an older value are stale and get discarded.
    #[serde(default)]
    pub step_sequence: u64,

    pub date_created: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Build an instantiated workflow from a definition
    ///
    /// The id stays nil until the engine adopts the initial job id.
    pub fn new(
        definition: &WorkflowDefinition,
        mediapackage: MediaPackage,
        parent_id: Option<Uuid>,
        properties: BTreeMap<String, String>,
    ) -> Self {
        let operations = definition
            .operations
            .iter()
            .enumerate()
            .map(|(position, op)| OperationInstance::from_definition(op, position))
            .collect();

        Self {
            id: Uuid::nil(),
            template: definition.id.clone(),
            title: definition.title.clone(),
            state: WorkflowState::Instantiated,
            operations,
            mediapackage,
            properties,
            parent_id,
            error_messages: Vec::new(),
            step_sequence: 0,
            date_created: Utc::now(),
        }
    }

    /// Lowest-position operation that is still INSTANTIATED or PAUSED
    pub fn current_operation(&self) -> Option<&OperationInstance> {
        self.operations.iter().find(|op| !op.state.is_terminal())
    }

    pub fn current_operation_mut(&mut self) -> Option<&mut OperationInstance> {
        self.operations.iter_mut().find(|op| !op.state.is_terminal())
    }

    pub fn operation(&self, position: usize) -> Option<&OperationInstance> {
        self.operations.get(position)
    }

    pub fn operation_mut(&mut self, position: usize) -> Option<&mut OperationInstance> {
        self.operations.get_mut(position)
    }

    pub fn add_error_message(&mut self, message: impl Into<String>) {
        self.error_messages.push(message.into());
    }

    /// Whether any operation failed with its fail-workflow flag set
    pub fn has_fatal_failure(&self) -> bool {
        self.operations
            .iter()
            .any(|op| op.state == OperationState::Failed && op.fail_workflow_on_exception)
    }

    /// Truncate after `position` and append the catch workflow's operations
    pub fn splice(&mut self, position: usize, catch_workflow: &WorkflowDefinition) {
        self.operations.truncate(position + 1);
        let start = self.operations.len();
        self.operations.extend(
            catch_workflow
                .operations
                .iter()
                .enumerate()
                .map(|(i, op)| OperationInstance::from_definition(op, start + i)),
        );
    }
}
