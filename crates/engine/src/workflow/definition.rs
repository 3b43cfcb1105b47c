//! Workflow definitions and the definition registry
//!
//! A definition is an immutable pipeline template. Instances copy its
//! operations at start time, so later changes to a registered definition
//! never affect running workflows.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::handler::RegistryError;

fn default_true() -> bool {
    true
}

/// One step of a pipeline template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDefinition {
    /// Operation name, used as the handler key
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Handler configuration; values may contain `${...}` placeholders
    #[serde(default)]
    pub configuration: BTreeMap<String, String>,

    /// Definition id spliced onto the instance when this operation fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_handler_workflow: Option<String>,

    /// Whether a failure of this operation fails the workflow
    #[serde(default = "default_true")]
    pub fail_workflow_on_exception: bool,

    /// Operation runs only when this resolves to `true`
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub execute_condition: Option<String>,

    /// Operation is skipped when this resolves to `true`
    #[serde(rename = "unless", default, skip_serializing_if = "Option::is_none")]
    pub skip_condition: Option<String>,
}

impl OperationDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            configuration: BTreeMap::new(),
            exception_handler_workflow: None,
            fail_workflow_on_exception: true,
            execute_condition: None,
            skip_condition: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a configuration entry
    pub fn with_configuration(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.configuration.insert(key.into(), value.into());
        self
    }

    /// Set the catch workflow id
    pub fn with_exception_handler(mut self, workflow_id: impl Into<String>) -> Self {
        self.exception_handler_workflow = Some(workflow_id.into());
        self
    }

    pub fn fail_on_exception(mut self, fail: bool) -> Self {
        self.fail_workflow_on_exception = fail;
        self
    }

    pub fn with_execute_condition(mut self, condition: impl Into<String>) -> Self {
        self.execute_condition = Some(condition.into());
        self
    }

    pub fn with_skip_condition(mut self, condition: impl Into<String>) -> Self {
        self.skip_condition = Some(condition.into());
        self
    }
}

/// Immutable named pipeline template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub operations: Vec<OperationDefinition>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            description: None,
            operations: Vec::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Append an operation to the pipeline
    pub fn with_operation(mut self, operation: OperationDefinition) -> Self {
        self.operations.push(operation);
        self
    }

    /// Parse a definition from its JSON form
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Registry of named workflow definitions
///
/// Catch workflows are resolved through this registry, both when splicing
/// a failing instance and when checking whether a definition is runnable.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    definitions: RwLock<BTreeMap<String, WorkflowDefinition>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, rejecting a duplicate id
    pub fn register_definition(&self, definition: WorkflowDefinition) -> Result<(), RegistryError> {
        if definition.id.trim().is_empty() {
            return Err(RegistryError::InvalidDefinition(
                "workflow definition id must not be blank".to_string(),
            ));
        }

        let mut definitions = self.definitions.write();
        if definitions.contains_key(&definition.id) {
            return Err(RegistryError::DuplicateDefinition(definition.id));
        }
        definitions.insert(definition.id.clone(), definition);
        Ok(())
    }

    /// Remove a definition, returning it if it was registered
    pub fn unregister_definition(&self, id: &str) -> Option<WorkflowDefinition> {
        self.definitions.write().remove(id)
    }

    pub fn get_definition(&self, id: &str) -> Option<WorkflowDefinition> {
        self.definitions.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.definitions.read().contains_key(id)
    }

    /// All definitions, sorted by id
    pub fn list_definitions(&self) -> Vec<WorkflowDefinition> {
        self.definitions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.read().is_empty()
    }
}
