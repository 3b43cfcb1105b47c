//! Handler registry
//!
//! Maps operation names to exactly one handler. Registration happens at
//! process startup; a second handler for the same name is rejected at
//! registration time rather than surfacing during execution.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::OperationHandler;
use crate::workflow::{DefinitionRegistry, WorkflowDefinition};

/// Errors from handler and definition registration
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Another handler is already bound to this operation name
    #[error("a handler is already registered for operation: {0}")]
    DuplicateHandler(String),

    /// A definition with this id is already registered
    #[error("workflow definition already registered: {0}")]
    DuplicateDefinition(String),

    /// Definition failed validation
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),
}

/// Registry of operation handlers keyed by operation name
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler to an operation name
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn OperationHandler>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        match self.handlers.entry(name) {
            Entry::Occupied(entry) => Err(RegistryError::DuplicateHandler(entry.key().clone())),
            Entry::Vacant(entry) => {
                debug!(operation = %entry.key(), "Registered operation handler");
                entry.insert(handler);
                Ok(())
            }
        }
    }

    /// Remove the handler bound to `name`
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.remove(name).map(|(_, handler)| handler)
    }

    /// Find the handler for an operation name
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(name).map(|h| Arc::clone(h.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered operation names, sorted
    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Check that every operation, including those of referenced catch
    /// workflows, has a registered handler
    pub fn is_runnable(
        &self,
        definition: &WorkflowDefinition,
        definitions: &DefinitionRegistry,
    ) -> bool {
        let mut visited = HashSet::new();
        self.check_runnable(definition, definitions, &mut visited)
    }

    fn check_runnable(
        &self,
        definition: &WorkflowDefinition,
        definitions: &DefinitionRegistry,
        visited: &mut HashSet<String>,
    ) -> bool {
        if !visited.insert(definition.id.clone()) {
            return true;
        }

        for operation in &definition.operations {
            if !self.contains(&operation.id) {
                debug!(
                    workflow = %definition.id,
                    operation = %operation.id,
                    "No handler registered for operation"
                );
                return false;
            }

            if let Some(catch_id) = &operation.exception_handler_workflow {
                let Some(catch_workflow) = definitions.get_definition(catch_id) else {
                    warn!(
                        workflow = %definition.id,
                        catch_workflow = %catch_id,
                        "Exception handler workflow is not registered"
                    );
                    return false;
                };
                if !self.check_runnable(&catch_workflow, definitions, visited) {
                    return false;
                }
            }
        }

        true
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("operations", &self.handler_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ContinuingHandler;
    use crate::workflow::OperationDefinition;

    fn registry_with(names: &[&str]) -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        for name in names {
            registry
                .register(*name, Arc::new(ContinuingHandler))
                .expect("should register handler");
        }
        registry
    }

    fn definition(id: &str, ops: &[(&str, Option<&str>)]) -> WorkflowDefinition {
        ops.iter().fold(WorkflowDefinition::new(id), |d, (op, catch)| {
            let mut op = OperationDefinition::new(*op);
            if let Some(catch) = catch {
                op = op.with_exception_handler(*catch);
            }
            d.with_operation(op)
        })
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = registry_with(&["encode"]);
        let result = registry.register("encode", Arc::new(ContinuingHandler));
        assert!(matches!(result, Err(RegistryError::DuplicateHandler(name)) if name == "encode"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_and_lookup() {
        let registry = registry_with(&["encode", "inspect"]);
        assert!(registry.lookup("encode").is_some());
        assert!(registry.unregister("encode").is_some());
        assert!(registry.lookup("encode").is_none());
        assert_eq!(registry.handler_names(), vec!["inspect"]);

        registry
            .register("encode", Arc::new(ContinuingHandler))
            .expect("should register again after unregister");
    }

    #[test]
    fn test_is_runnable_direct() {
        let registry = registry_with(&["a", "b"]);
        let definitions = DefinitionRegistry::new();

        let ok = definition("ok", &[("a", None), ("b", None)]);
        let bad = definition("bad", &[("a", None), ("c", None)]);
        assert!(registry.is_runnable(&ok, &definitions));
        assert!(!registry.is_runnable(&bad, &definitions));
    }

    #[test]
    fn test_is_runnable_checks_catch_workflows() {
        let registry = registry_with(&["a", "cleanup"]);
        let definitions = DefinitionRegistry::new();
        definitions
            .register_definition(definition("catch-ok", &[("cleanup", None)]))
            .unwrap();
        definitions
            .register_definition(definition("catch-bad", &[("missing", None)]))
            .unwrap();

        let guarded = |catch_id: &str| definition("wf", &[("a", Some(catch_id))]);
        assert!(registry.is_runnable(&guarded("catch-ok"), &definitions));
        assert!(!registry.is_runnable(&guarded("catch-bad"), &definitions));
        assert!(!registry.is_runnable(&guarded("unknown"), &definitions));
    }

    #[test]
    fn test_is_runnable_terminates_on_cycles() {
        let registry = registry_with(&["a", "b"]);
        let definitions = DefinitionRegistry::new();
        definitions
            .register_definition(definition("x", &[("a", Some("y"))]))
            .unwrap();
        definitions
            .register_definition(definition("y", &[("b", Some("x"))]))
            .unwrap();
        definitions
            .register_definition(definition("self", &[("a", Some("self"))]))
            .unwrap();

        let x = definitions.get_definition("x").unwrap();
        assert!(registry.is_runnable(&x, &definitions));
        let own = definitions.get_definition("self").unwrap();
        assert!(registry.is_runnable(&own, &definitions));

        registry.unregister("b");
        assert!(!registry.is_runnable(&x, &definitions));
    }
}
