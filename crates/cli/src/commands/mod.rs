// CLI commands

pub mod definitions;
pub mod run;
pub mod validate;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use mediaflow_engine::handler::register_builtin_handlers;
use mediaflow_engine::{EngineConfig, InMemoryJobDispatcher, InMemoryWorkflowIndex, WorkflowEngine};

use crate::definitions::{load_dir, LoadedDefinition};

/// In-process engine with the built-in handlers and the definitions in `dir`
pub struct LocalEngine {
    pub engine: Arc<WorkflowEngine>,
    pub dispatcher: Arc<InMemoryJobDispatcher>,
    pub loaded: Vec<LoadedDefinition>,
}

impl LocalEngine {
    pub fn load(dir: &Path) -> Result<Self> {
        let dispatcher = Arc::new(InMemoryJobDispatcher::new());
        let engine = Arc::new(WorkflowEngine::new(
            Arc::new(InMemoryWorkflowIndex::new()),
            dispatcher.clone(),
            EngineConfig::from_env(),
        ));
        register_builtin_handlers(engine.handlers())?;

        let loaded = load_dir(dir)?;
        for item in &loaded {
            engine
                .register_definition(item.definition.clone())
                .with_context(|| format!("registering {}", item.path.display()))?;
        }

        Ok(Self {
            engine,
            dispatcher,
            loaded,
        })
    }
}
