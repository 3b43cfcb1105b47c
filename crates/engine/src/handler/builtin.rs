//! General-purpose handlers
//!
//! `continue`, `fail` and `hold` need no media tooling, so they are always
//! available to the CLI and handy for assembling test pipelines.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use url::Url;

use super::{
    HandlerRegistry, OperationError, OperationHandler, OperationResult, RegistryError,
    ResumableOperationHandler,
};
use crate::workflow::WorkflowInstance;

/// Configuration key read by [`FailingHandler`]
pub const FAIL_MESSAGE_KEY: &str = "message";

/// Configuration key read by [`HoldHandler`]
pub const HOLD_URL_KEY: &str = "hold-url";

/// Always returns CONTINUE
#[derive(Debug, Default, Clone, Copy)]
pub struct ContinuingHandler;

#[async_trait]
impl OperationHandler for ContinuingHandler {
    async fn start(
        &self,
        workflow: &WorkflowInstance,
    ) -> Result<Option<OperationResult>, OperationError> {
        debug!(workflow_id = %workflow.id, "Continuing");
        Ok(Some(OperationResult::proceed()))
    }
}

/// Always fails with the operation's configured `message`
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingHandler;

#[async_trait]
impl OperationHandler for FailingHandler {
    async fn start(
        &self,
        workflow: &WorkflowInstance,
    ) -> Result<Option<OperationResult>, OperationError> {
        let message = workflow
            .current_operation()
            .and_then(|op| op.configuration(FAIL_MESSAGE_KEY))
            .unwrap_or("operation failed")
            .to_string();
        Err(OperationError::new(message).with_type("fail"))
    }
}

/// Pauses the workflow until it is resumed
///
/// The hold-state URL comes from the operation's `hold-url` configuration.
/// On resume the supplied properties are handed back as result properties.
#[derive(Debug, Clone)]
pub struct HoldHandler {
    title: String,
}

impl HoldHandler {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
        }
    }
}

impl Default for HoldHandler {
    fn default() -> Self {
        Self::new("Resume")
    }
}

#[async_trait]
impl OperationHandler for HoldHandler {
    async fn start(
        &self,
        _workflow: &WorkflowInstance,
    ) -> Result<Option<OperationResult>, OperationError> {
        Ok(Some(OperationResult::pause()))
    }

    fn as_resumable(&self) -> Option<&dyn ResumableOperationHandler> {
        Some(self)
    }
}

#[async_trait]
impl ResumableOperationHandler for HoldHandler {
    async fn resume(
        &self,
        _workflow: &WorkflowInstance,
        properties: &BTreeMap<String, String>,
    ) -> Result<Option<OperationResult>, OperationError> {
        Ok(Some(
            OperationResult::proceed().with_properties(properties.clone()),
        ))
    }

    fn hold_state_url(&self, workflow: &WorkflowInstance) -> Option<Url> {
        let raw = workflow.current_operation()?.configuration(HOLD_URL_KEY)?;
        match Url::parse(raw) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(workflow_id = %workflow.id, url = %raw, "Invalid hold state url: {}", e);
                None
            }
        }
    }

    fn hold_action_title(&self) -> String {
        self.title.clone()
    }
}

/// Register `continue`, `fail` and `hold`
pub fn register_builtin_handlers(registry: &HandlerRegistry) -> Result<(), RegistryError> {
    registry.register("continue", Arc::new(ContinuingHandler))?;
    registry.register("fail", Arc::new(FailingHandler))?;
    registry.register("hold", Arc::new(HoldHandler::default()))?;
    Ok(())
}
