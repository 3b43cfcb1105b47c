//! Operation handler traits and results

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::workflow::{MediaPackage, WorkflowInstance};

/// Error returned by a handler when an operation fails
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationError {
    /// Error message, recorded on the workflow instance
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl OperationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for OperationError {}

impl From<anyhow::Error> for OperationError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{:#}", err))
    }
}

/// What the engine should do after an operation step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Operation succeeded, move on
    Continue,
    /// Hold the workflow until it is resumed
    Pause,
    /// Operation did nothing, move on
    Skip,
}

/// Outcome of a handler's `start`, `skip` or `resume`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    /// Replacement payload, if the handler produced one
    pub mediapackage: Option<MediaPackage>,

    /// Properties applied to the instance through templating
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    pub action: Action,

    pub continuable: bool,

    pub abortable: bool,

    /// Milliseconds the handler's work spent queued
    #[serde(default)]
    pub time_in_queue: u64,
}

impl OperationResult {
    fn with_action(action: Action) -> Self {
        Self {
            mediapackage: None,
            properties: BTreeMap::new(),
            action,
            continuable: true,
            abortable: true,
            time_in_queue: 0,
        }
    }

    /// A CONTINUE result
    pub fn proceed() -> Self {
        Self::with_action(Action::Continue)
    }

    /// A PAUSE result; only valid from a resumable handler
    pub fn pause() -> Self {
        Self::with_action(Action::Pause)
    }

    /// A SKIP result
    pub fn skip() -> Self {
        Self::with_action(Action::Skip)
    }

    pub fn with_mediapackage(mut self, mediapackage: MediaPackage) -> Self {
        self.mediapackage = Some(mediapackage);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn with_time_in_queue(mut self, millis: u64) -> Self {
        self.time_in_queue = millis;
        self
    }

    pub fn with_continuable(mut self, continuable: bool) -> Self {
        self.continuable = continuable;
        self
    }

    pub fn with_abortable(mut self, abortable: bool) -> Self {
        self.abortable = abortable;
        self
    }
}

/// A pluggable unit implementing one named pipeline step
///
/// Each step runs `start` (or `skip` when the operation's conditions say
/// so), and `destroy` once the operation leaves the handler for good. A
/// handler that pauses is resumed later through
/// [`ResumableOperationHandler::resume`], followed by `destroy`.
///
/// # Example
///
/// ```ignore
/// struct InspectHandler;
///
/// #[async_trait]
/// impl OperationHandler for InspectHandler {
///     async fn start(
///         &self,
///         workflow: &WorkflowInstance,
///     ) -> Result<Option<OperationResult>, OperationError> {
///         let mut mp = workflow.mediapackage.clone();
///         mp.elements = inspect(&mp.elements).await?;
///         Ok(Some(OperationResult::proceed().with_mediapackage(mp)))
///     }
/// }
/// ```
#[async_trait]
pub trait OperationHandler: Send + Sync + 'static {
    /// Run the operation. `None` is treated as CONTINUE.
    async fn start(
        &self,
        workflow: &WorkflowInstance,
    ) -> Result<Option<OperationResult>, OperationError>;

    /// Called instead of `start` when the operation's conditions skip it
    async fn skip(
        &self,
        _workflow: &WorkflowInstance,
    ) -> Result<Option<OperationResult>, OperationError> {
        Ok(Some(OperationResult::skip()))
    }

    /// Cleanup hook, called unless the operation paused
    async fn destroy(&self, _workflow: &WorkflowInstance) -> Result<(), OperationError> {
        Ok(())
    }

    /// Resumable capability, if this handler supports pausing
    fn as_resumable(&self) -> Option<&dyn ResumableOperationHandler> {
        None
    }
}

/// A handler that can hold a workflow for human input
///
/// Implementors return `Some(self)` from
/// [`OperationHandler::as_resumable`].
#[async_trait]
pub trait ResumableOperationHandler: OperationHandler {
    /// Continue a paused operation with the properties supplied to `resume()`
    async fn resume(
        &self,
        workflow: &WorkflowInstance,
        properties: &BTreeMap<String, String>,
    ) -> Result<Option<OperationResult>, OperationError>;

    /// UI reference shown while the workflow is on hold
    fn hold_state_url(&self, _workflow: &WorkflowInstance) -> Option<Url> {
        None
    }

    /// Label of the action that releases the hold
    fn hold_action_title(&self) -> String;
}
