//! Engine error type

use uuid::Uuid;

use crate::dispatch::DispatchError;
use crate::handler::RegistryError;
use crate::listener::ListenerError;
use crate::persistence::IndexError;

/// Errors surfaced by the workflow engine
///
/// Handler failures are not errors at this level; they are recorded on
/// the instance and routed through the failure protocol.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Caller passed an unusable definition, payload or property set
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Parent workflow id does not resolve
    #[error("parent workflow not found: {0}")]
    ParentNotFound(Uuid),

    /// Definition id does not resolve
    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(String),

    /// Handler asked to pause without supporting resume
    #[error("handler for operation {0} is not resumable")]
    NotResumable(String),

    /// Operation requested in a state that does not allow it
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Registration error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Index error
    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// Listener registration error
    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),

    /// Dispatcher error
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether this error means the workflow does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::Index(IndexError::NotFound(_)))
    }
}
