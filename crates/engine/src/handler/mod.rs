//! Operation handlers: the plugin contract and its registry

mod builtin;
mod definition;
mod registry;

pub use builtin::{
    register_builtin_handlers, ContinuingHandler, FailingHandler, HoldHandler, FAIL_MESSAGE_KEY,
    HOLD_URL_KEY,
};
pub use definition::{
    Action, OperationError, OperationHandler, OperationResult, ResumableOperationHandler,
};
pub use registry::{HandlerRegistry, RegistryError};
