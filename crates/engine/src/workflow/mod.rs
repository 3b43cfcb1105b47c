//! Workflow data model: definitions, instances, payloads and states

mod definition;
mod instance;
mod mediapackage;
mod state;

pub use definition::{DefinitionRegistry, OperationDefinition, WorkflowDefinition};
pub use instance::{OperationInstance, WorkflowInstance};
pub use mediapackage::MediaPackage;
pub(crate) use mediapackage::is_blank;
pub use state::{OperationState, WorkflowState};
