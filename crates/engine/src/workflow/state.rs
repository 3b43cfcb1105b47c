//! Workflow and operation state machines

use serde::{Deserialize, Serialize};

/// Workflow instance state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    /// Created, not yet started
    Instantiated,
    /// Actively stepping through operations
    Running,
    /// Waiting for `resume()`
    Paused,
    /// Running a spliced catch workflow
    Failing,
    /// Terminal failure
    Failed,
    /// All operations completed without a fatal failure
    Succeeded,
    /// Externally cancelled
    Stopped,
}

impl WorkflowState {
    /// All states, in lifecycle order
    pub const ALL: [WorkflowState; 7] = [
        WorkflowState::Instantiated,
        WorkflowState::Running,
        WorkflowState::Paused,
        WorkflowState::Failing,
        WorkflowState::Failed,
        WorkflowState::Succeeded,
        WorkflowState::Stopped,
    ];

    /// Check if the workflow can make no further progress
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Failed | WorkflowState::Succeeded | WorkflowState::Stopped
        )
    }

    /// States in which the engine keeps scheduling steps
    pub fn is_scheduling(&self) -> bool {
        matches!(self, WorkflowState::Running | WorkflowState::Failing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Instantiated => "INSTANTIATED",
            WorkflowState::Running => "RUNNING",
            WorkflowState::Paused => "PAUSED",
            WorkflowState::Failing => "FAILING",
            WorkflowState::Failed => "FAILED",
            WorkflowState::Succeeded => "SUCCEEDED",
            WorkflowState::Stopped => "STOPPED",
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown workflow state: {}", s))
    }
}

/// Operation instance state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    /// Created with the workflow, not yet executed
    Instantiated,
    /// Handler requested a pause
    Paused,
    /// Handler returned CONTINUE
    Succeeded,
    /// Skip condition matched, or handler returned SKIP
    Skipped,
    /// Handler failed, or failure propagated
    Failed,
}

impl OperationState {
    /// Check if the operation will not be executed again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Succeeded | OperationState::Skipped | OperationState::Failed
        )
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationState::Instantiated => "INSTANTIATED",
            OperationState::Paused => "PAUSED",
            OperationState::Succeeded => "SUCCEEDED",
            OperationState::Skipped => "SKIPPED",
            OperationState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}
