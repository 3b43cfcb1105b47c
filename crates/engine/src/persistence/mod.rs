//! Persistence layer for workflow instances
//!
//! The index is the source of truth for an instance's state. Steps read a
//! fresh copy, mutate it, and write it back.

mod index;
mod memory;

pub use index::{
    indexed_current_operation, DefinitionReport, IndexError, OperationReport, QueryTerm,
    SortField, SortOrder, StateCounts, WorkflowIndex, WorkflowQuery, WorkflowSet,
    WorkflowStatistics, DEFAULT_QUERY_COUNT,
};
pub use memory::InMemoryWorkflowIndex;
