//! In-memory implementation of WorkflowIndex

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::index::*;
use crate::workflow::{WorkflowInstance, WorkflowState};

/// In-memory implementation of WorkflowIndex
///
/// Instances are stored as owned snapshots; reads hand out clones, so a
/// caller never aliases what another step will read.
///
/// # Example
///
/// ```
/// use mediaflow_engine::persistence::InMemoryWorkflowIndex;
///
/// let index = InMemoryWorkflowIndex::new();
/// assert!(index.is_empty());
/// ```
pub struct InMemoryWorkflowIndex {
    workflows: RwLock<HashMap<Uuid, WorkflowInstance>>,
}

impl InMemoryWorkflowIndex {
    /// Create a new in-memory index
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of indexed workflows
    pub fn len(&self) -> usize {
        self.workflows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.read().is_empty()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.workflows.write().clear();
    }
}

impl Default for InMemoryWorkflowIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn compare(a: &WorkflowInstance, b: &WorkflowInstance, field: SortField) -> Ordering {
    match field {
        SortField::DateCreated => a.date_created.cmp(&b.date_created),
        SortField::Title => a.mediapackage.title.cmp(&b.mediapackage.title),
        SortField::SeriesTitle => a.mediapackage.series_title.cmp(&b.mediapackage.series_title),
    }
}

#[async_trait]
impl WorkflowIndex for InMemoryWorkflowIndex {
    async fn update(&self, instance: &WorkflowInstance) -> Result<(), IndexError> {
        if instance.id.is_nil() {
            return Err(IndexError::Storage(
                "cannot index a workflow without an id".to_string(),
            ));
        }
        self.workflows.write().insert(instance.id, instance.clone());
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<(), IndexError> {
        self.workflows
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(IndexError::NotFound(id))
    }

    async fn get_workflow_by_id(&self, id: Uuid) -> Result<WorkflowInstance, IndexError> {
        self.workflows
            .read()
            .get(&id)
            .cloned()
            .ok_or(IndexError::NotFound(id))
    }

    async fn count_workflow_instances(
        &self,
        state: Option<WorkflowState>,
        operation: Option<&str>,
    ) -> Result<u64, IndexError> {
        let workflows = self.workflows.read();
        let count = workflows
            .values()
            .filter(|wf| state.map_or(true, |s| wf.state == s))
            .filter(|wf| operation.map_or(true, |op| indexed_current_operation(wf) == Some(op)))
            .count();
        Ok(count as u64)
    }

    async fn get_workflow_instances(
        &self,
        query: &WorkflowQuery,
    ) -> Result<WorkflowSet, IndexError> {
        let started = Instant::now();

        let mut matched: Vec<WorkflowInstance> = {
            let workflows = self.workflows.read();
            workflows
                .values()
                .filter(|wf| query.matches(wf))
                .cloned()
                .collect()
        };

        matched.sort_by(|a, b| {
            compare(a, b, query.sort).then_with(|| a.id.cmp(&b.id))
        });
        if query.sort_order == SortOrder::Descending {
            matched.reverse();
        }

        let total_count = matched.len() as u64;
        let items = matched
            .into_iter()
            .skip(query.start_page.saturating_mul(query.count))
            .take(query.count)
            .collect();

        Ok(WorkflowSet {
            items,
            total_count,
            page_size: query.count,
            start_page: query.start_page,
            search_time: started.elapsed().as_millis() as u64,
        })
    }

    async fn get_statistics(&self) -> Result<WorkflowStatistics, IndexError> {
        let workflows = self.workflows.read();
        Ok(WorkflowStatistics::from_instances(workflows.values()))
    }
}
