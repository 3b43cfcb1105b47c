//! WorkflowIndex trait definition

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{WorkflowInstance, WorkflowState};

/// Default page size for instance queries
pub const DEFAULT_QUERY_COUNT: usize = 20;

/// Error type for index operations
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    NotFound(Uuid),

    /// Backend storage failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for IndexError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Operation id an index records as "current" for an instance
///
/// Terminal workflows have no current operation.
pub fn indexed_current_operation(instance: &WorkflowInstance) -> Option<&str> {
    if instance.state.is_terminal() {
        return None;
    }
    instance.current_operation().map(|op| op.id.as_str())
}

/// Include or exclude a value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryTerm<T> {
    pub value: T,
    pub include: bool,
}

/// Sortable fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    DateCreated,
    Title,
    SeriesTitle,
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Query over indexed workflow instances
///
/// Include terms match if any of them matches; exclude terms reject an
/// instance if any of them matches.
///
/// # Example
///
/// ```
/// use mediaflow_engine::persistence::WorkflowQuery;
/// use mediaflow_engine::workflow::WorkflowState;
///
/// let query = WorkflowQuery::new()
///     .with_state(WorkflowState::Paused)
///     .without_current_operation("hold")
///     .with_count(50);
/// assert_eq!(query.count, 50);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowQuery {
    pub id: Option<Uuid>,
    pub mediapackage: Option<String>,
    pub series_id: Option<String>,
    pub series_title: Option<String>,
    pub definition_id: Option<String>,
    pub creator: Option<String>,
    pub contributor: Option<String>,
    pub language: Option<String>,
    pub license: Option<String>,
    pub title: Option<String>,
    pub subject: Option<String>,
    /// Free text, matched against titles, ids and people
    pub text: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub states: Vec<QueryTerm<WorkflowState>>,
    pub current_operations: Vec<QueryTerm<String>>,
    pub sort: SortField,
    pub sort_order: SortOrder,
    pub count: usize,
    pub start_page: usize,
}

impl Default for WorkflowQuery {
    fn default() -> Self {
        Self {
            id: None,
            mediapackage: None,
            series_id: None,
            series_title: None,
            definition_id: None,
            creator: None,
            contributor: None,
            language: None,
            license: None,
            title: None,
            subject: None,
            text: None,
            created_after: None,
            created_before: None,
            states: Vec::new(),
            current_operations: Vec::new(),
            sort: SortField::default(),
            sort_order: SortOrder::default(),
            count: DEFAULT_QUERY_COUNT,
            start_page: 0,
        }
    }
}

impl WorkflowQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_mediapackage(mut self, id: impl Into<String>) -> Self {
        self.mediapackage = Some(id.into());
        self
    }

    pub fn with_series_id(mut self, id: impl Into<String>) -> Self {
        self.series_id = Some(id.into());
        self
    }

    pub fn with_series_title(mut self, title: impl Into<String>) -> Self {
        self.series_title = Some(title.into());
        self
    }

    pub fn with_definition_id(mut self, id: impl Into<String>) -> Self {
        self.definition_id = Some(id.into());
        self
    }

    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = Some(creator.into());
        self
    }

    pub fn with_contributor(mut self, contributor: impl Into<String>) -> Self {
        self.contributor = Some(contributor.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_license(mut self, license: impl Into<String>) -> Self {
        self.license = Some(license.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Restrict to instances created within `[after, before]`
    pub fn with_date_range(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_after = after;
        self.created_before = before;
        self
    }

    pub fn with_state(mut self, state: WorkflowState) -> Self {
        self.states.push(QueryTerm { value: state, include: true });
        self
    }

    pub fn without_state(mut self, state: WorkflowState) -> Self {
        self.states.push(QueryTerm { value: state, include: false });
        self
    }

    pub fn with_current_operation(mut self, operation: impl Into<String>) -> Self {
        self.current_operations.push(QueryTerm {
            value: operation.into(),
            include: true,
        });
        self
    }

    pub fn without_current_operation(mut self, operation: impl Into<String>) -> Self {
        self.current_operations.push(QueryTerm {
            value: operation.into(),
            include: false,
        });
        self
    }

    pub fn with_sort(mut self, field: SortField, order: SortOrder) -> Self {
        self.sort = field;
        self.sort_order = order;
        self
    }

    /// Page size; zero falls back to the default
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = if count == 0 { DEFAULT_QUERY_COUNT } else { count };
        self
    }

    pub fn with_start_page(mut self, page: usize) -> Self {
        self.start_page = page;
        self
    }

    /// Check whether an instance satisfies every filter of this query
    pub fn matches(&self, instance: &WorkflowInstance) -> bool {
        let mp = &instance.mediapackage;

        if self.id.is_some_and(|id| id != instance.id) {
            return false;
        }
        if !matches_exact(&self.mediapackage, Some(&mp.identifier))
            || !matches_exact(&self.series_id, mp.series.as_ref())
            || !matches_exact(&self.definition_id, Some(&instance.template))
            || !matches_ignore_case(&self.series_title, mp.series_title.iter())
            || !matches_ignore_case(&self.language, mp.language.iter())
            || !matches_ignore_case(&self.license, mp.license.iter())
            || !matches_ignore_case(&self.title, mp.title.iter())
            || !matches_ignore_case(&self.creator, mp.creators.iter())
            || !matches_ignore_case(&self.contributor, mp.contributors.iter())
            || !matches_ignore_case(&self.subject, mp.subjects.iter())
        {
            return false;
        }

        if self.created_after.is_some_and(|after| instance.date_created < after)
            || self.created_before.is_some_and(|before| instance.date_created > before)
        {
            return false;
        }

        if let Some(text) = &self.text {
            if !matches_text(text, instance) {
                return false;
            }
        }

        let current = indexed_current_operation(instance);
        matches_terms(&self.states, |state| *state == instance.state)
            && matches_terms(&self.current_operations, |op| current == Some(op.as_str()))
    }
}

fn matches_exact(filter: &Option<String>, value: Option<&String>) -> bool {
    match filter {
        None => true,
        Some(expected) => value.is_some_and(|v| v == expected),
    }
}

fn matches_ignore_case<'a>(
    filter: &Option<String>,
    mut values: impl Iterator<Item = &'a String>,
) -> bool {
    match filter {
        None => true,
        Some(expected) => values.any(|v| v.eq_ignore_ascii_case(expected)),
    }
}

fn matches_text(text: &str, instance: &WorkflowInstance) -> bool {
    let needle = text.to_lowercase();
    let mp = &instance.mediapackage;
    let haystack = [
        Some(&instance.template),
        instance.title.as_ref(),
        Some(&mp.identifier),
        mp.title.as_ref(),
        mp.series_title.as_ref(),
    ];

    haystack
        .into_iter()
        .flatten()
        .chain(mp.creators.iter())
        .chain(mp.contributors.iter())
        .chain(mp.subjects.iter())
        .any(|field| field.to_lowercase().contains(&needle))
}

fn matches_terms<T>(terms: &[QueryTerm<T>], is_match: impl Fn(&T) -> bool) -> bool {
    let mut includes = terms.iter().filter(|t| t.include).peekable();
    if includes.peek().is_some() && !includes.any(|t| is_match(&t.value)) {
        return false;
    }
    !terms.iter().any(|t| !t.include && is_match(&t.value))
}

/// One page of query results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSet {
    pub items: Vec<WorkflowInstance>,
    /// Matches across all pages
    pub total_count: u64,
    pub page_size: usize,
    pub start_page: usize,
    /// Milliseconds spent searching
    pub search_time: u64,
}

impl WorkflowSet {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Workflow counts per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub instantiated: u64,
    pub running: u64,
    pub paused: u64,
    pub stopped: u64,
    pub failing: u64,
    pub failed: u64,
    pub succeeded: u64,
    pub total: u64,
}

impl StateCounts {
    pub fn record(&mut self, state: WorkflowState) {
        let counter = match state {
            WorkflowState::Instantiated => &mut self.instantiated,
            WorkflowState::Running => &mut self.running,
            WorkflowState::Paused => &mut self.paused,
            WorkflowState::Stopped => &mut self.stopped,
            WorkflowState::Failing => &mut self.failing,
            WorkflowState::Failed => &mut self.failed,
            WorkflowState::Succeeded => &mut self.succeeded,
        };
        *counter += 1;
        self.total += 1;
    }

    pub fn get(&self, state: WorkflowState) -> u64 {
        match state {
            WorkflowState::Instantiated => self.instantiated,
            WorkflowState::Running => self.running,
            WorkflowState::Paused => self.paused,
            WorkflowState::Stopped => self.stopped,
            WorkflowState::Failing => self.failing,
            WorkflowState::Failed => self.failed,
            WorkflowState::Succeeded => self.succeeded,
        }
    }
}

/// Counts of workflows currently positioned at one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationReport {
    pub id: String,
    pub counts: StateCounts,
}

/// Counts of workflows started from one definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionReport {
    pub id: String,
    pub counts: StateCounts,
    pub operations: Vec<OperationReport>,
}

/// Aggregate counts over all indexed workflows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatistics {
    pub counts: StateCounts,
    pub definitions: Vec<DefinitionReport>,
}

impl WorkflowStatistics {
    /// Aggregate statistics from a set of instances
    pub fn from_instances<'a>(instances: impl IntoIterator<Item = &'a WorkflowInstance>) -> Self {
        let mut counts = StateCounts::default();
        let mut definitions: BTreeMap<&str, (StateCounts, BTreeMap<&str, StateCounts>)> =
            BTreeMap::new();

        for instance in instances {
            counts.record(instance.state);
            let (definition_counts, operations) =
                definitions.entry(instance.template.as_str()).or_default();
            definition_counts.record(instance.state);
            if let Some(op) = indexed_current_operation(instance) {
                operations.entry(op).or_default().record(instance.state);
            }
        }

        let definitions = definitions
            .into_iter()
            .map(|(id, (counts, operations))| DefinitionReport {
                id: id.to_string(),
                counts,
                operations: operations
                    .into_iter()
                    .map(|(id, counts)| OperationReport {
                        id: id.to_string(),
                        counts,
                    })
                    .collect(),
            })
            .collect();

        Self { counts, definitions }
    }
}

/// Persistent, queryable store of workflow instances
///
/// Every read returns an independent copy. Implementations must be
/// thread-safe and support concurrent access.
#[async_trait]
pub trait WorkflowIndex: Send + Sync + 'static {
    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert or replace an instance
    async fn update(&self, instance: &WorkflowInstance) -> Result<(), IndexError>;

    /// Remove an instance
    async fn remove(&self, id: Uuid) -> Result<(), IndexError>;

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get a fresh copy of an instance
    async fn get_workflow_by_id(&self, id: Uuid) -> Result<WorkflowInstance, IndexError>;

    /// Count instances, optionally by state and by current operation
    async fn count_workflow_instances(
        &self,
        state: Option<WorkflowState>,
        operation: Option<&str>,
    ) -> Result<u64, IndexError>;

    /// Query one page of instances
    async fn get_workflow_instances(&self, query: &WorkflowQuery)
        -> Result<WorkflowSet, IndexError>;

    /// Aggregate counts by state, definition and operation
    async fn get_statistics(&self) -> Result<WorkflowStatistics, IndexError>;
}
