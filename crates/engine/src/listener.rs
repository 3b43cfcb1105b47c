//! Workflow change listeners
//!
//! Each listener gets its own bounded channel and consumer task. Engine
//! steps only ever `try_send`, so a slow or failing listener can drop
//! events but never delays or alters workflow execution. Events for one
//! listener arrive in the order the engine persisted them.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::workflow::{OperationState, WorkflowInstance, WorkflowState};

/// Receives notifications about persisted workflow changes
pub trait WorkflowListener: Send + Sync + 'static {
    /// The workflow's state differs from its previously persisted value
    fn state_changed(&self, _workflow: &WorkflowInstance) {}

    /// The workflow's current operation differs from its previously persisted value
    fn operation_changed(&self, _workflow: &WorkflowInstance) {}
}

/// Handle returned when registering a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Error type for listener registration
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Consumer tasks are spawned on the current tokio runtime
    #[error("listeners can only be added from within a tokio runtime")]
    NoRuntime,
}

enum ListenerEvent {
    StateChanged(WorkflowInstance),
    OperationChanged(WorkflowInstance),
}

impl ListenerEvent {
    fn workflow_id(&self) -> Uuid {
        match self {
            Self::StateChanged(wf) | Self::OperationChanged(wf) => wf.id,
        }
    }
}

fn current_marker(workflow: &WorkflowInstance) -> Option<(usize, OperationState)> {
    workflow
        .current_operation()
        .map(|op| (op.position, op.state))
}

/// Fan-out of workflow change events to registered listeners
pub struct ListenerRegistry {
    capacity: usize,
    next_id: AtomicU64,
    senders: RwLock<HashMap<ListenerId, mpsc::Sender<ListenerEvent>>>,
}

impl ListenerRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            senders: RwLock::new(HashMap::new()),
        }
    }

    /// Register a listener and spawn its consumer task on the current runtime
    pub fn add(
        &self,
        listener: std::sync::Arc<dyn WorkflowListener>,
    ) -> Result<ListenerId, ListenerError> {
        let runtime = Handle::try_current().map_err(|_| ListenerError::NoRuntime)?;
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, mut rx) = mpsc::channel::<ListenerEvent>(self.capacity);

        runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                let delivered = catch_unwind(AssertUnwindSafe(|| match &event {
                    ListenerEvent::StateChanged(wf) => listener.state_changed(wf),
                    ListenerEvent::OperationChanged(wf) => listener.operation_changed(wf),
                }));
                if delivered.is_err() {
                    error!(listener = ?id, "Workflow listener panicked");
                }
            }
            debug!(listener = ?id, "Listener task exited");
        });

        self.senders.write().insert(id, tx);
        Ok(id)
    }

    /// Unregister a listener; queued events are still delivered
    pub fn remove(&self, id: ListenerId) -> bool {
        self.senders.write().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.senders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.read().is_empty()
    }

    /// Compare a persisted instance with its previous snapshot and notify
    pub fn notify(&self, previous: Option<&WorkflowInstance>, current: &WorkflowInstance) {
        let state_changed = previous.map_or(true, |p| p.state != current.state);
        let operation_changed =
            previous.map_or(true, |p| current_marker(p) != current_marker(current));

        if !state_changed && !operation_changed {
            return;
        }

        let senders = self.senders.read();
        for (id, tx) in senders.iter() {
            if state_changed {
                Self::deliver(*id, tx, ListenerEvent::StateChanged(current.clone()));
            }
            if operation_changed {
                Self::deliver(*id, tx, ListenerEvent::OperationChanged(current.clone()));
            }
        }
    }

    fn deliver(id: ListenerId, tx: &mpsc::Sender<ListenerEvent>, event: ListenerEvent) {
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    listener = ?id,
                    workflow_id = %event.workflow_id(),
                    "Listener channel full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(listener = ?id, "Listener channel closed");
            }
        }
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("capacity", &self.capacity)
            .field("listeners", &self.len())
            .finish()
    }
}

#[derive(Debug, Default)]
struct Observed {
    total: u64,
    per_state: HashMap<WorkflowState, u64>,
    per_workflow: HashMap<Uuid, Vec<WorkflowState>>,
}

/// Listener that records state changes and lets callers wait for them
///
/// Optionally restricted to a set of workflow ids and a set of states.
///
/// # Example
///
/// ```ignore
/// let listener = Arc::new(WorkflowStateListener::new().for_states([WorkflowState::Succeeded]));
/// engine.add_workflow_listener(listener.clone())?;
/// let wf = engine.start(&definition, mediapackage, None, props).await?;
/// assert!(listener.wait_for(wf.id, WorkflowState::Succeeded, Duration::from_secs(5)).await);
/// ```
#[derive(Debug, Default)]
pub struct WorkflowStateListener {
    workflow_ids: Option<HashSet<Uuid>>,
    states: Option<HashSet<WorkflowState>>,
    observed: Mutex<Observed>,
    changed: Notify,
}

impl WorkflowStateListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only record these workflows
    pub fn for_workflows(mut self, ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.workflow_ids = Some(ids.into_iter().collect());
        self
    }

    /// Only record these states
    pub fn for_states(mut self, states: impl IntoIterator<Item = WorkflowState>) -> Self {
        self.states = Some(states.into_iter().collect());
        self
    }

    /// Number of recorded state changes
    pub fn total(&self) -> u64 {
        self.observed.lock().total
    }

    /// Number of recorded changes into `state`
    pub fn count(&self, state: WorkflowState) -> u64 {
        self.observed
            .lock()
            .per_state
            .get(&state)
            .copied()
            .unwrap_or(0)
    }

    /// Most recent recorded state of a workflow
    pub fn latest(&self, id: Uuid) -> Option<WorkflowState> {
        self.observed
            .lock()
            .per_workflow
            .get(&id)
            .and_then(|states| states.last().copied())
    }

    /// Recorded states of a workflow, in order
    pub fn history(&self, id: Uuid) -> Vec<WorkflowState> {
        self.observed
            .lock()
            .per_workflow
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    fn occurrences(&self, id: Uuid, state: WorkflowState) -> usize {
        self.observed
            .lock()
            .per_workflow
            .get(&id)
            .map_or(0, |states| states.iter().filter(|s| **s == state).count())
    }

    /// Wait until the workflow has entered `state` at least once
    pub async fn wait_for(&self, id: Uuid, state: WorkflowState, timeout: Duration) -> bool {
        self.wait_for_nth(id, state, 1, timeout).await
    }

    /// Wait until the workflow has entered `state` at least `n` times
    pub async fn wait_for_nth(
        &self,
        id: Uuid,
        state: WorkflowState,
        n: usize,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.occurrences(id, state) >= n {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.occurrences(id, state) >= n;
            }
        }
    }
}

impl WorkflowListener for WorkflowStateListener {
    fn state_changed(&self, workflow: &WorkflowInstance) {
        if self
            .workflow_ids
            .as_ref()
            .is_some_and(|ids| !ids.contains(&workflow.id))
        {
            return;
        }
        if self
            .states
            .as_ref()
            .is_some_and(|states| !states.contains(&workflow.state))
        {
            return;
        }

        {
            let mut observed = self.observed.lock();
            observed.total += 1;
            *observed.per_state.entry(workflow.state).or_default() += 1;
            observed
                .per_workflow
                .entry(workflow.id)
                .or_default()
                .push(workflow.state);
        }
        self.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::workflow::{MediaPackage, OperationDefinition, WorkflowDefinition};

    fn workflow(state: WorkflowState) -> WorkflowInstance {
        let definition = WorkflowDefinition::new("wf")
            .with_operation(OperationDefinition::new("a"))
            .with_operation(OperationDefinition::new("b"));
        let mut wf =
            WorkflowInstance::new(&definition, MediaPackage::new("mp"), None, BTreeMap::new());
        wf.id = Uuid::now_v7();
        wf.state = state;
        wf
    }

    #[derive(Default)]
    struct Counting {
        states: AtomicU64,
        operations: AtomicU64,
    }

    impl WorkflowListener for Counting {
        fn state_changed(&self, _workflow: &WorkflowInstance) {
            self.states.fetch_add(1, Ordering::SeqCst);
        }

        fn operation_changed(&self, _workflow: &WorkflowInstance) {
            self.operations.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    impl WorkflowListener for Panicking {
        fn state_changed(&self, _workflow: &WorkflowInstance) {
            panic!("listener bug");
        }
    }

    #[tokio::test]
    async fn test_notify_by_value_comparison() {
        let registry = ListenerRegistry::new(16);
        let counting = Arc::new(Counting::default());
        let states = Arc::new(WorkflowStateListener::new());
        registry.add(counting.clone()).expect("should add listener");
        registry.add(states.clone()).expect("should add listener");

        let running = workflow(WorkflowState::Running);
        registry.notify(None, &running);
        registry.notify(Some(&running), &running.clone());

        let mut paused = running.clone();
        paused.state = WorkflowState::Paused;
        registry.notify(Some(&running), &paused);

        let mut advanced = paused.clone();
        advanced.operations[0].state = OperationState::Succeeded;
        registry.notify(Some(&paused), &advanced);

        assert!(
            states
                .wait_for(running.id, WorkflowState::Paused, Duration::from_secs(1))
                .await
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counting.states.load(Ordering::SeqCst), 2);
        assert_eq!(counting.operations.load(Ordering::SeqCst), 2);
        assert_eq!(
            states.history(running.id),
            vec![WorkflowState::Running, WorkflowState::Paused]
        );
    }

    #[tokio::test]
    async fn test_state_listener_filters() {
        let registry = ListenerRegistry::new(16);
        let a = workflow(WorkflowState::Succeeded);
        let b = workflow(WorkflowState::Succeeded);
        let listener = Arc::new(
            WorkflowStateListener::new()
                .for_workflows([a.id])
                .for_states([WorkflowState::Succeeded]),
        );
        registry.add(listener.clone()).expect("should add listener");

        registry.notify(None, &workflow(WorkflowState::Running));
        registry.notify(None, &b);
        registry.notify(None, &a);

        assert!(
            listener
                .wait_for(a.id, WorkflowState::Succeeded, Duration::from_secs(1))
                .await
        );
        assert_eq!(listener.total(), 1);
        assert_eq!(listener.count(WorkflowState::Succeeded), 1);
        assert!(listener.latest(b.id).is_none());
    }

    #[test]
    fn test_add_outside_runtime_is_rejected() {
        let registry = ListenerRegistry::new(4);
        let result = registry.add(Arc::new(WorkflowStateListener::new()));
        assert!(matches!(result, Err(ListenerError::NoRuntime)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_listener_keeps_running() {
        let registry = ListenerRegistry::new(4);
        registry.add(Arc::new(Panicking)).expect("should add listener");
        let states = Arc::new(WorkflowStateListener::new());
        let id = registry.add(states.clone()).expect("should add listener");

        let wf = workflow(WorkflowState::Failed);
        registry.notify(None, &wf);
        assert!(
            states
                .wait_for(wf.id, WorkflowState::Failed, Duration::from_secs(1))
                .await
        );

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let listener = WorkflowStateListener::new();
        let waited = listener
            .wait_for(Uuid::now_v7(), WorkflowState::Succeeded, Duration::from_millis(30))
            .await;
        assert!(!waited);
    }
}
