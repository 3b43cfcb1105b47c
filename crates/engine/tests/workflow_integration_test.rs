//! End-to-end tests: engine, in-memory dispatcher and a running step worker pool
//!
//! Run with: cargo test -p mediaflow-engine --test workflow_integration_test

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use uuid::Uuid;

use mediaflow_engine::dispatch::StepKind;
use mediaflow_engine::handler::{
    register_builtin_handlers, HoldHandler, ResumableOperationHandler,
};
use mediaflow_engine::persistence::{SortField, SortOrder};
use mediaflow_engine::prelude::*;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    engine: Arc<WorkflowEngine>,
    dispatcher: Arc<InMemoryJobDispatcher>,
    pool: StepWorkerPool,
    listener: Arc<WorkflowStateListener>,
}

impl Harness {
    async fn new() -> Self {
        let dispatcher = Arc::new(InMemoryJobDispatcher::new());
        let engine = Arc::new(WorkflowEngine::new(
            Arc::new(InMemoryWorkflowIndex::new()),
            dispatcher.clone(),
            EngineConfig::default().with_property("org.id", "mh_default_org"),
        ));
        register_builtin_handlers(engine.handlers()).expect("should register builtins");

        let listener = Arc::new(WorkflowStateListener::new());
        engine
            .add_workflow_listener(listener.clone())
            .expect("should add listener");

        let pool = StepWorkerPool::new(
            engine.clone(),
            dispatcher.queue(),
            StepWorkerConfig::default().with_max_concurrency(4),
        );
        pool.start().await.expect("pool should start");

        Self {
            engine,
            dispatcher,
            pool,
            listener,
        }
    }

    async fn start(&self, definition: &WorkflowDefinition, mediapackage: &str) -> WorkflowInstance {
        self.start_with(definition, mediapackage, BTreeMap::new()).await
    }

    async fn start_with(
        &self,
        definition: &WorkflowDefinition,
        mediapackage: &str,
        properties: BTreeMap<String, String>,
    ) -> WorkflowInstance {
        self.engine
            .start(definition, MediaPackage::new(mediapackage), None, properties)
            .await
            .expect("workflow should start")
    }

    async fn wait(&self, id: Uuid, state: WorkflowState) -> WorkflowInstance {
        assert!(
            self.listener.wait_for(id, state, WAIT).await,
            "workflow {} never reached {}",
            id,
            state
        );
        self.engine
            .get_workflow_by_id(id)
            .await
            .expect("workflow should be indexed")
    }

    async fn shutdown(self) {
        self.pool.shutdown().await.expect("pool should drain");
    }
}

/// Counts invocations and records the configuration it was started with
#[derive(Default)]
struct Recording {
    calls: AtomicUsize,
    seen: Mutex<Vec<BTreeMap<String, String>>>,
}

#[async_trait]
impl OperationHandler for Recording {
    async fn start(
        &self,
        workflow: &WorkflowInstance,
    ) -> Result<Option<OperationResult>, OperationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(op) = workflow.current_operation() {
            self.seen.lock().push(op.configuration.clone());
        }
        Ok(None)
    }
}

/// Resumable handler counting each lifecycle hook
#[derive(Default)]
struct CountingHold {
    starts: AtomicUsize,
    resumes: AtomicUsize,
    destroys: AtomicUsize,
}

impl CountingHold {
    fn counts(&self) -> (usize, usize, usize) {
        (
            self.starts.load(Ordering::SeqCst),
            self.resumes.load(Ordering::SeqCst),
            self.destroys.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl OperationHandler for CountingHold {
    async fn start(
        &self,
        _workflow: &WorkflowInstance,
    ) -> Result<Option<OperationResult>, OperationError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(Some(OperationResult::pause()))
    }

    async fn destroy(&self, _workflow: &WorkflowInstance) -> Result<(), OperationError> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn as_resumable(&self) -> Option<&dyn ResumableOperationHandler> {
        Some(self)
    }
}

#[async_trait]
impl ResumableOperationHandler for CountingHold {
    async fn resume(
        &self,
        _workflow: &WorkflowInstance,
        _properties: &BTreeMap<String, String>,
    ) -> Result<Option<OperationResult>, OperationError> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(Some(OperationResult::proceed()))
    }

    fn hold_action_title(&self) -> String {
        "Approve".to_string()
    }
}

fn linear(id: &str, ops: &[&str]) -> WorkflowDefinition {
    ops.iter().fold(WorkflowDefinition::new(id), |def, op| {
        def.with_operation(OperationDefinition::new(*op))
    })
}

#[test_log::test(tokio::test)]
async fn test_continue_pipeline_succeeds() {
    let harness = Harness::new().await;
    let wf = harness
        .start(&linear("publish", &["continue", "continue", "continue", "continue"]), "mp-1")
        .await;

    let done = harness.wait(wf.id, WorkflowState::Succeeded).await;
    assert!(done
        .operations
        .iter()
        .all(|op| op.state == OperationState::Succeeded && op.date_completed.is_some()));
    assert_eq!(harness.dispatcher.count_jobs(StepKind::StartOperation), 4);
    assert_eq!(harness.dispatcher.count_jobs(StepKind::StartWorkflow), 1);
    assert_eq!(
        harness.listener.history(wf.id).last(),
        Some(&WorkflowState::Succeeded)
    );

    harness.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_hold_pauses_until_resumed() {
    let harness = Harness::new().await;
    harness
        .engine
        .register_handler("review", Arc::new(HoldHandler::new("Review media")))
        .expect("should register");
    let def = WorkflowDefinition::new("review")
        .with_operation(OperationDefinition::new("continue"))
        .with_operation(
            OperationDefinition::new("review")
                .with_configuration("hold-url", "http://localhost/review"),
        )
        .with_operation(OperationDefinition::new("continue"));

    let wf = harness.start(&def, "mp-hold").await;
    let paused = harness.wait(wf.id, WorkflowState::Paused).await;
    assert_eq!(paused.operations[1].state, OperationState::Paused);
    assert_eq!(paused.operations[1].hold_action_title.as_deref(), Some("Review media"));
    assert_eq!(paused.operations[2].state, OperationState::Instantiated);

    harness
        .engine
        .resume(wf.id, BTreeMap::from([("reviewer".to_string(), "admin".to_string())]))
        .await
        .expect("should resume");

    let done = harness.wait(wf.id, WorkflowState::Succeeded).await;
    assert_eq!(done.properties.get("reviewer").map(String::as_str), Some("admin"));
    assert_eq!(done.operations[1].state, OperationState::Succeeded);

    harness.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_resume_calls_handler_once_per_workflow() {
    let harness = Harness::new().await;
    let review = Arc::new(CountingHold::default());
    harness
        .engine
        .register_handler("review", review.clone())
        .expect("should register");
    let def = linear("approval", &["continue", "review", "continue"]);

    let a = harness.start(&def, "mp-a").await;
    let b = harness.start(&def, "mp-b").await;
    harness.wait(a.id, WorkflowState::Paused).await;
    harness.wait(b.id, WorkflowState::Paused).await;
    assert_eq!(
        harness
            .engine
            .count_workflow_instances(Some(WorkflowState::Paused), Some("review"))
            .await
            .unwrap(),
        2
    );
    assert_eq!(review.counts(), (2, 0, 0));

    harness
        .engine
        .resume(a.id, BTreeMap::new())
        .await
        .expect("should resume");
    let a = harness.wait(a.id, WorkflowState::Succeeded).await;

    // start per workflow, resume and destroy only for the resumed one
    assert_eq!(review.counts(), (2, 1, 1));
    assert_eq!(a.mediapackage.identifier, "mp-a");
    assert_eq!(a.operations[1].state, OperationState::Succeeded);

    let b = harness.engine.get_workflow_by_id(b.id).await.unwrap();
    assert_eq!(b.state, WorkflowState::Paused);
    assert_eq!(b.mediapackage.identifier, "mp-b");
    assert_eq!(b.operations[1].state, OperationState::Paused);
    assert_eq!(
        harness
            .engine
            .count_workflow_instances(Some(WorkflowState::Paused), Some("review"))
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        harness
            .engine
            .count_workflow_instances(None, Some("review"))
            .await
            .unwrap(),
        1
    );

    harness.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_multiple_holds() {
    let harness = Harness::new().await;
    let wf = harness
        .start(&linear("double", &["hold", "continue", "hold"]), "mp-holds")
        .await;

    harness.wait(wf.id, WorkflowState::Paused).await;
    harness.engine.resume(wf.id, BTreeMap::new()).await.unwrap();

    assert!(
        harness
            .listener
            .wait_for_nth(wf.id, WorkflowState::Paused, 2, WAIT)
            .await
    );
    let second = harness.engine.get_workflow_by_id(wf.id).await.unwrap();
    assert_eq!(second.operations[2].state, OperationState::Paused);

    harness.engine.resume(wf.id, BTreeMap::new()).await.unwrap();
    let done = harness.wait(wf.id, WorkflowState::Succeeded).await;
    assert_eq!(done.operations.len(), 3);
    assert_eq!(harness.dispatcher.count_jobs(StepKind::Resume), 2);

    harness.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_failure_without_catch_workflow() {
    let harness = Harness::new().await;
    let after = Arc::new(Recording::default());
    harness.engine.register_handler("after", after.clone()).unwrap();

    let def = WorkflowDefinition::new("broken")
        .with_operation(OperationDefinition::new("continue"))
        .with_operation(
            OperationDefinition::new("fail").with_configuration("message", "encoder crashed"),
        )
        .with_operation(OperationDefinition::new("after"));

    let wf = harness.start(&def, "mp-fail").await;
    let failed = harness.wait(wf.id, WorkflowState::Failed).await;

    assert_eq!(failed.operations[1].state, OperationState::Failed);
    assert_eq!(failed.operations[2].state, OperationState::Instantiated);
    assert_eq!(failed.error_messages, vec!["encoder crashed".to_string()]);
    assert_eq!(after.calls.load(Ordering::SeqCst), 0);

    harness.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_catch_workflow_runs_then_fails() {
    let harness = Harness::new().await;
    let cleanup = Arc::new(Recording::default());
    harness.engine.register_handler("cleanup", cleanup.clone()).unwrap();
    harness
        .engine
        .register_definition(linear("error", &["cleanup", "cleanup"]))
        .unwrap();

    let def = WorkflowDefinition::new("guarded")
        .with_operation(OperationDefinition::new("continue"))
        .with_operation(OperationDefinition::new("fail").with_exception_handler("error"))
        .with_operation(OperationDefinition::new("continue"));
    assert!(harness.engine.is_runnable(&def));

    let wf = harness.start(&def, "mp-catch").await;
    let failed = harness.wait(wf.id, WorkflowState::Failed).await;

    let ops: Vec<_> = failed
        .operations
        .iter()
        .map(|op| (op.id.as_str(), op.state))
        .collect();
    assert_eq!(
        ops,
        vec![
            ("continue", OperationState::Succeeded),
            ("fail", OperationState::Failed),
            ("cleanup", OperationState::Succeeded),
            ("cleanup", OperationState::Succeeded),
        ]
    );
    assert_eq!(cleanup.calls.load(Ordering::SeqCst), 2);
    assert!(harness.listener.history(wf.id).contains(&WorkflowState::Failing));

    harness.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_properties_substituted_into_configuration() {
    let harness = Harness::new().await;
    let encode = Arc::new(Recording::default());
    harness.engine.register_handler("encode", encode.clone()).unwrap();

    let def = WorkflowDefinition::new("templated").with_operation(
        OperationDefinition::new("encode")
            .with_configuration("profile", "${profile}")
            .with_configuration("org", "${org.id}")
            .with_configuration("missing", "${nope}"),
    );
    let props = BTreeMap::from([("profile".to_string(), "hd".to_string())]);
    let wf = harness.start_with(&def, "mp-tpl", props).await;
    harness.wait(wf.id, WorkflowState::Succeeded).await;

    let seen = encode.seen.lock().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].get("profile").map(String::as_str), Some("hd"));
    assert_eq!(seen[0].get("org").map(String::as_str), Some("mh_default_org"));
    assert_eq!(seen[0].get("missing").map(String::as_str), Some("${nope}"));

    harness.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_skip_conditions() {
    let harness = Harness::new().await;
    let encode = Arc::new(Recording::default());
    harness.engine.register_handler("encode", encode.clone()).unwrap();

    let def = WorkflowDefinition::new("conditional")
        .with_operation(OperationDefinition::new("encode").with_execute_condition("${hd}"))
        .with_operation(OperationDefinition::new("encode").with_skip_condition("${hd}"));
    let props = BTreeMap::from([("hd".to_string(), "true".to_string())]);
    let wf = harness.start_with(&def, "mp-skip", props).await;

    let done = harness.wait(wf.id, WorkflowState::Succeeded).await;
    assert_eq!(done.operations[0].state, OperationState::Succeeded);
    assert_eq!(done.operations[1].state, OperationState::Skipped);
    assert_eq!(encode.calls.load(Ordering::SeqCst), 1);

    harness.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_concurrent_workflows() {
    let harness = Harness::new().await;
    let def = linear("batch", &["continue", "continue", "continue"]);

    let started = join_all((0..10).map(|i| {
        let engine = harness.engine.clone();
        let def = def.clone();
        async move {
            engine
                .start(&def, MediaPackage::new(format!("mp-{}", i)), None, BTreeMap::new())
                .await
        }
    }))
    .await;
    let ids: Vec<Uuid> = started
        .into_iter()
        .map(|r| r.expect("workflow should start").id)
        .collect();
    for (i, id) in ids.iter().enumerate() {
        let done = harness.wait(*id, WorkflowState::Succeeded).await;
        assert_eq!(done.mediapackage.identifier, format!("mp-{}", i));
    }

    assert_eq!(harness.dispatcher.count_jobs(StepKind::StartOperation), 30);
    assert_eq!(
        harness
            .engine
            .count_workflow_instances(Some(WorkflowState::Succeeded), None)
            .await
            .unwrap(),
        10
    );

    let stats = harness.engine.get_statistics().await.unwrap();
    assert_eq!(stats.counts.get(WorkflowState::Succeeded), 10);

    let page = harness
        .engine
        .get_workflow_instances(
            &WorkflowQuery::new()
                .with_definition_id("batch")
                .with_sort(SortField::DateCreated, SortOrder::Descending)
                .with_count(4)
                .with_start_page(1),
        )
        .await
        .unwrap();
    assert_eq!(page.total_count, 10);
    assert_eq!(page.items.len(), 4);

    harness.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_stop_and_remove() {
    let harness = Harness::new().await;
    let wf = harness
        .start(&linear("stoppable", &["continue", "hold", "continue"]), "mp-stop")
        .await;
    harness.wait(wf.id, WorkflowState::Paused).await;

    let stopped = harness.engine.stop(wf.id).await.expect("should stop");
    assert_eq!(stopped.state, WorkflowState::Stopped);
    assert!(matches!(
        harness.engine.resume(wf.id, BTreeMap::new()).await,
        Err(EngineError::IllegalState(_))
    ));

    harness.engine.remove(wf.id).await.expect("should remove");
    assert!(harness
        .engine
        .get_workflow_by_id(wf.id)
        .await
        .unwrap_err()
        .is_not_found());

    harness.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_parent_must_exist() {
    let harness = Harness::new().await;
    let def = linear("child", &["continue"]);

    let missing = Uuid::now_v7();
    let result = harness
        .engine
        .start(&def, MediaPackage::new("mp-child"), Some(missing), BTreeMap::new())
        .await;
    assert!(matches!(result, Err(EngineError::ParentNotFound(id)) if id == missing));

    let parent = harness.start(&def, "mp-parent").await;
    let child = harness
        .engine
        .start(&def, MediaPackage::new("mp-child"), Some(parent.id), BTreeMap::new())
        .await
        .expect("child should start");
    assert_eq!(child.parent_id, Some(parent.id));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_handler_rejected() {
    let harness = Harness::new().await;
    let result = harness
        .engine
        .register_handler("continue", Arc::new(Recording::default()));
    assert!(matches!(result, Err(EngineError::Registry(_))));

    harness.shutdown().await;
}
