// Workflow run command
//
// Design Decision: Poll the index for the workflow's state; the run ends on any
// terminal state, or on PAUSED when auto-resume is off.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use mediaflow_engine::{
    MediaPackage, StepWorkerPool, WorkflowDefinition, WorkflowInstance, WorkflowState,
};
use tracing::info;

use super::LocalEngine;
use crate::definitions::load_file;
use crate::output::{print_field, print_table_header, print_table_row, OutputFormat};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on automatic resumes for one run
const MAX_AUTO_RESUMES: usize = 100;

#[derive(Args)]
pub struct RunArgs {
    /// Definition id, or path to a definition file
    pub workflow: String,

    /// Media package identifier
    #[arg(
        long,
        short = 'm',
        default_value = "mediapackage",
        conflicts_with = "mediapackage_file"
    )]
    pub mediapackage: String,

    /// Media package JSON file
    #[arg(long)]
    pub mediapackage_file: Option<PathBuf>,

    /// Workflow property (repeatable)
    #[arg(long = "property", short = 'p', value_parser = parse_key_val)]
    pub properties: Vec<(String, String)>,

    /// Resume paused operations automatically
    #[arg(long)]
    pub auto_resume: bool,

    /// Property passed on each automatic resume (repeatable)
    #[arg(long = "resume", value_parser = parse_key_val, requires = "auto_resume")]
    pub resume_properties: Vec<(String, String)>,

    /// Max wait time in seconds
    #[arg(long, default_value = "300")]
    pub timeout: u64,
}

/// Parse a `key=value` pair
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{}`", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in `{}`", s));
    }
    Ok((key.to_string(), value.to_string()))
}

/// How a run drives its workflow once started
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub auto_resume: bool,
    pub resume_properties: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            auto_resume: false,
            resume_properties: BTreeMap::new(),
            timeout: Duration::from_secs(300),
        }
    }
}

pub async fn run(dir: &Path, args: RunArgs, output: OutputFormat, quiet: bool) -> Result<()> {
    let local = LocalEngine::load(dir)?;

    let definition = if Path::new(&args.workflow).is_file() {
        load_file(Path::new(&args.workflow))?
    } else {
        local.engine.get_definition(&args.workflow)?
    };

    let mediapackage = match &args.mediapackage_file {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<MediaPackage>(&raw)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => MediaPackage::new(&args.mediapackage),
    };

    let properties: BTreeMap<String, String> = args.properties.into_iter().collect();
    let options = RunOptions {
        auto_resume: args.auto_resume,
        resume_properties: args.resume_properties.into_iter().collect(),
        timeout: Duration::from_secs(args.timeout),
    };

    let finished = execute(&local, &definition, mediapackage, properties, &options).await?;
    if !quiet && output.is_text() {
        print_field("Workflow", &finished.id.to_string());
        print_field("Definition", &definition.id);
    }
    report(&finished, output, quiet)?;

    if finished.state == WorkflowState::Failed {
        bail!("workflow {} failed", finished.id);
    }
    Ok(())
}

/// Start `definition` on a local step pool and wait until it settles
///
/// Returns the workflow once it reaches a terminal state, or PAUSED when
/// auto-resume is off.
pub async fn execute(
    local: &LocalEngine,
    definition: &WorkflowDefinition,
    mediapackage: MediaPackage,
    properties: BTreeMap<String, String>,
    options: &RunOptions,
) -> Result<WorkflowInstance> {
    let engine = local.engine.clone();
    if !engine.is_runnable(definition) {
        bail!(
            "workflow {} is not runnable; run `mediaflow validate` for details",
            definition.id
        );
    }

    let pool = StepWorkerPool::new(
        engine.clone(),
        local.dispatcher.queue(),
        engine.config().step_worker_config(),
    );
    pool.start().await?;

    let outcome = poll(local, definition, mediapackage, properties, options).await;
    pool.shutdown().await?;
    outcome
}

async fn poll(
    local: &LocalEngine,
    definition: &WorkflowDefinition,
    mediapackage: MediaPackage,
    properties: BTreeMap<String, String>,
    options: &RunOptions,
) -> Result<WorkflowInstance> {
    let engine = &local.engine;
    let started = engine.start(definition, mediapackage, None, properties).await?;
    info!(workflow_id = %started.id, definition = %definition.id, "Started workflow");

    let deadline = tokio::time::Instant::now() + options.timeout;
    let mut resumes = 0;
    loop {
        let workflow = engine.get_workflow_by_id(started.id).await?;
        match workflow.state {
            state if state.is_terminal() => return Ok(workflow),
            WorkflowState::Paused if options.auto_resume && resumes < MAX_AUTO_RESUMES => {
                resumes += 1;
                info!(workflow_id = %workflow.id, resumes, "Resuming paused workflow");
                engine
                    .resume(workflow.id, options.resume_properties.clone())
                    .await?;
            }
            WorkflowState::Paused => return Ok(workflow),
            _ => {}
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for workflow {}", started.id);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn report(workflow: &WorkflowInstance, output: OutputFormat, quiet: bool) -> Result<()> {
    if !output.is_text() {
        return output.print_value(workflow);
    }

    print_field("State", workflow.state.as_str());
    if quiet {
        return Ok(());
    }

    println!();
    print_table_header(&[("#", 3), ("OPERATION", 24), ("STATE", 12)]);
    for op in &workflow.operations {
        print_table_row(&[
            (&op.position.to_string(), 3),
            (&op.id, 24),
            (&op.state.to_string(), 12),
        ]);
    }
    for message in &workflow.error_messages {
        print_field("Error", message);
    }
    if workflow.state == WorkflowState::Paused {
        let hold_url = workflow
            .current_operation()
            .and_then(|op| op.hold_state_url.as_ref());
        if let Some(url) = hold_url {
            print_field("Hold", url.as_str());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFINITIONS: &[(&str, &str)] = &[
        (
            "review.yaml",
            "id: review\noperations:\n  - id: continue\n  - id: hold\n  - id: continue\n",
        ),
        (
            "encode.yaml",
            "id: encode
operations:
  - id: continue
  - id: fail
    configuration:
      message: encoder crashed
",
        ),
    ];

    fn definitions_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("should create temp dir");
        for (name, body) in DEFINITIONS {
            std::fs::write(dir.path().join(name), body).expect("should write definition");
        }
        dir
    }

    fn args(workflow: &str, auto_resume: bool) -> RunArgs {
        RunArgs {
            workflow: workflow.to_string(),
            mediapackage: "mp-cli".to_string(),
            mediapackage_file: None,
            properties: vec![],
            auto_resume,
            resume_properties: vec![],
            timeout: 10,
        }
    }

    fn options(auto_resume: bool) -> RunOptions {
        RunOptions {
            auto_resume,
            timeout: Duration::from_secs(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_execute_stops_at_paused_without_auto_resume() {
        let dir = definitions_dir();
        let local = LocalEngine::load(dir.path()).expect("should load definitions");
        let definition = local.engine.get_definition("review").expect("should find review");

        let workflow = execute(
            &local,
            &definition,
            MediaPackage::new("mp-cli"),
            BTreeMap::new(),
            &options(false),
        )
        .await
        .expect("should run");

        assert_eq!(workflow.state, WorkflowState::Paused);
        assert_eq!(workflow.current_operation().map(|op| op.id.as_str()), Some("hold"));
        assert_eq!(workflow.mediapackage.identifier, "mp-cli");
    }

    #[tokio::test]
    async fn test_execute_auto_resume_reaches_succeeded() {
        let dir = definitions_dir();
        let local = LocalEngine::load(dir.path()).expect("should load definitions");
        let definition = local.engine.get_definition("review").expect("should find review");

        let workflow = execute(
            &local,
            &definition,
            MediaPackage::new("mp-cli"),
            BTreeMap::new(),
            &options(true),
        )
        .await
        .expect("should run");

        assert_eq!(workflow.state, WorkflowState::Succeeded);
    }

    #[tokio::test]
    async fn test_run_stops_at_paused_and_succeeds_with_auto_resume() {
        let dir = definitions_dir();
        run(dir.path(), args("review", false), OutputFormat::Json, true)
            .await
            .expect("paused run should not be an error");
        run(dir.path(), args("review", true), OutputFormat::Json, true)
            .await
            .expect("auto-resumed run should succeed");
    }

    #[tokio::test]
    async fn test_run_errors_on_failed_workflow() {
        let dir = definitions_dir();
        let err = run(dir.path(), args("encode", false), OutputFormat::Json, true)
            .await
            .expect_err("failed workflow should be an error");
        assert!(err.to_string().contains("failed"), "unexpected error: {}", err);

        let local = LocalEngine::load(dir.path()).expect("should load definitions");
        let definition = local.engine.get_definition("encode").expect("should find encode");
        let workflow = execute(
            &local,
            &definition,
            MediaPackage::new("mp-cli"),
            BTreeMap::new(),
            &options(false),
        )
        .await
        .expect("should run");
        assert_eq!(workflow.state, WorkflowState::Failed);
        assert!(workflow
            .error_messages
            .iter()
            .any(|message| message.contains("encoder crashed")));
    }

    #[tokio::test]
    async fn test_run_rejects_unrunnable_definition() {
        let dir = definitions_dir();
        std::fs::write(
            dir.path().join("orphan.yaml"),
            "id: orphan\noperations:\n  - id: transcode\n",
        )
        .expect("should write definition");

        let err = run(dir.path(), args("orphan", false), OutputFormat::Json, true)
            .await
            .expect_err("unrunnable definition should be rejected");
        assert!(err.to_string().contains("not runnable"), "unexpected error: {}", err);
    }

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("profile=hd=1080"),
            Ok(("profile".to_string(), "hd=1080".to_string()))
        );
        assert_eq!(parse_key_val("empty="), Ok(("empty".to_string(), String::new())));
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }
}
