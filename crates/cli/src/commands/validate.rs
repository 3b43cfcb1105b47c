// Definition validation command

use std::path::Path;

use anyhow::{bail, Result};
use mediaflow_engine::WorkflowDefinition;
use serde::Serialize;

use super::LocalEngine;
use crate::output::{print_table_header, print_table_row, OutputFormat};

#[derive(Debug, Serialize)]
struct ValidationReport {
    id: String,
    file: String,
    runnable: bool,
    /// Operations without a registered handler
    missing_handlers: Vec<String>,
    /// Catch workflows that are not defined
    missing_definitions: Vec<String>,
}

pub async fn run(dir: &Path, output: OutputFormat) -> Result<()> {
    let local = LocalEngine::load(dir)?;
    let reports = reports(&local);

    if output.is_text() {
        print_table_header(&[("ID", 20), ("RUNNABLE", 9), ("PROBLEMS", 48)]);
        for report in &reports {
            let problems = report
                .missing_handlers
                .iter()
                .map(|op| format!("no handler for {}", op))
                .chain(
                    report
                        .missing_definitions
                        .iter()
                        .map(|id| format!("unknown catch workflow {}", id)),
                )
                .collect::<Vec<_>>()
                .join("; ");
            print_table_row(&[
                (&report.id, 20),
                (if report.runnable { "yes" } else { "no" }, 9),
                (if problems.is_empty() { "-" } else { problems.as_str() }, 48),
            ]);
        }
    } else {
        output.print_value(&serde_json::json!({ "data": reports, "total": reports.len() }))?;
    }

    check(&reports)
}

fn reports(local: &LocalEngine) -> Vec<ValidationReport> {
    local
        .loaded
        .iter()
        .map(|item| {
            let (missing_handlers, missing_definitions) = problems(local, &item.definition);
            ValidationReport {
                id: item.definition.id.clone(),
                file: item.path.display().to_string(),
                runnable: local.engine.is_runnable(&item.definition),
                missing_handlers,
                missing_definitions,
            }
        })
        .collect()
}

/// Fails when any definition is not runnable
fn check(reports: &[ValidationReport]) -> Result<()> {
    let broken = reports.iter().filter(|r| !r.runnable).count();
    if broken > 0 {
        bail!("{} of {} definitions are not runnable", broken, reports.len());
    }
    Ok(())
}

/// Direct problems of one definition; nested catch workflows report their own
fn problems(local: &LocalEngine, definition: &WorkflowDefinition) -> (Vec<String>, Vec<String>) {
    let handlers = local.engine.handlers();
    let registry = local.engine.definitions();

    let mut missing_handlers: Vec<String> = definition
        .operations
        .iter()
        .filter(|op| !handlers.contains(&op.id))
        .map(|op| op.id.clone())
        .collect();
    missing_handlers.sort();
    missing_handlers.dedup();

    let missing_definitions = definition
        .operations
        .iter()
        .filter_map(|op| op.exception_handler_workflow.as_ref())
        .filter(|id| !registry.contains(id))
        .cloned()
        .collect();

    (missing_handlers, missing_definitions)
}
