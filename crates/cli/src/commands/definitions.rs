// Definition listing command

use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use super::LocalEngine;
use crate::output::{print_table_header, print_table_row, OutputFormat};

#[derive(Debug, Serialize)]
struct DefinitionInfo {
    id: String,
    title: Option<String>,
    operations: Vec<String>,
}

pub async fn run(dir: &Path, output: OutputFormat) -> Result<()> {
    let local = LocalEngine::load(dir)?;
    let infos: Vec<DefinitionInfo> = local
        .engine
        .list_definitions()
        .into_iter()
        .map(|d| DefinitionInfo {
            id: d.id,
            title: d.title,
            operations: d.operations.into_iter().map(|op| op.id).collect(),
        })
        .collect();

    if !output.is_text() {
        return output.print_value(&serde_json::json!({ "data": infos, "total": infos.len() }));
    }

    if infos.is_empty() {
        println!("No definitions found in {}", dir.display());
        return Ok(());
    }

    print_table_header(&[("ID", 20), ("TITLE", 24), ("OPERATIONS", 40)]);
    for info in &infos {
        let operations = info.operations.join(", ");
        print_table_row(&[
            (&info.id, 20),
            (info.title.as_deref().unwrap_or("-"), 24),
            (&operations, 40),
        ]);
    }
    Ok(())
}
