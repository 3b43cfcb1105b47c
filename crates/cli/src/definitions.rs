// Workflow definition loading
//
// Design Decision: One definition per file; the format follows the extension.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use mediaflow_engine::WorkflowDefinition;

/// A definition together with the file it came from
pub struct LoadedDefinition {
    pub path: PathBuf,
    pub definition: WorkflowDefinition,
}

/// Parse one definition file
pub fn load_file(path: &Path) -> Result<WorkflowDefinition> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let definition = match extension(path).as_deref() {
        Some("json") => serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?,
        Some("yaml") | Some("yml") => serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?,
        _ => bail!("unsupported definition format: {}", path.display()),
    };
    Ok(definition)
}

/// Load every definition file in `dir`, sorted by file name
pub fn load_dir(dir: &Path) -> Result<Vec<LoadedDefinition>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("reading definitions directory {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file()
            && matches!(extension(&path).as_deref(), Some("json" | "yaml" | "yml"))
        {
            paths.push(path);
        }
    }
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let definition = load_file(&path)?;
            Ok(LoadedDefinition { path, definition })
        })
        .collect()
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_dir_mixed_formats() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("b.yaml"),
            "id: publish
operations:
  - id: continue
  - id: hold
    configuration:
      hold-url: http://localhost/hold
",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("a.json"),
            r#"{"id": "error", "operations": [{"id": "continue"}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let loaded = load_dir(dir.path()).expect("should load");
        let ids: Vec<_> = loaded.iter().map(|l| l.definition.id.as_str()).collect();
        assert_eq!(ids, vec!["error", "publish"]);
        assert_eq!(loaded[1].definition.operations.len(), 2);
        assert_eq!(
            loaded[1].definition.operations[1]
                .configuration
                .get("hold-url")
                .map(String::as_str),
            Some("http://localhost/hold")
        );
    }

    #[test]
    fn test_malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{").unwrap();

        let err = load_dir(dir.path()).err().expect("should fail");
        assert!(format!("{:#}", err).contains("bad.json"));
    }
}
