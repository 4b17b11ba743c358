//! # Analysis Metadata
//!
//! Per-project record of the last completed analysis, kept under the output
//! directory (never inside the analyzed project):
//!
//! ```text
//! <output_dir>/projects/<project>/analysis_metadata.json
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

pub const METADATA_FILE: &str = "analysis_metadata.json";

/// Get the default output directory (.beadloom)
pub fn default_output_dir() -> PathBuf {
    if let Ok(path) = std::env::var("BEADLOOM_OUTPUT_DIR") {
        return PathBuf::from(path);
    }

    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".beadloom")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisMetadata {
    /// HEAD commit the analysis ran against
    pub commit_sha: String,
    /// Structural extractor that produced the namespace graph
    pub backend: String,
    #[serde(default = "Utc::now")]
    pub analyzed_at: DateTime<Utc>,
}

impl AnalysisMetadata {
    pub fn new(commit_sha: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            commit_sha: commit_sha.into(),
            backend: backend.into(),
            analyzed_at: Utc::now(),
        }
    }
}

pub fn metadata_path(output_dir: &Path, project_name: &str) -> PathBuf {
    output_dir
        .join("projects")
        .join(project_name)
        .join(METADATA_FILE)
}

/// Read the record; `Ok(None)` when none was written yet
pub async fn load_metadata(path: &Path) -> Result<Option<AnalysisMetadata>> {
    if fs::metadata(path).await.is_err() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read metadata: {:?}", path))?;
    let metadata = serde_json::from_str(&content)
        .with_context(|| format!("Invalid metadata JSON: {:?}", path))?;
    Ok(Some(metadata))
}

/// Write the record as pretty JSON, creating parent directories
pub async fn save_metadata(path: &Path, metadata: &AnalysisMetadata) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }
    let json = serde_json::to_string_pretty(metadata)?;
    fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write metadata: {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_metadata_path_layout() {
        let path = metadata_path(Path::new("/out"), "orders-svc");
        assert_eq!(
            path,
            PathBuf::from("/out/projects/orders-svc/analysis_metadata.json")
        );
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = metadata_path(dir.path(), "svc");
        assert_eq!(load_metadata(&path).await.unwrap(), None);

        let meta = AnalysisMetadata::new("abc123", "clojure-static");
        save_metadata(&path, &meta).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\n  \"commit_sha\": \"abc123\""));
        assert_eq!(load_metadata(&path).await.unwrap(), Some(meta));
    }

    #[tokio::test]
    async fn test_missing_timestamp_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(METADATA_FILE);
        std::fs::write(&path, r#"{"commit_sha": "abc", "backend": "clojure-static"}"#).unwrap();
        let meta = load_metadata(&path).await.unwrap().unwrap();
        assert_eq!(meta.commit_sha, "abc");
    }

    #[tokio::test]
    async fn test_corrupt_metadata_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(METADATA_FILE);
        std::fs::write(&path, "not json").unwrap();
        assert!(load_metadata(&path).await.is_err());
    }
}
