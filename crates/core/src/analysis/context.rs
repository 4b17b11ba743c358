//! Codebase context: the extracted structure of a project plus the source
//! text of every namespace, keyed by namespace name.

use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::engine::SourceMap;
use crate::structure::StructureResult;
use crate::tools::scanner::{LanguageBackend, StructureError};

/// Everything a run needs to know about the analyzed project
#[derive(Debug, Clone, Serialize)]
pub struct CodebaseContext {
    /// Directory name of the project
    pub project_name: String,
    /// Absolute project root
    pub project_dir: PathBuf,
    pub structure: StructureResult,
    /// Compact JSON view for prompts and reports
    pub structure_summary: Value,
}

impl CodebaseContext {
    /// Extract the project's structure with `backend`
    pub fn load(project_dir: &Path, backend: &dyn LanguageBackend) -> Result<Self, StructureError> {
        let project_dir = std::fs::canonicalize(project_dir)
            .map_err(|_| StructureError::MissingRoot(project_dir.to_path_buf()))?;
        let structure = backend.extract_structure(&project_dir)?;
        let structure_summary = structure_summary(&structure, &project_dir);
        let project_name = project_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());

        Ok(Self {
            project_name,
            project_dir,
            structure,
            structure_summary,
        })
    }

    /// Same context over a subset of namespaces
    pub fn restrict_to(&self, names: &[String]) -> Self {
        let structure = self.structure.restrict_to(names);
        let mut structure_summary = structure_summary(&structure, &self.project_dir);
        structure_summary["incremental"] = json!(true);
        structure_summary["changed_namespaces"] = json!(names);
        Self {
            project_name: self.project_name.clone(),
            project_dir: self.project_dir.clone(),
            structure,
            structure_summary,
        }
    }

    pub fn relative_path<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.project_dir).unwrap_or(path)
    }

    pub async fn load_sources(&self) -> SourceMap {
        load_sources(&self.structure).await
    }
}

/// Read every namespace's file. Unreadable files are left out.
pub async fn load_sources(structure: &StructureResult) -> SourceMap {
    let mut sources = SourceMap::new();
    for ns in &structure.namespaces {
        match fs::read_to_string(&ns.path).await {
            Ok(text) => {
                sources.insert(ns.name.clone(), text);
            }
            Err(e) => {
                tracing::warn!(namespace = %ns.name, path = ?ns.path, error = %e, "Source not loaded");
            }
        }
    }
    sources
}

pub fn structure_summary(structure: &StructureResult, project_dir: &Path) -> Value {
    let namespaces: Vec<Value> = structure
        .namespaces
        .iter()
        .map(|ns| {
            let path = ns.path.strip_prefix(project_dir).unwrap_or(&ns.path);
            let mut entry = json!({
                "name": ns.name,
                "path": path.display().to_string(),
                "layer": ns.layer,
                "requires": ns.requires,
                "functions": ns.functions,
                "has_side_effects": ns.has_side_effects,
            });
            if !ns.metadata.is_empty() {
                entry["metadata"] = json!(ns.metadata);
            }
            entry
        })
        .collect();

    json!({
        "namespace_count": namespaces.len(),
        "total_source_chars": structure.total_source_chars,
        "extraction_method": structure.extraction_method,
        "dependency_map": structure.dependency_map,
        "namespaces": namespaces,
    })
}
