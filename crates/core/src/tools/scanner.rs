//! # Scanner - Structural Extractor
//!
//! Builds a [`StructureResult`] for a Clojure project by static parsing:
//! the `(ns ...)` form gives the name and requires, `defn`/`defmethod`
//! forms give functions, and the path gives the Diplomat layer.
//!
//! Extraction is fast and free: no model calls, no running REPL.

use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

use crate::structure::{Layer, Namespace, StructureResult};

pub const CLOJURE_EXTENSIONS: [&str; 2] = ["clj", "cljc"];

/// Build and tooling directories never scanned
const EXCLUDED_DIRS: [&str; 9] = [
    "target",
    ".git",
    "node_modules",
    ".cpcache",
    ".clj-kondo",
    ".lsp",
    ".shadow-cljs",
    "classes",
    "out",
];

/// Lower-case source substrings that mark a namespace as side-effecting
const SIDE_EFFECT_MARKERS: [&str; 15] = [
    "datomic",
    "kafka",
    "http-client",
    "http-kit",
    "http.client",
    "s3",
    "redis",
    "sqs",
    "sns",
    "dynamodb",
    "jdbc",
    "db",
    "mongo",
    "elasticsearch",
    "grpc",
];

const SYMBOL: &str = r"[\w.*+!\-'?<>=/]+";

#[derive(Debug, Error)]
pub enum StructureError {
    #[error("project directory does not exist: {0:?}")]
    MissingRoot(PathBuf),

    #[error("no Clojure source files (.clj, .cljc) found in {0:?}")]
    NoSourceFiles(PathBuf),

    #[error("found {files} Clojure files but none contained an (ns ...) form in {root:?}")]
    NoNamespaces { files: usize, root: PathBuf },
}

/// Language-specific structural extraction
pub trait LanguageBackend: Send + Sync {
    /// Backend name recorded in analysis metadata
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    fn extract_structure(&self, root: &Path) -> Result<StructureResult, StructureError>;
}

/// Regex-based Clojure extractor
#[derive(Debug, Clone, Default)]
pub struct ClojureStaticBackend;

impl ClojureStaticBackend {
    pub fn new() -> Self {
        Self
    }
}

impl LanguageBackend for ClojureStaticBackend {
    fn name(&self) -> &str {
        "clojure-static"
    }

    fn is_available(&self) -> bool {
        patterns().is_some()
    }

    fn extract_structure(&self, root: &Path) -> Result<StructureResult, StructureError> {
        if !root.is_dir() {
            return Err(StructureError::MissingRoot(root.to_path_buf()));
        }
        let files = find_clojure_files(root);
        if files.is_empty() {
            return Err(StructureError::NoSourceFiles(root.to_path_buf()));
        }

        let mut namespaces: Vec<Namespace> = Vec::new();
        let mut seen = BTreeSet::new();
        let mut total_chars = 0;

        for path in &files {
            let source = match std::fs::read_to_string(path) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(path = ?path, error = %e, "Skipping unreadable file");
                    continue;
                }
            };
            total_chars += source.chars().count();

            let Some(ns) = parse_namespace(path, &source) else {
                continue;
            };
            // files are sorted, so the first occurrence has the smallest path
            if !seen.insert(ns.name.clone()) {
                tracing::warn!(namespace = %ns.name, path = ?path, "Duplicate namespace ignored");
                continue;
            }
            namespaces.push(ns);
        }

        if namespaces.is_empty() {
            return Err(StructureError::NoNamespaces {
                files: files.len(),
                root: root.to_path_buf(),
            });
        }

        tracing::info!(
            files = files.len(),
            namespaces = namespaces.len(),
            total_chars,
            "Extracted project structure"
        );
        let mut result = StructureResult::from_namespaces(namespaces, "static_parse");
        result.total_source_chars = total_chars;
        Ok(result)
    }
}

/// Every `.clj`/`.cljc` file under `root`, sorted by path
pub fn find_clojure_files(root: &Path) -> Vec<PathBuf> {
    let walker = ignore::WalkBuilder::new(root)
        .standard_filters(false)
        .filter_entry(|entry| {
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            !(is_dir && entry.depth() > 0 && EXCLUDED_DIRS.iter().any(|d| entry.file_name() == *d))
        })
        .build();

    let mut files: Vec<PathBuf> = walker
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(error = %e, "Walk error");
                None
            }
        })
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
        .map(|entry| entry.into_path())
        .filter(|path| is_clojure_file(path))
        .collect();
    files.sort();
    files
}

pub fn is_clojure_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| CLOJURE_EXTENSIONS.contains(&ext))
}

struct Patterns {
    ns_form: Regex,
    require_block: Regex,
    bracketed: Regex,
    bare: Regex,
    defn: Regex,
    defmethod: Regex,
    defprotocol: Regex,
    defmulti: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                ns_form: Regex::new(&format!(r"\(ns\s+({})", SYMBOL)).ok()?,
                require_block: Regex::new(r"(?s)\(:require\s+(.*?)\)").ok()?,
                bracketed: Regex::new(&format!(r"\[\s*({})", SYMBOL)).ok()?,
                bare: Regex::new(r"\b(\w+(?:\.[\w.*+!\-'?<>=]+)+)\b").ok()?,
                defn: Regex::new(&format!(r"\(defn-?\s+({})", SYMBOL)).ok()?,
                defmethod: Regex::new(&format!(
                    r"\(defmethod\s+({})\s+([\w.:*+!\-'?<>=/]+|\[.*?\])",
                    SYMBOL
                ))
                .ok()?,
                defprotocol: Regex::new(&format!(r"\(defprotocol\s+({})", SYMBOL)).ok()?,
                defmulti: Regex::new(&format!(r"\(defmulti\s+({})", SYMBOL)).ok()?,
            })
        })
        .as_ref()
}

/// Parse one file; `None` when it has no `(ns ...)` form
pub fn parse_namespace(path: &Path, source: &str) -> Option<Namespace> {
    let p = patterns()?;
    let name = p.ns_form.captures(source)?.get(1)?.as_str().to_string();

    let requires = parse_requires(p, ns_region(source));
    let layer = classify_layer(&name, path);

    let mut ns = Namespace::new(name, path)
        .with_requires(requires)
        .with_layer(layer);
    ns.functions = extract_functions(p, source);
    ns.has_side_effects = has_side_effects(source);
    ns.metadata = extract_metadata(p, source);
    Some(ns)
}

/// The balanced `(ns ...)` form, or the rest of the file if unbalanced
fn ns_region(source: &str) -> &str {
    let Some(start) = source.find("(ns ").or_else(|| source.find("(ns\n")) else {
        return "";
    };
    let mut depth = 0usize;
    for (offset, ch) in source[start..].char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return &source[start..start + offset + 1];
                }
            }
            _ => {}
        }
    }
    &source[start..]
}

fn parse_requires(p: &Patterns, region: &str) -> Vec<String> {
    let Some(body) = p.require_block.captures(region).and_then(|c| c.get(1)) else {
        return Vec::new();
    };
    let body = body.as_str();

    let mut requires = BTreeSet::new();
    for cap in p.bracketed.captures_iter(body) {
        let (Some(whole), Some(m)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        // only libspecs; skip vectors nested inside them (:refer [...])
        if bracket_depth(&body[..whole.start()]) > 0 || m.as_str().starts_with(':') {
            continue;
        }
        requires.insert(m.as_str().to_string());
    }
    for cap in p.bare.captures_iter(body) {
        if let Some(m) = cap.get(1) {
            requires.insert(m.as_str().to_string());
        }
    }
    requires.into_iter().collect()
}

fn bracket_depth(text: &str) -> usize {
    text.chars().fold(0usize, |depth, ch| match ch {
        '[' => depth + 1,
        ']' => depth.saturating_sub(1),
        _ => depth,
    })
}

/// First namespace segment naming a layer, else the first path component
pub fn classify_layer(name: &str, path: &Path) -> Layer {
    name.split('.')
        .find_map(Layer::from_segment)
        .or_else(|| {
            path.components()
                .filter_map(|c| c.as_os_str().to_str())
                .find_map(Layer::from_segment)
        })
        .unwrap_or_default()
}

fn has_side_effects(source: &str) -> bool {
    let lower = source.to_lowercase();
    SIDE_EFFECT_MARKERS.iter().any(|m| lower.contains(m))
}

fn extract_functions(p: &Patterns, source: &str) -> Vec<String> {
    let mut functions: Vec<String> = p
        .defn
        .captures_iter(source)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect();
    functions.extend(p.defmethod.captures_iter(source).filter_map(|c| {
        Some(format!("{} {}", c.get(1)?.as_str(), c.get(2)?.as_str().trim()))
    }));
    functions
}

fn extract_metadata(p: &Patterns, source: &str) -> BTreeMap<String, Value> {
    let names = |re: &Regex| -> Vec<Value> {
        re.captures_iter(source)
            .filter_map(|c| c.get(1).map(|m| Value::String(m.as_str().to_string())))
            .collect()
    };
    let mut metadata = BTreeMap::new();
    let protocols = names(&p.defprotocol);
    if !protocols.is_empty() {
        metadata.insert("protocols".to_string(), Value::Array(protocols));
    }
    let multimethods = names(&p.defmulti);
    if !multimethods.is_empty() {
        metadata.insert("multimethods".to_string(), Value::Array(multimethods));
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CONTROLLER: &str = r#"(ns svc.controller.orders
  (:require [svc.logic.orders :as logic]
            [svc.adapter.orders :refer [->wire]]
            clojure.string))

(defn place-order! [order datomic]
  (d/transact datomic (logic/build order)))

(defn- helper [x] x)

(defmulti handle :type)
(defmethod handle :created [evt] evt)
"#;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_parse_namespace_form() {
        let ns = parse_namespace(Path::new("src/svc/controller/orders.clj"), CONTROLLER).unwrap();
        assert_eq!(ns.name, "svc.controller.orders");
        assert_eq!(
            ns.requires,
            vec!["clojure.string", "svc.adapter.orders", "svc.logic.orders"]
        );
        assert_eq!(ns.layer, Layer::Controller);
        assert!(ns.has_side_effects);
        assert_eq!(ns.functions, vec!["place-order!", "helper", "handle :created"]);
        assert_eq!(ns.metadata["multimethods"], serde_json::json!(["handle"]));
        assert!(!ns.metadata.contains_key("protocols"));
    }

    #[test]
    fn test_no_ns_form() {
        assert!(parse_namespace(Path::new("user.clj"), "(println \"hi\")").is_none());
    }

    #[test]
    fn test_layer_from_path_fallback() {
        assert_eq!(
            classify_layer("svc.orders", Path::new("src/wire/svc/orders.clj")),
            Layer::Wire
        );
        assert_eq!(
            classify_layer("svc.orders", Path::new("src/svc/orders.clj")),
            Layer::Unclassified
        );
    }

    #[test]
    fn test_extract_structure() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "src/svc/controller/orders.clj", CONTROLLER);
        write(
            dir.path(),
            "src/svc/logic/orders.clj",
            "(ns svc.logic.orders)\n(defn build [o] o)\n",
        );
        write(dir.path(), "target/classes/svc/stale.clj", "(ns svc.stale)");
        write(dir.path(), "dev/user.clj", "(println :no-ns)");
        write(dir.path(), "README.md", "(ns not.clojure)");

        let result = ClojureStaticBackend::new().extract_structure(dir.path()).unwrap();

        let names: Vec<_> = result.namespaces.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["svc.controller.orders", "svc.logic.orders"]);
        assert_eq!(result.extraction_method, "static_parse");
        assert_eq!(result.dependency_map["svc.logic.orders"], Vec::<String>::new());
        assert!(result.total_source_chars > CONTROLLER.len());
        assert!(!result.namespaces[1].has_side_effects);
    }

    #[test]
    fn test_structure_errors() {
        let dir = TempDir::new().unwrap();
        let backend = ClojureStaticBackend::new();
        assert!(matches!(
            backend.extract_structure(&dir.path().join("missing")),
            Err(StructureError::MissingRoot(_))
        ));
        assert!(matches!(
            backend.extract_structure(dir.path()),
            Err(StructureError::NoSourceFiles(_))
        ));
        write(dir.path(), "a.clj", "(println 1)");
        assert!(matches!(
            backend.extract_structure(dir.path()),
            Err(StructureError::NoNamespaces { files: 1, .. })
        ));
    }

    #[test]
    fn test_duplicate_namespace_keeps_smallest_path() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a/x.clj", "(ns dup.core)");
        write(dir.path(), "b/x.clj", "(ns dup.core (:require [other.ns]))");
        let result = ClojureStaticBackend::new().extract_structure(dir.path()).unwrap();
        assert_eq!(result.namespaces.len(), 1);
        assert!(result.namespaces[0].path.ends_with("a/x.clj"));
    }
}
