//! # Structure Model
//!
//! The shape a structural extractor hands to the engine: namespaces,
//! their `:require` edges, and a few extraction facts.
//!
//! Everything here is immutable once extracted. The partitioner and
//! splitter only ever read it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Diplomat architecture layer of a namespace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Adapter,
    Controller,
    Logic,
    Model,
    Wire,
    #[default]
    Unclassified,
}

impl Layer {
    /// All classified layers, in Diplomat order
    pub const CLASSIFIED: [Layer; 5] = [
        Layer::Wire,
        Layer::Adapter,
        Layer::Controller,
        Layer::Logic,
        Layer::Model,
    ];

    /// Parse a path or namespace segment into a layer
    pub fn from_segment(segment: &str) -> Option<Layer> {
        match segment {
            "adapter" => Some(Layer::Adapter),
            "controller" => Some(Layer::Controller),
            "logic" => Some(Layer::Logic),
            "model" => Some(Layer::Model),
            "wire" => Some(Layer::Wire),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Adapter => "adapter",
            Layer::Controller => "controller",
            Layer::Logic => "logic",
            Layer::Model => "model",
            Layer::Wire => "wire",
            Layer::Unclassified => "unknown",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single unit of source: one `(ns ...)` form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    /// Dotted namespace name, unique within a project
    pub name: String,
    /// Source file the namespace was read from
    pub path: PathBuf,
    /// Required namespace names (outgoing dependency edges)
    #[serde(default)]
    pub requires: Vec<String>,
    /// Declared function names
    #[serde(default)]
    pub functions: Vec<String>,
    #[serde(default)]
    pub layer: Layer,
    /// Whether the source touches a known side-effecting system
    #[serde(default)]
    pub has_side_effects: bool,
    /// Free-form extractor metadata (protocols, multimethods, ...)
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Namespace {
    /// Create a bare namespace with no edges
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            requires: Vec::new(),
            functions: Vec::new(),
            layer: Layer::Unclassified,
            has_side_effects: false,
            metadata: BTreeMap::new(),
        }
    }

    /// Set the required namespaces
    pub fn with_requires<I, S>(mut self, requires: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = requires.into_iter().map(Into::into).collect();
        self
    }

    /// Set the layer
    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.layer = layer;
        self
    }

    /// Final dotted segment (`svc.logic.payment` -> `payment`)
    pub fn short_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }
}

/// Namespace name -> names it requires. Edges point from dependent to dependency.
pub type DependencyGraph = BTreeMap<String, Vec<String>>;

/// Complete structural extraction result for a project
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructureResult {
    pub namespaces: Vec<Namespace>,
    pub dependency_map: DependencyGraph,
    pub total_source_chars: usize,
    /// How the structure was obtained (e.g. `static_parse`)
    pub extraction_method: String,
}

impl StructureResult {
    /// Build a result from namespaces, deriving the dependency map from their requires
    pub fn from_namespaces(namespaces: Vec<Namespace>, extraction_method: &str) -> Self {
        let dependency_map = namespaces
            .iter()
            .map(|ns| (ns.name.clone(), ns.requires.clone()))
            .collect();
        Self {
            namespaces,
            dependency_map,
            total_source_chars: 0,
            extraction_method: extraction_method.to_string(),
        }
    }

    /// Look up a namespace by name
    pub fn namespace(&self, name: &str) -> Option<&Namespace> {
        self.namespaces.iter().find(|ns| ns.name == name)
    }

    /// Keep only the named namespaces, and only edges between them
    pub fn restrict_to(&self, names: &[String]) -> StructureResult {
        let namespaces: Vec<Namespace> = self
            .namespaces
            .iter()
            .filter(|ns| names.contains(&ns.name))
            .cloned()
            .collect();
        let dependency_map = self
            .dependency_map
            .iter()
            .filter(|(name, _)| names.contains(name))
            .map(|(name, deps)| (name.clone(), deps.clone()))
            .collect();
        StructureResult {
            namespaces,
            dependency_map,
            total_source_chars: self.total_source_chars,
            extraction_method: self.extraction_method.clone(),
        }
    }
}
