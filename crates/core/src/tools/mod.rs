//! # External Tools
//!
//! Deterministic wrappers around what the engine reads from and writes to
//! outside itself.
//!
//! ## Modules
//!
//! - `scanner` - Static Clojure structural extractor
//! - `git` - HEAD commit and changed-file queries
//! - `beads` - `bd` persistence tool wrapper (argument vectors only)

pub mod beads;
pub mod git;
pub mod scanner;

pub use beads::{BeadStore, BeadsCli, BeadsError, Relation};
pub use git::{GitError, GitRepo};
pub use scanner::{ClojureStaticBackend, LanguageBackend, StructureError};
