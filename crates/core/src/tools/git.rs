//! # Git Queries
//!
//! Read-only version-control lookups used for staleness detection: the
//! current HEAD commit, and the files changed between two commits. The
//! analyzed repository is never modified.

use git2::{DiffOptions, Repository};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Timeout for each async query
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to open repository at {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },

    #[error("cannot resolve revision '{rev}': {source}")]
    Revision {
        rev: String,
        #[source]
        source: git2::Error,
    },

    #[error("diff failed: {0}")]
    Diff(#[source] git2::Error),

    #[error("git query timed out after {0}s")]
    Timeout(u64),

    #[error("git query task failed: {0}")]
    Join(String),
}

fn open(root: &Path) -> Result<Repository, GitError> {
    Repository::open(root).map_err(|source| GitError::Open {
        path: root.to_path_buf(),
        source,
    })
}

/// Full SHA of the commit HEAD points at
pub fn current_sha(root: &Path) -> Result<String, GitError> {
    let repo = open(root)?;
    let commit = repo
        .head()
        .and_then(|head| head.peel_to_commit())
        .map_err(|source| GitError::Revision {
            rev: "HEAD".to_string(),
            source,
        })?;
    Ok(commit.id().to_string())
}

/// Repository-relative paths changed between two revisions, sorted.
/// Renames report both sides.
pub fn changed_files(root: &Path, from: &str, to: &str) -> Result<Vec<PathBuf>, GitError> {
    let repo = open(root)?;
    let tree_of = |rev: &str| {
        repo.revparse_single(rev)
            .and_then(|obj| obj.peel_to_tree())
            .map_err(|source| GitError::Revision {
                rev: rev.to_string(),
                source,
            })
    };
    let old_tree = tree_of(from)?;
    let new_tree = tree_of(to)?;

    let mut opts = DiffOptions::new();
    let diff = repo
        .diff_tree_to_tree(Some(&old_tree), Some(&new_tree), Some(&mut opts))
        .map_err(GitError::Diff)?;

    let mut paths = BTreeSet::new();
    for delta in diff.deltas() {
        for file in [delta.old_file(), delta.new_file()] {
            if let Some(path) = file.path() {
                paths.insert(path.to_path_buf());
            }
        }
    }
    Ok(paths.into_iter().collect())
}

/// Async view over a repository, each query bounded by a timeout
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
    timeout: Duration,
}

impl GitRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the root is a git repository at all
    pub fn is_repository(&self) -> bool {
        Repository::open(&self.root).is_ok()
    }

    pub async fn current_sha(&self) -> Result<String, GitError> {
        let root = self.root.clone();
        self.blocking(move || current_sha(&root)).await
    }

    pub async fn changed_files(&self, from: &str, to: &str) -> Result<Vec<PathBuf>, GitError> {
        let root = self.root.clone();
        let (from, to) = (from.to_string(), to.to_string());
        self.blocking(move || changed_files(&root, &from, &to)).await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, GitError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, GitError> + Send + 'static,
    {
        match tokio::time::timeout(self.timeout, tokio::task::spawn_blocking(f)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(GitError::Join(e.to_string())),
            Err(_) => Err(GitError::Timeout(self.timeout.as_secs())),
        }
    }
}
