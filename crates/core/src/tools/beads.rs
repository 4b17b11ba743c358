//! # Beads Tool
//!
//! Wrapper around the `bd` command-line tool that persists the knowledge
//! graph. Every call is an argument vector, never a shell string, and every
//! identifier or tag is checked against a strict allow-list before it is
//! placed on a command line.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Default per-invocation timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const SAFE_TOKEN: &str = r"^[a-zA-Z0-9\-_]+$";

#[derive(Debug, Error)]
pub enum BeadsError {
    #[error("invalid bead identifier '{0}'")]
    InvalidId(String),

    #[error("invalid tag '{0}'")]
    InvalidTag(String),

    #[error("invalid bead title '{0}' (must be non-empty and not start with '-')")]
    InvalidTitle(String),

    #[error("unknown relation '{0}' (expected depends-on, relates-to or blocks)")]
    InvalidRelation(String),

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("'{command}' exited with status {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Link kinds the graph understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Relation {
    DependsOn,
    RelatesTo,
    Blocks,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::DependsOn => "depends-on",
            Relation::RelatesTo => "relates-to",
            Relation::Blocks => "blocks",
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Relation {
    type Err = BeadsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "depends-on" => Ok(Relation::DependsOn),
            "relates-to" => Ok(Relation::RelatesTo),
            "blocks" => Ok(Relation::Blocks),
            other => Err(BeadsError::InvalidRelation(other.to_string())),
        }
    }
}

/// The persistence operations the engine needs.
///
/// Methods returning `bool` report a tool-level refusal as `Ok(false)`;
/// `create`, `query` and `export` surface it as an error.
#[async_trait]
pub trait BeadStore: Send + Sync {
    /// Create a record and return its id
    async fn create(&self, title: &str, body: &str, tags: &[String]) -> Result<String, BeadsError>;

    async fn link(&self, from: &str, to: &str, relation: Relation) -> Result<bool, BeadsError>;

    /// Add tags; true only if every tag was applied
    async fn tag(&self, id: &str, tags: &[String]) -> Result<bool, BeadsError>;

    async fn comment(&self, id: &str, text: &str) -> Result<bool, BeadsError>;

    async fn close(&self, id: &str, reason: &str) -> Result<bool, BeadsError>;

    async fn query(&self, filter: &str) -> Result<String, BeadsError>;

    async fn export(&self) -> Result<String, BeadsError>;
}

fn safe_token() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(SAFE_TOKEN).ok()).as_ref()
}

fn is_safe(token: &str) -> bool {
    safe_token().is_some_and(|re| re.is_match(token))
}

pub fn validate_id(id: &str) -> Result<(), BeadsError> {
    if is_safe(id) {
        Ok(())
    } else {
        Err(BeadsError::InvalidId(id.to_string()))
    }
}

pub fn validate_tag(tag: &str) -> Result<(), BeadsError> {
    if is_safe(tag) {
        Ok(())
    } else {
        Err(BeadsError::InvalidTag(tag.to_string()))
    }
}

/// Titles are positional, so a leading `-` would be read as an option
pub fn validate_title(title: &str) -> Result<(), BeadsError> {
    let trimmed = title.trim();
    if trimmed.is_empty() || trimmed.starts_with('-') {
        Err(BeadsError::InvalidTitle(title.to_string()))
    } else {
        Ok(())
    }
}

/// `bd` invoked as a subprocess
#[derive(Debug, Clone)]
pub struct BeadsCli {
    program: String,
    db_path: Option<PathBuf>,
    timeout: Duration,
}

impl BeadsCli {
    /// Use `bd`, optionally pinned to a database file
    pub fn new(db_path: Option<PathBuf>) -> Self {
        Self {
            program: "bd".to_string(),
            db_path,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the tool can be launched at all
    pub async fn is_available(&self) -> bool {
        Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn base_args(&self) -> Vec<String> {
        match &self.db_path {
            Some(path) => vec![
                "--db".to_string(),
                path.display().to_string(),
                "--no-daemon".to_string(),
            ],
            None => Vec::new(),
        }
    }

    /// Run one invocation; stdout on success
    async fn run(&self, args: &[String]) -> Result<String, BeadsError> {
        let mut argv = self.base_args();
        argv.extend(args.iter().cloned());
        let command = format!("{} {}", self.program, args.first().map(String::as_str).unwrap_or(""));

        let child = Command::new(&self.program)
            .args(&argv)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(result) => result.map_err(|source| BeadsError::Spawn {
                program: self.program.clone(),
                source,
            })?,
            Err(_) => {
                return Err(BeadsError::Timeout {
                    command,
                    secs: self.timeout.as_secs(),
                })
            }
        };

        if !output.status.success() {
            return Err(BeadsError::Failed {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a call whose outcome is a flag
    async fn run_flag(&self, args: &[String]) -> Result<bool, BeadsError> {
        match self.run(args).await {
            Ok(_) => Ok(true),
            Err(BeadsError::Failed {
                command,
                code,
                stderr,
            }) => {
                tracing::warn!(command = %command, ?code, stderr = %stderr, "bd call refused");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Argument vector for `create`
pub fn create_args(title: &str, body: &str, tags: &[String]) -> Result<Vec<String>, BeadsError> {
    validate_title(title)?;
    for tag in tags {
        validate_tag(tag)?;
    }
    let mut args = vec![
        "create".to_string(),
        title.to_string(),
        "-d".to_string(),
        body.to_string(),
        "--silent".to_string(),
    ];
    if !tags.is_empty() {
        args.push("-l".to_string());
        args.push(tags.join(","));
    }
    Ok(args)
}

/// Argument vector for `dep add`. `blocks` reverses the direction.
pub fn link_args(from: &str, to: &str, relation: Relation) -> Result<Vec<String>, BeadsError> {
    validate_id(from)?;
    validate_id(to)?;
    let (a, b) = match relation {
        Relation::Blocks => (to, from),
        Relation::DependsOn | Relation::RelatesTo => (from, to),
    };
    Ok(vec![
        "dep".to_string(),
        "add".to_string(),
        a.to_string(),
        b.to_string(),
    ])
}

#[async_trait]
impl BeadStore for BeadsCli {
    async fn create(&self, title: &str, body: &str, tags: &[String]) -> Result<String, BeadsError> {
        let args = create_args(title, body, tags)?;
        let id = self.run(&args).await?.trim().to_string();
        validate_id(&id)?;
        tracing::debug!(id = %id, title = %title, "Created bead");
        Ok(id)
    }

    async fn link(&self, from: &str, to: &str, relation: Relation) -> Result<bool, BeadsError> {
        let args = link_args(from, to, relation)?;
        self.run_flag(&args).await
    }

    async fn tag(&self, id: &str, tags: &[String]) -> Result<bool, BeadsError> {
        validate_id(id)?;
        for tag in tags {
            validate_tag(tag)?;
        }
        let mut all_applied = true;
        for tag in tags {
            let args = vec![
                "label".to_string(),
                "add".to_string(),
                id.to_string(),
                tag.clone(),
            ];
            all_applied &= self.run_flag(&args).await?;
        }
        Ok(all_applied)
    }

    async fn comment(&self, id: &str, text: &str) -> Result<bool, BeadsError> {
        validate_id(id)?;
        let args = vec![
            "comments".to_string(),
            "add".to_string(),
            id.to_string(),
            text.to_string(),
        ];
        self.run_flag(&args).await
    }

    async fn close(&self, id: &str, reason: &str) -> Result<bool, BeadsError> {
        validate_id(id)?;
        let args = vec![
            "close".to_string(),
            id.to_string(),
            "-r".to_string(),
            reason.to_string(),
        ];
        self.run_flag(&args).await
    }

    async fn query(&self, filter: &str) -> Result<String, BeadsError> {
        self.run(&["query".to_string(), "--filter".to_string(), filter.to_string()])
            .await
    }

    async fn export(&self) -> Result<String, BeadsError> {
        self.run(&["export".to_string()]).await
    }
}
