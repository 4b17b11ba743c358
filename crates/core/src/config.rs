//! # Engine Configuration
//!
//! `EngineConfig` is loaded once from an optional JSON file, overridden from
//! `BEADLOOM_*` environment variables, resolved against the model registry,
//! and then shared read-only behind an `Arc`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::engine::split::DEFAULT_MAX_SOURCE_CHARS;
use crate::models::{ModelConfig, ModelRegistry, ModelTier};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown model '{name}' (known aliases: {})", .known.join(", "))]
    UnknownModel { name: String, known: Vec<String> },

    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value '{value}' for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Cost and call-count ceilings for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailsConfig {
    pub enabled: bool,
    pub max_cost_per_run_usd: f64,
    pub warn_cost_threshold_usd: f64,
    pub max_sub_lm_calls: u64,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cost_per_run_usd: 50.0,
            warn_cost_threshold_usd: 30.0,
            max_sub_lm_calls: 500,
        }
    }
}

/// Configuration for the analysis engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Model driving the agent loop
    pub root_model: String,
    pub root_extended_thinking: bool,
    pub root_max_iterations: u32,
    /// Fan-out model for full analyses
    pub sub_lm_high_model: String,
    /// Fan-out model for cheap extraction
    pub sub_lm_low_model: String,
    /// Estimated token count at which work fans out instead of going direct
    pub threshold_tokens: usize,
    /// Source character budget per dispatched flow group
    pub max_source_chars_per_group: usize,
    pub max_concurrency: usize,
    pub max_output_tokens: u32,
    pub guardrails: GuardrailsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root_model: "anthropic/claude-opus-4-6".to_string(),
            root_extended_thinking: true,
            root_max_iterations: 30,
            sub_lm_high_model: "anthropic/claude-sonnet-4-6".to_string(),
            sub_lm_low_model: "anthropic/claude-haiku-4-5-20251001".to_string(),
            threshold_tokens: 50_000,
            max_source_chars_per_group: DEFAULT_MAX_SOURCE_CHARS,
            max_concurrency: 8,
            max_output_tokens: 4096,
            guardrails: GuardrailsConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from an optional JSON file, apply the process environment, and
    /// resolve model aliases.
    pub fn load(path: Option<&Path>, registry: &ModelRegistry) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config
            .with_env_overrides(|var| std::env::var(var).ok())?
            .resolve_models(registry)
    }

    /// Parse a JSON config file; absent fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `BEADLOOM_*` overrides read through `lookup`
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup("BEADLOOM_ROOT_LM_MODEL") {
            self.root_model = model;
        }
        if let Some(model) = lookup("BEADLOOM_SUB_LM_HIGH_MODEL") {
            self.sub_lm_high_model = model;
        }
        if let Some(model) = lookup("BEADLOOM_SUB_LM_LOW_MODEL") {
            self.sub_lm_low_model = model;
        }
        if let Some(value) = lookup("BEADLOOM_GUARDRAILS_ENABLED") {
            self.guardrails.enabled = !value.eq_ignore_ascii_case("false");
        }
        if let Some(value) = lookup("BEADLOOM_MAX_COST_USD") {
            self.guardrails.max_cost_per_run_usd =
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidEnv {
                        var: "BEADLOOM_MAX_COST_USD",
                        value: value.clone(),
                    })?;
        }
        if let Some(value) = lookup("BEADLOOM_MAX_CONCURRENCY") {
            self.max_concurrency = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv {
                    var: "BEADLOOM_MAX_CONCURRENCY",
                    value: value.clone(),
                })?;
        }
        Ok(self)
    }

    /// Replace model aliases with concrete ids
    pub fn resolve_models(mut self, registry: &ModelRegistry) -> Result<Self, ConfigError> {
        self.root_model = registry.resolve(&self.root_model)?;
        self.sub_lm_high_model = registry.resolve(&self.sub_lm_high_model)?;
        self.sub_lm_low_model = registry.resolve(&self.sub_lm_low_model)?;
        Ok(self)
    }

    /// Model settings for a fan-out call
    pub fn sub_model(&self, tier: ModelTier) -> ModelConfig {
        let model = match tier {
            ModelTier::High => &self.sub_lm_high_model,
            ModelTier::Low => &self.sub_lm_low_model,
        };
        ModelConfig::new(model.clone()).with_max_tokens(self.max_output_tokens)
    }

    /// Model settings for the agent loop
    pub fn root(&self) -> ModelConfig {
        ModelConfig::new(self.root_model.clone())
            .with_max_tokens(self.max_output_tokens)
            .with_extended_thinking(self.root_extended_thinking)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_source_chars_per_group, 500_000);
        assert_eq!(config.threshold_tokens, 50_000);
        assert!(config.guardrails.enabled);
        assert_eq!(config.guardrails.max_sub_lm_calls, 500);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_concurrency": 2, "guardrails": {{"max_cost_per_run_usd": 5.0}}}}"#
        )
        .unwrap();
        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.guardrails.max_cost_per_run_usd, 5.0);
        assert_eq!(config.guardrails.warn_cost_threshold_usd, 30.0);
        assert_eq!(config.max_output_tokens, 4096);
    }

    #[test]
    fn test_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            EngineConfig::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::default()
            .with_env_overrides(env(&[
                ("BEADLOOM_SUB_LM_HIGH_MODEL", "latest-opus"),
                ("BEADLOOM_GUARDRAILS_ENABLED", "FALSE"),
                ("BEADLOOM_MAX_COST_USD", "12.5"),
                ("BEADLOOM_MAX_CONCURRENCY", "3"),
            ]))
            .unwrap()
            .resolve_models(&ModelRegistry::default())
            .unwrap();
        assert_eq!(config.sub_lm_high_model, "anthropic/claude-opus-4-6");
        assert!(!config.guardrails.enabled);
        assert_eq!(config.guardrails.max_cost_per_run_usd, 12.5);
        assert_eq!(config.max_concurrency, 3);
    }

    #[test]
    fn test_bad_numeric_override() {
        let err = EngineConfig::default()
            .with_env_overrides(env(&[("BEADLOOM_MAX_CONCURRENCY", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("BEADLOOM_MAX_CONCURRENCY"));
    }

    #[test]
    fn test_unknown_model_rejected() {
        let config = EngineConfig {
            root_model: "gpt-4o".to_string(),
            ..EngineConfig::default()
        };
        assert!(config.resolve_models(&ModelRegistry::default()).is_err());
    }

    #[test]
    fn test_sub_model_tiers() {
        let config = EngineConfig::default();
        assert_eq!(config.sub_model(ModelTier::Low).model, config.sub_lm_low_model);
        assert!(config.root().extended_thinking);
    }
}
