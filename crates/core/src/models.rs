//! # Beadloom Models
//!
//! Model identifiers, alias resolution and pricing. Both tables are plain
//! values built at startup and handed to the components that need them
//! (config resolution, cost tracking).
//!
//! ## Example
//! ```rust,ignore
//! use beadloom_core::models::{ModelRegistry, PriceTable};
//!
//! let registry = ModelRegistry::default();
//! let id = registry.resolve("latest-sonnet")?;
//! let price = PriceTable::default().price_for(&id);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::ConfigError;

/// Prefix used by LiteLLM-style routers for Anthropic models
pub const ANTHROPIC_PREFIX: &str = "anthropic/";

/// Sub-model tier used for fan-out calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// Deeper analysis, higher cost
    #[default]
    High,
    /// Cheap extraction work
    Low,
}

impl ModelTier {
    pub fn parse(value: &str) -> Option<ModelTier> {
        match value.to_ascii_lowercase().as_str() {
            "high" => Some(ModelTier::High),
            "low" => Some(ModelTier::Low),
            _ => None,
        }
    }
}

/// USD per million tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPrice {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// Cost of one call
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        input_tokens as f64 * self.input_per_million / 1_000_000.0
            + output_tokens as f64 * self.output_per_million / 1_000_000.0
    }
}

/// Per-model price table.
///
/// Lookups ignore the `anthropic/` prefix. Unknown models are priced at the
/// most expensive known tier so estimates only ever err high.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTable {
    prices: BTreeMap<String, ModelPrice>,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::new()
            .with_price("claude-opus-4-6", ModelPrice::new(15.0, 75.0))
            .with_price("claude-sonnet-4-6", ModelPrice::new(3.0, 15.0))
            .with_price("claude-haiku-4-5-20251001", ModelPrice::new(1.0, 5.0))
    }
}

impl PriceTable {
    /// Empty table; every lookup gets the fallback price
    pub fn new() -> Self {
        Self {
            prices: BTreeMap::new(),
        }
    }

    pub fn with_price(mut self, model: &str, price: ModelPrice) -> Self {
        self.prices.insert(strip_provider(model).to_string(), price);
        self
    }

    pub fn price_for(&self, model: &str) -> ModelPrice {
        self.prices
            .get(strip_provider(model))
            .copied()
            .unwrap_or_else(|| self.most_expensive())
    }

    pub fn is_known(&self, model: &str) -> bool {
        self.prices.contains_key(strip_provider(model))
    }

    fn most_expensive(&self) -> ModelPrice {
        self.prices
            .values()
            .copied()
            .max_by(|a, b| {
                (a.input_per_million + a.output_per_million)
                    .total_cmp(&(b.input_per_million + b.output_per_million))
            })
            // Opus-tier pricing when the table is empty
            .unwrap_or(ModelPrice::new(15.0, 75.0))
    }
}

/// Alias -> concrete model id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRegistry {
    aliases: BTreeMap<String, String>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
            .with_alias("latest-opus", "anthropic/claude-opus-4-6")
            .with_alias("latest-sonnet", "anthropic/claude-sonnet-4-6")
            .with_alias("latest-haiku", "anthropic/claude-haiku-4-5-20251001")
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            aliases: BTreeMap::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>, model: impl Into<String>) -> Self {
        self.aliases.insert(alias.into(), model.into());
        self
    }

    /// Resolve an alias or pass a concrete id through.
    ///
    /// Concrete ids start with `claude-` or `anthropic/`; anything else must
    /// be a registered alias.
    pub fn resolve(&self, name: &str) -> Result<String, ConfigError> {
        if let Some(model) = self.aliases.get(name) {
            return Ok(model.clone());
        }
        if name.starts_with("claude-") || name.starts_with(ANTHROPIC_PREFIX) {
            return Ok(name.to_string());
        }
        Err(ConfigError::UnknownModel {
            name: name.to_string(),
            known: self.aliases.keys().cloned().collect(),
        })
    }
}

/// Model selection for one kind of call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// Concrete model id (e.g. "anthropic/claude-sonnet-4-6")
    pub model: String,
    /// Output token budget per call
    pub max_tokens: u32,
    /// Request extended thinking where the API supports it
    #[serde(default)]
    pub extended_thinking: bool,
}

impl ModelConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: 4096,
            extended_thinking: false,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_extended_thinking(mut self, enabled: bool) -> Self {
        self.extended_thinking = enabled;
        self
    }
}

/// Drop a router prefix (`anthropic/claude-x` -> `claude-x`)
pub fn strip_provider(model: &str) -> &str {
    model.strip_prefix(ANTHROPIC_PREFIX).unwrap_or(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_resolution() {
        let registry = ModelRegistry::default();
        assert_eq!(
            registry.resolve("latest-sonnet").unwrap(),
            "anthropic/claude-sonnet-4-6"
        );
        assert_eq!(
            registry.resolve("claude-3-haiku-20240307").unwrap(),
            "claude-3-haiku-20240307"
        );
        assert!(matches!(
            registry.resolve("gpt-4o"),
            Err(ConfigError::UnknownModel { .. })
        ));
    }

    #[test]
    fn test_price_lookup_ignores_prefix() {
        let table = PriceTable::default();
        let direct = table.price_for("claude-haiku-4-5-20251001");
        let routed = table.price_for("anthropic/claude-haiku-4-5-20251001");
        assert_eq!(direct, routed);
        assert_eq!(direct.input_per_million, 1.0);
    }

    #[test]
    fn test_unknown_model_uses_most_expensive() {
        let table = PriceTable::default();
        assert!(!table.is_known("mystery-model"));
        assert_eq!(table.price_for("mystery-model"), ModelPrice::new(15.0, 75.0));
    }

    #[test]
    fn test_price_cost() {
        let price = ModelPrice::new(3.0, 15.0);
        let cost = price.cost(1_000_000, 100_000);
        assert!((cost - 4.5).abs() < 1e-9);
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!(ModelTier::parse("LOW"), Some(ModelTier::Low));
        assert_eq!(ModelTier::parse("medium"), None);
    }
}
