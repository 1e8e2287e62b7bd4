//! On-device model context window registry.
//!
//! Provides known context window sizes for common on-device models, with
//! fallback to user-configurable limits loaded from a file.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::budget::types::TokenBudget;

/// Known context window sizes for models an on-device runtime typically
/// ships. Users can override these via the configuration file.
pub const KNOWN_MODEL_LIMITS: &[(&str, u32)] = &[
    ("gemma-2b-it", 8_192),
    ("gemma-3n", 32_768),
    ("phi-3-mini", 131_072),
    ("phi-3.5-mini", 131_072),
    ("llama-3.2-1b", 131_072),
    ("llama-3.2-3b", 131_072),
    ("qwen2.5-1.5b", 32_768),
    ("smollm2-1.7b", 8_192),
    // Default fallback
    ("default", 8_192),
];

/// Model limit configuration (user-overridable).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelLimit {
    /// Model identifier (partial match supported, e.g., "gemma" matches
    /// "gemma-2b-it")
    pub model_pattern: String,
    /// Session token budget for this model
    pub max_tokens: u32,
}

impl ModelLimit {
    pub fn new(model_pattern: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            model_pattern: model_pattern.into(),
            max_tokens,
        }
    }
}

/// Registry for model limits with built-in defaults and user overrides.
#[derive(Debug, Clone, Default)]
pub struct ModelLimitsRegistry {
    /// User-provided overrides (higher priority than built-in)
    user_limits: HashMap<String, ModelLimit>,
    /// Path for the user configuration file
    config_path: Option<PathBuf>,
}

impl ModelLimitsRegistry {
    /// Create a new registry with built-in defaults only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with a specific config file path.
    pub fn with_config_path(path: impl Into<PathBuf>) -> Self {
        Self {
            user_limits: HashMap::new(),
            config_path: Some(path.into()),
        }
    }

    /// Load user overrides from the configuration path.
    ///
    /// Default path: `~/.lmkit/model_limits.json`. A missing file is not an
    /// error.
    pub async fn load_user_config(&mut self) -> std::io::Result<()> {
        let path = self
            .config_path
            .clone()
            .unwrap_or_else(default_config_path);

        if !path.exists() {
            return Ok(());
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let limits: Vec<ModelLimit> = serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

        for limit in limits {
            self.user_limits.insert(limit.model_pattern.clone(), limit);
        }

        tracing::info!(
            "Loaded {} user model limits from {:?}",
            self.user_limits.len(),
            path
        );
        Ok(())
    }

    /// Save current user limits to the configuration file.
    pub async fn save_user_config(&self) -> std::io::Result<()> {
        let path = self
            .config_path
            .clone()
            .unwrap_or_else(default_config_path);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let limits: Vec<&ModelLimit> = self.user_limits.values().collect();
        let content = serde_json::to_string_pretty(&limits)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        tokio::fs::write(&path, content).await?;

        Ok(())
    }

    /// Add a user limit override.
    pub fn add_limit(&mut self, limit: ModelLimit) {
        self.user_limits.insert(limit.model_pattern.clone(), limit);
    }

    /// Get limit for a model, with user overrides taking priority.
    ///
    /// # Matching Strategy
    /// 1. Exact match (highest priority)
    /// 2. Partial match in either direction (e.g. "llama-3.2-1b-instruct"
    ///    contains "llama-3.2-1b"), longest pattern wins
    pub fn get(&self, model: &str) -> Option<ModelLimit> {
        if let Some(limit) = self.user_limits.get(model) {
            return Some(limit.clone());
        }

        for (pattern, tokens) in KNOWN_MODEL_LIMITS {
            if *pattern == model {
                return Some(ModelLimit::new(model.to_string(), *tokens));
            }
        }

        let best_user_match = self
            .user_limits
            .iter()
            .filter(|(pattern, _)| model.contains(*pattern) || pattern.contains(model))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(_, limit)| limit.clone());

        if let Some(limit) = best_user_match {
            return Some(limit);
        }

        KNOWN_MODEL_LIMITS
            .iter()
            .filter(|(pattern, _)| model.contains(*pattern) || pattern.contains(model))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(pattern, tokens)| ModelLimit::new(pattern.to_string(), *tokens))
    }

    /// Get limit for a model with fallback to the default entry.
    pub fn get_or_default(&self, model: &str) -> ModelLimit {
        self.get(model).unwrap_or_else(|| {
            let default = KNOWN_MODEL_LIMITS
                .iter()
                .find(|(k, _)| *k == "default")
                .map(|(_, v)| *v)
                .unwrap_or(8_192);
            ModelLimit::new("default", default)
        })
    }

    /// Resolve a session token budget for a model.
    pub fn budget_for_model(&self, model: &str) -> TokenBudget {
        TokenBudget::new(self.get_or_default(model).max_tokens)
    }

    /// List all user-defined limits.
    pub fn list_user_limits(&self) -> Vec<&ModelLimit> {
        self.user_limits.values().collect()
    }
}

/// Default configuration file path: `~/.lmkit/model_limits.json`.
pub fn default_config_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".lmkit").join("model_limits.json")
}
