//! Model catalog entries reported by providers.

use serde::{Deserialize, Serialize};

/// A model a provider can serve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Provider-native identifier (e.g. "anthropic/claude-sonnet-4").
    pub id: String,
    /// Adapter that serves the model.
    pub provider: String,
    /// Human-readable name, if the provider gives one.
    pub name: Option<String>,
    pub description: Option<String>,
    /// Maximum context window in tokens (if known).
    pub context_length: Option<u32>,
    /// Largest completion the provider accepts (if known).
    pub max_completion_tokens: Option<u32>,
    /// USD per million prompt tokens.
    pub prompt_cost_per_mtok: Option<f64>,
    /// USD per million completion tokens.
    pub completion_cost_per_mtok: Option<f64>,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            name: None,
            description: None,
            context_length: None,
            max_completion_tokens: None,
            prompt_cost_per_mtok: None,
            completion_cost_per_mtok: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_context_length(mut self, tokens: u32) -> Self {
        self.context_length = Some(tokens);
        self
    }
}
