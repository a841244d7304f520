//! OpenRouter model catalog types and conversion.
//!
//! Handles the `GET {base}/models` list and `GET {base}/models/{id}` lookup
//! responses and converts entries into [`ModelInfo`].

use serde::Deserialize;

use crate::types::ModelInfo;

/// `GET {base}/models` response.
#[derive(Debug, Deserialize)]
pub(crate) struct ModelsResponse {
    #[serde(default)]
    pub data: Vec<ModelEntry>,
}

/// `GET {base}/models/{id}` response, either wrapped in `data` or bare.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ModelLookup {
    Wrapped { data: ModelEntry },
    Bare(ModelEntry),
}

impl ModelLookup {
    pub fn into_entry(self) -> ModelEntry {
        match self {
            ModelLookup::Wrapped { data } => data,
            ModelLookup::Bare(entry) => entry,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ModelEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub context_length: Option<u32>,
    #[serde(default)]
    pub pricing: Option<PricingEntry>,
    #[serde(default)]
    pub top_provider: Option<TopProvider>,
}

/// String-encoded decimal cost per single token.
#[derive(Debug, Deserialize)]
pub(crate) struct PricingEntry {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub completion: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TopProvider {
    #[serde(default)]
    pub max_completion_tokens: Option<u32>,
}

pub(crate) fn into_model_info(entry: ModelEntry) -> ModelInfo {
    let mut info = ModelInfo::new(entry.id, "openrouter");
    info.name = entry.name;
    info.description = entry.description;
    info.context_length = entry.context_length;
    info.max_completion_tokens = entry.top_provider.and_then(|tp| tp.max_completion_tokens);
    if let Some(pricing) = entry.pricing {
        info.prompt_cost_per_mtok = per_token_to_per_mtok(pricing.prompt.as_deref());
        info.completion_cost_per_mtok = per_token_to_per_mtok(pricing.completion.as_deref());
    }
    info
}

/// `"0.000005"` per token is 5.0 per million tokens.
fn per_token_to_per_mtok(s: Option<&str>) -> Option<f64> {
    let per_token: f64 = s?.trim().parse().ok()?;
    Some(per_token * 1_000_000.0)
}
