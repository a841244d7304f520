//! Direct provider adapter over the `llm` crate.
//!
//! [`LlmAdapter`] talks to OpenAI or Anthropic without going through an
//! aggregator. The llm crate fixes sampling parameters at build time, so a
//! provider is built per call from the request.

use std::time::Duration;

use async_trait::async_trait;
use llm::LLMProvider;
use llm::builder::{LLMBackend, LLMBuilder};
use llm::chat::ChatMessage as LlmMessage;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::traits::ProviderAdapter;
use crate::types::{ChatRequest, Completion, FinishReason, Message, Role, Usage};
use crate::{PromptgateError, Result};

/// Adapter for a provider reached directly through the llm crate.
pub struct LlmAdapter {
    backend: LLMBackend,
    api_key: String,
    name: String,
    default_model: String,
    /// Model-id prefixes this backend serves. Empty means any un-namespaced id.
    model_prefixes: Vec<String>,
}

impl LlmAdapter {
    /// Create an adapter for an arbitrary llm backend.
    pub fn new(
        backend: LLMBackend,
        api_key: impl Into<String>,
        name: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            api_key: api_key.into(),
            name: name.into(),
            default_model: default_model.into(),
            model_prefixes: Vec::new(),
        }
    }

    /// OpenAI, serving `gpt-*` and `o*` reasoning models.
    #[cfg(feature = "openai")]
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new(LLMBackend::OpenAI, api_key, "openai", "gpt-4o-mini")
            .model_prefixes(["gpt-", "chatgpt-", "o1", "o3", "o4"])
    }

    /// Anthropic, serving `claude-*` models.
    #[cfg(feature = "anthropic")]
    pub fn anthropic(api_key: impl Into<String>) -> Self {
        Self::new(
            LLMBackend::Anthropic,
            api_key,
            "anthropic",
            "claude-3-5-haiku-latest",
        )
        .model_prefixes(["claude-"])
    }

    /// Restrict the models this adapter claims to support.
    pub fn model_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.model_prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    /// Override the default model.
    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn build_provider(
        &self,
        request: &ChatRequest,
        model: &str,
        system: Option<&str>,
        deadline: Duration,
    ) -> Result<Box<dyn LLMProvider>> {
        let params = &request.params;
        let mut builder = LLMBuilder::new()
            .backend(self.backend.clone())
            .api_key(&self.api_key)
            .model(model)
            .timeout_seconds(deadline.as_secs().max(1));

        if let Some(sys) = system {
            builder = builder.system(sys);
        }
        if let Some(temp) = params.temperature {
            builder = builder.temperature(temp);
        }
        if let Some(max) = params.max_tokens {
            builder = builder.max_tokens(max);
        }
        if let Some(p) = params.top_p {
            builder = builder.top_p(p);
        }

        builder
            .build()
            .map_err(|e| PromptgateError::Configuration(e.to_string()))
    }
}

/// System turns are folded into one system prompt; the rest become chat turns.
fn to_llm_messages(messages: &[Message]) -> (Option<String>, Vec<LlmMessage>) {
    let mut system: Vec<&str> = Vec::new();
    let mut turns = Vec::with_capacity(messages.len());
    for msg in messages {
        match msg.role {
            Role::System => system.push(&msg.content),
            Role::User => turns.push(LlmMessage::user().content(msg.content.clone()).build()),
            Role::Assistant => {
                turns.push(LlmMessage::assistant().content(msg.content.clone()).build())
            }
        }
    }
    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, turns)
}

#[async_trait]
impl ProviderAdapter for LlmAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn supports_model(&self, model: &str) -> bool {
        if model.contains('/') {
            return false;
        }
        self.model_prefixes.is_empty() || self.model_prefixes.iter().any(|p| model.starts_with(p))
    }

    #[instrument(name = "llm.complete", skip_all, fields(provider = %self.name))]
    async fn complete(
        &self,
        request: &ChatRequest,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Completion> {
        let model = request.model.as_deref().unwrap_or(&self.default_model);
        let (system, turns) = to_llm_messages(&request.messages);
        let provider = self.build_provider(request, model, system.as_deref(), deadline)?;

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(PromptgateError::Cancelled),
            r = provider.chat(&turns) => r.map_err(PromptgateError::from)?,
        };

        let content = response.text().unwrap_or_default();
        if content.is_empty() {
            return Err(PromptgateError::EmptyResponse);
        }
        let usage = response
            .usage()
            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        Ok(Completion {
            content,
            model: model.to_string(),
            provider: self.name.clone(),
            usage,
            finish_reason: FinishReason::Stop,
            cached: false,
        })
    }
}
