//! Provider adapter trait.
//!
//! One implementation per LLM backend. The dispatcher only ever talks to a
//! backend through this seam, so retries, coalescing and budgeting stay
//! provider-agnostic.
//!
//! # Deadlines and cancellation
//!
//! `complete` receives the per-attempt deadline and a cancellation token.
//! The dispatcher also enforces the deadline from the outside, so an adapter
//! that ignores both is still bounded; honouring them lets the adapter abort
//! the underlying HTTP request early.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{PromptgateError, Retryability};
use crate::types::{ChatRequest, Completion, ModelInfo};
use crate::Result;

/// Fixed per-turn token overhead used by the default estimator.
const TOKENS_PER_MESSAGE: usize = 4;

/// Uniform interface to one LLM backend.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Adapter name for logging, metrics and routing (e.g. "openrouter").
    fn name(&self) -> &str;

    /// Model used when the request does not name one.
    fn default_model(&self) -> &str;

    /// Whether this adapter can serve `model`. Default: any model.
    fn supports_model(&self, _model: &str) -> bool {
        true
    }

    /// Current health as seen by the adapter. Unhealthy adapters are skipped
    /// during selection.
    fn is_healthy(&self) -> bool {
        true
    }

    /// Issue one completion call.
    ///
    /// `request.model` is always resolved (`Some`) by the time an adapter
    /// sees it.
    async fn complete(
        &self,
        request: &ChatRequest,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Completion>;

    /// Models this adapter can serve. Default: none advertised.
    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(Vec::new())
    }

    /// Look up one model. `Ok(None)` if the provider does not know it.
    async fn model_info(&self, _model: &str) -> Result<Option<ModelInfo>> {
        Ok(None)
    }

    /// Estimate prompt tokens for budgeting.
    ///
    /// Default: roughly four characters per token plus a small per-turn
    /// overhead. Adapters with a real tokenizer should override.
    fn count_tokens(&self, request: &ChatRequest) -> usize {
        estimate_tokens(request)
    }

    /// Decide whether a failed call may be retried.
    fn classify(&self, error: &PromptgateError) -> Retryability {
        if error.is_transient() {
            Retryability::Retryable
        } else {
            Retryability::Permanent
        }
    }
}

/// Character-based token estimate shared by adapters without a tokenizer.
pub fn estimate_tokens(request: &ChatRequest) -> usize {
    request
        .messages
        .iter()
        .map(|m| m.content.chars().count().div_ceil(4) + TOKENS_PER_MESSAGE)
        .sum::<usize>()
        + 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[test]
    fn estimate_grows_with_prompt() {
        let short = ChatRequest::new(vec![Message::user("hi")]);
        let long = ChatRequest::new(vec![Message::user("hi ".repeat(400))]);
        assert!(estimate_tokens(&long) > estimate_tokens(&short));
        // 2 chars -> 1 token, plus per-turn overhead and priming
        assert_eq!(estimate_tokens(&short), 1 + TOKENS_PER_MESSAGE + 2);
    }

    #[test]
    fn estimate_counts_every_turn() {
        let one = ChatRequest::new(vec![Message::user("abcd")]);
        let two = ChatRequest::new(vec![Message::system("abcd"), Message::user("abcd")]);
        assert_eq!(
            estimate_tokens(&two) - estimate_tokens(&one),
            1 + TOKENS_PER_MESSAGE
        );
    }
}
