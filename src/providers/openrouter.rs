//! OpenRouter adapter.
//!
//! Speaks the OpenAI-compatible `POST {base}/chat/completions` dialect with
//! bearer auth. HTTP failures are mapped onto [`PromptgateError`] so the
//! default transient/permanent classification applies:
//!
//! | status          | error                    | retried |
//! |-----------------|--------------------------|---------|
//! | 401, 403        | `AuthenticationFailed`   | no      |
//! | 404             | `ModelNotFound`          | no      |
//! | 429             | `RateLimited` (+hint)    | yes     |
//! | 408, 5xx        | `Api`                    | yes     |
//! | other 4xx       | `Api`                    | no      |
//!
//! The model catalog is read from `GET {base}/models` and
//! `GET {base}/models/{id}`; a 404 on the latter means an unknown model.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::openrouter_models::{ModelLookup, ModelsResponse, into_model_info};
use super::traits::ProviderAdapter;
use crate::types::{ChatRequest, Completion, FinishReason, ModelInfo, Usage};
use crate::{PromptgateError, Result};

/// Default base URL for the OpenRouter API.
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Model used when the request names none.
pub const DEFAULT_MODEL: &str = "openai/gpt-3.5-turbo";

/// Deadline for catalog reads.
const CATALOG_TIMEOUT: Duration = Duration::from_secs(30);

/// Adapter for the OpenRouter aggregator.
#[derive(Clone)]
pub struct OpenRouterAdapter {
    api_key: String,
    http: Client,
    base_url: String,
    default_model: String,
}

impl OpenRouterAdapter {
    /// Create a new adapter with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    /// Create an adapter with a custom base URL (for testing with wiremock).
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Share a connection pool with other adapters.
    pub fn http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    /// Override the default model.
    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn body<'a>(&self, request: &'a ChatRequest, model: &'a str) -> CompletionBody<'a> {
        let params = &request.params;
        CompletionBody {
            model,
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            stream: false,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            top_p: params.top_p,
            stop: params.stop.as_deref(),
            seed: params.seed,
            frequency_penalty: params.frequency_penalty,
            presence_penalty: params.presence_penalty,
        }
    }

    async fn send(
        &self,
        request: &ChatRequest,
        model: &str,
        deadline: Duration,
    ) -> Result<Completion> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(deadline)
            .json(&self.body(request, model))
            .send()
            .await
            .map_err(|e| map_transport_error(e, deadline))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(map_status(status.as_u16(), &text, model, retry_after));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| PromptgateError::Json(e.to_string()))?;
        into_completion(parsed, model)
    }

    /// GET a catalog path. `Ok(None)` on 404.
    async fn catalog<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(CATALOG_TIMEOUT)
            .send()
            .await
            .map_err(|e| map_transport_error(e, CATALOG_TIMEOUT))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(map_status(status.as_u16(), &text, path, retry_after));
        }

        response
            .json()
            .await
            .map(Some)
            .map_err(|e| PromptgateError::Json(e.to_string()))
    }
}

#[async_trait]
impl ProviderAdapter for OpenRouterAdapter {
    fn name(&self) -> &str {
        "openrouter"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    /// OpenRouter model ids are namespaced (`vendor/model`).
    fn supports_model(&self, model: &str) -> bool {
        model.contains('/')
    }

    #[instrument(name = "openrouter.complete", skip_all, fields(model = tracing::field::Empty))]
    async fn complete(
        &self,
        request: &ChatRequest,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Completion> {
        let model = request.model.as_deref().unwrap_or(&self.default_model);
        tracing::Span::current().record("model", model);
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("cancelled before OpenRouter responded");
                Err(PromptgateError::Cancelled)
            }
            r = self.send(request, model, deadline) => r,
        }
    }

    #[instrument(name = "openrouter.list_models", skip_all)]
    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let listed: Option<ModelsResponse> = self.catalog("/models").await?;
        let models: Vec<ModelInfo> = listed
            .map(|r| r.data.into_iter().map(into_model_info).collect())
            .unwrap_or_default();
        debug!(count = models.len(), "fetched OpenRouter models");
        Ok(models)
    }

    #[instrument(name = "openrouter.model_info", skip(self))]
    async fn model_info(&self, model: &str) -> Result<Option<ModelInfo>> {
        let found: Option<ModelLookup> = self.catalog(&format!("/models/{model}")).await?;
        Ok(found.map(|l| into_model_info(l.into_entry())))
    }
}

fn map_transport_error(err: reqwest::Error, deadline: Duration) -> PromptgateError {
    if err.is_timeout() {
        PromptgateError::Timeout(deadline)
    } else {
        PromptgateError::from(err)
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn map_status(
    status: u16,
    body: &str,
    model: &str,
    retry_after: Option<Duration>,
) -> PromptgateError {
    match status {
        401 | 403 => PromptgateError::AuthenticationFailed,
        404 => PromptgateError::ModelNotFound(model.to_string()),
        429 => PromptgateError::RateLimited { retry_after },
        code => PromptgateError::Api {
            status: code,
            message: error_message(body)
                .unwrap_or_else(|| format!("OpenRouter returned HTTP {code}")),
        },
    }
}

/// Pull `error.message` out of an OpenAI-style error body.
fn error_message(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .map(|b| b.error.message)
        .filter(|m| !m.is_empty())
}

fn into_completion(parsed: CompletionResponse, requested_model: &str) -> Result<Completion> {
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or(PromptgateError::EmptyResponse)?;
    let content = choice.message.content.unwrap_or_default();
    let usage = parsed
        .usage
        .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();

    Ok(Completion {
        content,
        model: parsed.model.unwrap_or_else(|| requested_model.to_string()),
        provider: "openrouter".to_string(),
        usage,
        finish_reason: FinishReason::from_wire(choice.finish_reason.as_deref()),
        cached: false,
    })
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}
