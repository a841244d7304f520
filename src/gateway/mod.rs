//! The gateway facade.
//!
//! [`Gateway`] is the single entry point. Every request is authorized, then
//! validated, then either run inline ([`submit`](Gateway::submit)) or queued
//! as a job ([`submit_async`](Gateway::submit_async)). Both paths share one
//! cache, budget and dispatch pipeline.

mod builder;
mod pipeline;
mod validation;

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use builder::{Promptgate, PromptgateBuilder};
pub use validation::ValidationLimits;

use crate::budget::BudgetUsage;
use crate::cache::ResponseCache;
use crate::identity::{IdentityProvider, Verdict};
use crate::jobs::JobQueue;
use crate::telemetry;
use crate::types::{Caller, ChatRequest, Completion, JobId, JobStatus, ModelInfo, TenantId};
use crate::{PromptgateError, Result};

use pipeline::Pipeline;

/// Health of one configured adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterHealth {
    pub name: String,
    pub default_model: String,
    pub healthy: bool,
}

/// Request orchestration gateway. `Send + Sync`; share it behind an `Arc`.
pub struct Gateway {
    pipeline: Arc<Pipeline>,
    jobs: Arc<JobQueue>,
    identity: Arc<dyn IdentityProvider>,
    limits: ValidationLimits,
}

impl Gateway {
    /// Run a request to completion on the caller's task.
    ///
    /// Dropping the returned future detaches this caller; a provider call
    /// shared with other callers keeps running for them.
    #[instrument(name = "gateway.submit", skip_all, fields(tenant = tracing::field::Empty))]
    pub async fn submit(&self, request: ChatRequest) -> Result<Completion> {
        let started = Instant::now();
        let result = async {
            let request = self.admit(request).await?;
            let cancel = CancellationToken::new();
            let retry = self.pipeline.dispatcher.retry_config();
            self.pipeline.execute(&request, retry, &cancel).await.result
        }
        .await;
        record_request("sync", started, &result);
        result
    }

    /// Queue a request and return its job id.
    #[instrument(name = "gateway.submit_async", skip_all, fields(tenant = tracing::field::Empty))]
    pub async fn submit_async(&self, request: ChatRequest) -> Result<JobId> {
        let started = Instant::now();
        let result = async {
            let request = self.admit(request).await?;
            self.jobs.enqueue(request).await
        }
        .await;
        record_request("async", started, &result);
        result
    }

    pub async fn poll(&self, id: &JobId) -> Result<JobStatus> {
        self.jobs.poll(id).await
    }

    pub async fn cancel(&self, id: &JobId) -> Result<JobStatus> {
        self.jobs.cancel(id).await
    }

    /// Delete a finished job's record.
    pub async fn purge(&self, id: &JobId) -> Result<()> {
        self.jobs.purge(id).await
    }

    pub fn budget_usage(&self, tenant: &TenantId) -> BudgetUsage {
        self.pipeline.budgeter.usage(tenant)
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.pipeline.cache
    }

    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }

    pub fn limits(&self) -> &ValidationLimits {
        &self.limits
    }

    /// Provider calls currently running.
    pub fn in_flight(&self) -> usize {
        self.pipeline.dispatcher.in_flight()
    }

    /// Configured adapters in routing order.
    pub fn health(&self) -> Vec<AdapterHealth> {
        self.pipeline
            .dispatcher
            .adapters()
            .iter()
            .map(|a| AdapterHealth {
                name: a.name().to_string(),
                default_model: a.default_model().to_string(),
                healthy: a.is_healthy(),
            })
            .collect()
    }

    /// Models advertised by every configured adapter, in routing order.
    ///
    /// An adapter whose catalog cannot be read is skipped. The call fails
    /// only if every adapter failed.
    #[instrument(name = "gateway.list_models", skip_all)]
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let mut models = Vec::new();
        let mut last_err = None;
        let mut answered = false;
        for adapter in self.pipeline.dispatcher.adapters() {
            match adapter.list_models().await {
                Ok(listed) => {
                    answered = true;
                    models.extend(listed);
                }
                Err(e) => {
                    warn!(provider = adapter.name(), error = %e, "model catalog unavailable");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if !answered => Err(e),
            _ => Ok(models),
        }
    }

    /// Details of `model` from the first adapter that knows it.
    #[instrument(name = "gateway.model_info", skip(self))]
    pub async fn model_info(&self, model: &str) -> Result<Option<ModelInfo>> {
        let mut last_err = None;
        for adapter in self.pipeline.dispatcher.adapters() {
            if !adapter.supports_model(model) {
                continue;
            }
            match adapter.model_info(model).await {
                Ok(Some(info)) => return Ok(Some(info)),
                Ok(None) => {}
                Err(e) => {
                    warn!(provider = adapter.name(), error = %e, "model lookup failed");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Stop the worker pool, wait for running jobs, and flush the cache.
    /// Async submissions fail with `QueueUnavailable` afterwards.
    pub async fn shutdown(&self) {
        info!("gateway shutting down");
        self.jobs.shutdown().await;
        self.pipeline.cache.flush().await;
    }

    /// Resolve a caller to the tenant the identity collaborator confirms.
    pub async fn authorize(&self, caller: &Caller) -> Result<TenantId> {
        match self.identity.verify(caller).await {
            Verdict::Allow(tenant) => Ok(tenant),
            Verdict::Deny(reason) => {
                debug!(claimed = %caller.tenant, %reason, "request denied");
                Err(PromptgateError::Unauthorized(reason))
            }
        }
    }

    /// Authorize and validate. The returned request carries the verified
    /// tenant and no credential.
    async fn admit(&self, request: ChatRequest) -> Result<ChatRequest> {
        let tenant = self.authorize(&request.caller).await?;
        tracing::Span::current().record("tenant", tenant.as_str());
        self.limits.check(&request)?;

        let mut admitted = request;
        admitted.caller.tenant = tenant;
        admitted.caller.credential = None;
        Ok(admitted)
    }
}

fn record_request<T>(surface: &'static str, started: Instant, result: &Result<T>) {
    let status = match result {
        Ok(_) => "ok",
        Err(e) => e.kind().code(),
    };
    metrics::counter!(telemetry::REQUESTS_TOTAL, "surface" => surface, "status" => status)
        .increment(1);
    metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS, "surface" => surface)
        .record(started.elapsed().as_secs_f64());
}
