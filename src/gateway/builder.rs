//! Builder for configuring gateway instances

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::pipeline::Pipeline;
use super::{Gateway, ValidationLimits};
use crate::budget::{BudgetConfig, TokenBudgeter};
use crate::cache::{CacheBackend, CacheConfig, ResponseCache};
use crate::dispatch::Dispatcher;
use crate::identity::{AllowAll, IdentityProvider};
use crate::jobs::{JobConfig, JobQueue, JobRunner, JobStore, MemoryJobStore};
use crate::providers::{ProviderAdapter, RetryConfig, RoutingConfig};
use crate::{PromptgateError, Result};

/// Main entry point for creating gateway instances.
pub struct Promptgate;

impl Promptgate {
    /// Create a new builder for configuring the gateway.
    pub fn builder() -> PromptgateBuilder {
        PromptgateBuilder::new()
    }
}

/// Builder for configuring gateway instances.
///
/// ```rust,no_run
/// # use promptgate::{Promptgate, BudgetConfig, JobConfig};
/// # async fn example() -> promptgate::Result<()> {
/// let gateway = Promptgate::builder()
///     .openrouter(std::env::var("OPENROUTER_API_KEY").unwrap_or_default())
///     .budget(BudgetConfig::new().tenant_ceiling(500_000))
///     .jobs(JobConfig::new().workers(8))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct PromptgateBuilder {
    openrouter_key: Option<String>,
    openrouter_base_url: Option<String>,
    openai_key: Option<String>,
    anthropic_key: Option<String>,
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    routing: RoutingConfig,
    retry: RetryConfig,
    cache: CacheConfig,
    cache_backend: Option<Arc<dyn CacheBackend>>,
    budget: BudgetConfig,
    jobs: JobConfig,
    job_store: Option<Arc<dyn JobStore>>,
    identity: Arc<dyn IdentityProvider>,
    limits: ValidationLimits,
}

impl PromptgateBuilder {
    pub fn new() -> Self {
        Self {
            openrouter_key: None,
            openrouter_base_url: None,
            openai_key: None,
            anthropic_key: None,
            adapters: Vec::new(),
            routing: RoutingConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            cache_backend: None,
            budget: BudgetConfig::default(),
            jobs: JobConfig::default(),
            job_store: None,
            identity: Arc::new(AllowAll),
            limits: ValidationLimits::default(),
        }
    }

    /// Configure OpenRouter (routes to many models).
    pub fn openrouter(mut self, api_key: impl Into<String>) -> Self {
        self.openrouter_key = Some(api_key.into());
        self
    }

    /// Point the OpenRouter adapter at another OpenAI-compatible endpoint.
    pub fn openrouter_base_url(mut self, url: impl Into<String>) -> Self {
        self.openrouter_base_url = Some(url.into());
        self
    }

    /// Configure direct OpenAI provider.
    pub fn openai(mut self, api_key: impl Into<String>) -> Self {
        self.openai_key = Some(api_key.into());
        self
    }

    /// Configure direct Anthropic provider.
    pub fn anthropic(mut self, api_key: impl Into<String>) -> Self {
        self.anthropic_key = Some(api_key.into());
        self
    }

    /// Register a custom adapter. Custom adapters come before the built-in
    /// ones unless routing says otherwise.
    pub fn adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Hard deadline for each provider attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.retry = self.retry.attempt_timeout(timeout);
        self
    }

    pub fn response_cache(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    /// Replace the in-memory cache backend.
    pub fn cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    pub fn budget(mut self, config: BudgetConfig) -> Self {
        self.budget = config;
        self
    }

    pub fn jobs(mut self, config: JobConfig) -> Self {
        self.jobs = config;
        self
    }

    /// Replace the in-memory job store.
    pub fn job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.job_store = Some(store);
        self
    }

    /// Set the identity collaborator. Default: [`AllowAll`].
    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = identity;
        self
    }

    pub fn validation(mut self, limits: ValidationLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Build the gateway and start its job workers.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Gateway> {
        let mut adapters = self.adapters;

        #[cfg(feature = "openrouter")]
        if let Some(key) = &self.openrouter_key {
            let adapter = match &self.openrouter_base_url {
                Some(url) => crate::providers::OpenRouterAdapter::with_base_url(key, url),
                None => crate::providers::OpenRouterAdapter::new(key),
            };
            adapters.push(Arc::new(adapter));
        }

        #[cfg(feature = "openai")]
        if let Some(key) = &self.openai_key {
            adapters.push(Arc::new(crate::providers::LlmAdapter::openai(key)));
        }

        #[cfg(feature = "anthropic")]
        if let Some(key) = &self.anthropic_key {
            adapters.push(Arc::new(crate::providers::LlmAdapter::anthropic(key)));
        }

        reject_disabled(&self.openrouter_key, cfg!(feature = "openrouter"), "openrouter")?;
        reject_disabled(&self.openai_key, cfg!(feature = "openai"), "openai")?;
        reject_disabled(&self.anthropic_key, cfg!(feature = "anthropic"), "anthropic")?;

        if adapters.is_empty() {
            return Err(PromptgateError::NoProvider);
        }
        self.routing.apply(&mut adapters);

        let cache = Arc::new(match self.cache_backend {
            Some(backend) => ResponseCache::with_backend(backend, &self.cache),
            None => ResponseCache::new(&self.cache),
        });
        let store = self
            .job_store
            .unwrap_or_else(|| Arc::new(MemoryJobStore::new()));

        let order: Vec<&str> = adapters.iter().map(|a| a.name()).collect();
        info!(adapters = ?order, "gateway configured");

        let pipeline = Arc::new(Pipeline {
            dispatcher: Dispatcher::new(adapters, self.retry, Arc::clone(&cache)),
            budgeter: TokenBudgeter::new(self.budget),
            cache,
        });
        let jobs = JobQueue::new(self.jobs, store);
        jobs.start(Arc::clone(&pipeline) as Arc<dyn JobRunner>)?;

        Ok(Gateway {
            pipeline,
            jobs,
            identity: self.identity,
            limits: self.limits,
        })
    }
}

fn reject_disabled(key: &Option<String>, enabled: bool, provider: &str) -> Result<()> {
    if key.is_some() && !enabled {
        return Err(PromptgateError::Configuration(format!(
            "{provider} key given but the '{provider}' feature is disabled"
        )));
    }
    Ok(())
}

impl Default for PromptgateBuilder {
    fn default() -> Self {
        Self::new()
    }
}
