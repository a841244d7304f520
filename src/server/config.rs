//! Configuration loading for promptgated.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `~/.promptgate/config.toml` (user)
//! 3. `/etc/promptgate/config.toml` (system)
//!
//! Secrets are loaded separately with mandatory permission checks:
//! 1. `~/.promptgate/secrets.toml` (user, must be 0600)
//! 2. `/etc/promptgate/secrets.toml` (system, must be 0600)

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::gateway::{Promptgate, PromptgateBuilder, ValidationLimits};
use crate::identity::{AllowAll, IdentityProvider, StaticKeyIdentity};
use crate::providers::{RetryConfig, RoutingConfig};
use crate::{BudgetConfig, CacheConfig, JobConfig, PromptgateError, Result};

/// Daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: ValidationLimits,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub budget: BudgetSection,
    #[serde(default)]
    pub jobs: JobsSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

/// Server network configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to (default: 127.0.0.1:9750).
    pub address: String,
    /// Concurrent requests per connection (default: 100).
    pub max_concurrent_requests: usize,
    /// Whole-RPC timeout in seconds (default: 120).
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9750".to_string(),
            max_concurrent_requests: 100,
            request_timeout_secs: 120,
        }
    }
}

/// `[cache]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub max_entries: u64,
    pub ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        let defaults = CacheConfig::default();
        Self {
            max_entries: defaults.max_entries,
            ttl_secs: defaults.ttl.as_secs(),
        }
    }
}

impl From<&CacheSection> for CacheConfig {
    fn from(s: &CacheSection) -> Self {
        CacheConfig::new()
            .max_entries(s.max_entries)
            .ttl(Duration::from_secs(s.ttl_secs))
    }
}

/// `[budget]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    pub max_tokens_per_request: u64,
    pub tenant_ceiling: u64,
    pub window_secs: u64,
    pub default_completion_allowance: u32,
    /// Tenant → ceiling.
    pub overrides: HashMap<String, u64>,
}

impl Default for BudgetSection {
    fn default() -> Self {
        let defaults = BudgetConfig::default();
        Self {
            max_tokens_per_request: defaults.max_tokens_per_request,
            tenant_ceiling: defaults.tenant_ceiling,
            window_secs: defaults.window.as_secs(),
            default_completion_allowance: defaults.default_completion_allowance,
            overrides: HashMap::new(),
        }
    }
}

impl From<&BudgetSection> for BudgetConfig {
    fn from(s: &BudgetSection) -> Self {
        s.overrides.iter().fold(
            BudgetConfig::new()
                .max_tokens_per_request(s.max_tokens_per_request)
                .tenant_ceiling(s.tenant_ceiling)
                .window(Duration::from_secs(s.window_secs))
                .default_completion_allowance(s.default_completion_allowance),
            |config, (tenant, ceiling)| config.ceiling_for(tenant.as_str(), *ceiling),
        )
    }
}

/// `[jobs]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsSection {
    pub workers: usize,
    pub max_attempts: u32,
    pub retention_secs: u64,
    pub max_queued: usize,
}

impl Default for JobsSection {
    fn default() -> Self {
        let defaults = JobConfig::default();
        Self {
            workers: defaults.workers,
            max_attempts: defaults.max_attempts,
            retention_secs: defaults.retention.as_secs(),
            max_queued: defaults.max_queued,
        }
    }
}

impl From<&JobsSection> for JobConfig {
    fn from(s: &JobsSection) -> Self {
        JobConfig::new()
            .workers(s.workers)
            .max_attempts(s.max_attempts)
            .retention(Duration::from_secs(s.retention_secs))
            .max_queued(s.max_queued)
    }
}

/// `[retry]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    /// Per-attempt provider deadline (default: 60).
    pub timeout_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            initial_delay_ms: defaults.initial_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
            jitter: defaults.jitter,
            timeout_secs: defaults.attempt_timeout.as_secs(),
        }
    }
}

impl From<&RetrySection> for RetryConfig {
    fn from(s: &RetrySection) -> Self {
        RetryConfig::new()
            .max_attempts(s.max_attempts)
            .initial_delay(Duration::from_millis(s.initial_delay_ms))
            .max_delay(Duration::from_millis(s.max_delay_ms))
            .jitter(s.jitter)
            .attempt_timeout(Duration::from_secs(s.timeout_secs))
    }
}

/// Provider configurations. A provider is enabled when its section is
/// present and a key is available.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openrouter: Option<OpenRouterConfig>,
    #[serde(default)]
    pub openai: Option<ApiProviderConfig>,
    #[serde(default)]
    pub anthropic: Option<ApiProviderConfig>,
}

/// OpenRouter configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenRouterConfig {
    /// Default model to use when none specified.
    #[serde(default)]
    pub default_model: Option<String>,
    /// Override of `https://openrouter.ai/api/v1`.
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Direct API provider configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiProviderConfig {
    /// Default model to use when none specified.
    #[serde(default)]
    pub default_model: Option<String>,
}

/// Secrets configuration (API keys).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Secrets {
    #[serde(default)]
    pub openrouter: Option<ApiKeySecret>,
    #[serde(default)]
    pub openai: Option<ApiKeySecret>,
    #[serde(default)]
    pub anthropic: Option<ApiKeySecret>,
    /// Caller API key → tenant. Empty means every caller is trusted.
    #[serde(default)]
    pub tenants: HashMap<String, String>,
}

/// A single API key secret.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeySecret {
    pub api_key: String,
}

/// Provider name → environment variable name mapping.
const PROVIDER_ENV_VARS: &[(&str, &str)] = &[
    ("openrouter", "OPENROUTER_API_KEY"),
    ("openai", "OPENAI_API_KEY"),
    ("anthropic", "ANTHROPIC_API_KEY"),
];

impl Config {
    /// Load configuration from the standard locations.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        let content = fs::read_to_string(&path).map_err(|e| {
            PromptgateError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            PromptgateError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(PromptgateError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".promptgate").join("config.toml");
            if user_config.exists() {
                return Ok(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/promptgate/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }

        Err(PromptgateError::Configuration(
            "No config file found. Create ~/.promptgate/config.toml or /etc/promptgate/config.toml"
                .to_string(),
        ))
    }

    /// Gateway builder for this configuration. Call `build()` inside the
    /// runtime that will serve requests.
    pub fn gateway_builder(&self, secrets: &Secrets) -> PromptgateBuilder {
        let mut builder = Promptgate::builder()
            .validation(self.limits.clone())
            .response_cache((&self.cache).into())
            .budget((&self.budget).into())
            .jobs((&self.jobs).into())
            .retry((&self.retry).into())
            .routing(self.routing.clone())
            .identity(secrets.identity());

        #[cfg(feature = "openrouter")]
        if let Some(section) = &self.providers.openrouter
            && let Some(key) = secrets.api_key("openrouter")
        {
            let mut adapter = match &section.base_url {
                Some(url) => crate::providers::OpenRouterAdapter::with_base_url(key, url),
                None => crate::providers::OpenRouterAdapter::new(key),
            };
            if let Some(model) = &section.default_model {
                adapter = adapter.default_model(model);
            }
            builder = builder.adapter(Arc::new(adapter));
        }

        #[cfg(feature = "openai")]
        if let Some(section) = &self.providers.openai
            && let Some(key) = secrets.api_key("openai")
        {
            let mut adapter = crate::providers::LlmAdapter::openai(key);
            if let Some(model) = &section.default_model {
                adapter = adapter.default_model(model);
            }
            builder = builder.adapter(Arc::new(adapter));
        }

        #[cfg(feature = "anthropic")]
        if let Some(section) = &self.providers.anthropic
            && let Some(key) = secrets.api_key("anthropic")
        {
            let mut adapter = crate::providers::LlmAdapter::anthropic(key);
            if let Some(model) = &section.default_model {
                adapter = adapter.default_model(model);
            }
            builder = builder.adapter(Arc::new(adapter));
        }

        builder
    }
}

impl Secrets {
    /// Load secrets from the standard locations with permission checks.
    ///
    /// Returns empty secrets if no file exists (providers may use env vars).
    pub fn load() -> Result<Self> {
        if let Some(home) = dirs::home_dir() {
            let user_secrets = home.join(".promptgate").join("secrets.toml");
            if user_secrets.exists() {
                return Self::load_from_file(&user_secrets);
            }
        }

        let system_secrets = PathBuf::from("/etc/promptgate/secrets.toml");
        if system_secrets.exists() {
            return Self::load_from_file(&system_secrets);
        }

        Ok(Secrets::default())
    }

    /// Read a secrets file after checking its permissions.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        Self::check_permissions(path)?;
        let content = fs::read_to_string(path).map_err(|e| {
            PromptgateError::Configuration(format!("Failed to read secrets file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            PromptgateError::Configuration(format!("Failed to parse secrets file {path:?}: {e}"))
        })
    }

    /// Check that the secrets file has secure permissions (0600 or 0400).
    #[cfg(unix)]
    fn check_permissions(path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let metadata = fs::metadata(path).map_err(|e| {
            PromptgateError::Configuration(format!("Failed to stat secrets file {path:?}: {e}"))
        })?;

        let mode = metadata.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(PromptgateError::Configuration(format!(
                "Secrets file {path:?} has insecure permissions {:o}. Must be 0600 or 0400.",
                mode & 0o777
            )));
        }

        Ok(())
    }

    #[cfg(not(unix))]
    fn check_permissions(_path: &Path) -> Result<()> {
        Ok(())
    }

    /// Get API key for a provider, falling back to the corresponding environment variable.
    pub fn api_key(&self, provider: &str) -> Option<String> {
        let from_file = match provider {
            "openrouter" => self.openrouter.as_ref(),
            "openai" => self.openai.as_ref(),
            "anthropic" => self.anthropic.as_ref(),
            _ => None,
        }
        .map(|s| s.api_key.clone());

        from_file.or_else(|| {
            PROVIDER_ENV_VARS
                .iter()
                .find(|(name, _)| *name == provider)
                .and_then(|(_, env_var)| std::env::var(env_var).ok())
                .filter(|key| !key.is_empty())
        })
    }

    /// Identity collaborator for the `[tenants]` table.
    pub fn identity(&self) -> Arc<dyn IdentityProvider> {
        if self.tenants.is_empty() {
            Arc::new(AllowAll)
        } else {
            Arc::new(
                self.tenants
                    .iter()
                    .map(|(key, tenant)| (key.clone(), tenant.clone()))
                    .collect::<StaticKeyIdentity>(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.server.address, "127.0.0.1:9750");
        assert_eq!(config.server.max_concurrent_requests, 100);
        assert_eq!(config.limits.max_prompt_chars, 50_000);
        assert_eq!(config.limits.max_tokens, 4_000);
        assert_eq!(config.retry.timeout_secs, 60);
        assert_eq!(config.cache.ttl_secs, 3600);
    }

    #[test]
    fn parse_minimal_config() {
        let toml = r#"
            [server]
            address = "0.0.0.0:9750"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.address, "0.0.0.0:9750");
        assert_eq!(config.server.request_timeout_secs, 120);
        assert_eq!(config.jobs.workers, 4);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [server]
            address = "127.0.0.1:9750"
            max_concurrent_requests = 50

            [limits]
            max_prompt_chars = 10000
            max_tokens = 2000

            [cache]
            max_entries = 500
            ttl_secs = 60

            [budget]
            tenant_ceiling = 1000
            window_secs = 600

            [budget.overrides]
            acme = 5000

            [jobs]
            workers = 2
            max_attempts = 3

            [retry]
            max_attempts = 4
            initial_delay_ms = 100
            jitter = false

            [routing]
            default_order = ["openai", "openrouter"]

            [providers.openrouter]
            default_model = "anthropic/claude-3.5-sonnet"

            [providers.openai]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.max_concurrent_requests, 50);
        assert_eq!(config.limits.max_prompt_chars, 10_000);
        // Unset limits keep their defaults.
        assert_eq!(config.limits.max_stop_sequences, 4);

        let cache = CacheConfig::from(&config.cache);
        assert_eq!(cache.max_entries, 500);
        assert_eq!(cache.ttl, Duration::from_secs(60));

        let budget = BudgetConfig::from(&config.budget);
        assert_eq!(budget.tenant_ceiling, 1000);
        assert_eq!(budget.window, Duration::from_secs(600));
        assert_eq!(budget.overrides.get(&crate::TenantId::new("acme")), Some(&5000));

        let jobs = JobConfig::from(&config.jobs);
        assert_eq!(jobs.workers, 2);
        assert_eq!(jobs.max_attempts, 3);

        let retry = RetryConfig::from(&config.retry);
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.initial_delay, Duration::from_millis(100));
        assert!(!retry.jitter);

        assert_eq!(config.routing.default_order, vec!["openai", "openrouter"]);
        assert_eq!(
            config.providers.openrouter.unwrap().default_model.as_deref(),
            Some("anthropic/claude-3.5-sonnet")
        );
        assert!(config.providers.openai.is_some());
        assert!(config.providers.anthropic.is_none());
    }

    #[test]
    fn parse_secrets_with_tenants() {
        let toml = r#"
            [openrouter]
            api_key = "sk-or-test-key"

            [tenants]
            "key-1" = "acme"
            "key-2" = "globex"
        "#;
        let secrets: Secrets = toml::from_str(toml).unwrap();
        assert_eq!(
            secrets.openrouter.as_ref().unwrap().api_key,
            "sk-or-test-key"
        );
        assert!(secrets.openai.is_none());
        assert_eq!(secrets.tenants.len(), 2);
        assert_eq!(secrets.tenants["key-1"], "acme");
    }

    #[test]
    fn api_key_from_secrets() {
        let secrets = Secrets {
            openrouter: Some(ApiKeySecret {
                api_key: "from-file".to_string(),
            }),
            ..Default::default()
        };
        assert_eq!(secrets.api_key("openrouter"), Some("from-file".to_string()));
        assert_eq!(secrets.api_key("nonexistent"), None);
    }

    #[test]
    fn config_not_found_returns_error() {
        let result = Config::load(Some(Path::new("/nonexistent/config.toml")));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Config file not found"));
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[jobs]\nworkers = 7\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.jobs.workers, 7);
    }

    #[cfg(unix)]
    #[test]
    fn world_readable_secrets_are_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.toml");
        fs::write(&path, "[openrouter]\napi_key = \"k\"\n").unwrap();

        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        let err = Secrets::load_from_file(&path).unwrap_err().to_string();
        assert!(err.contains("insecure permissions"));

        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        let secrets = Secrets::load_from_file(&path).unwrap();
        assert_eq!(secrets.api_key("openrouter"), Some("k".to_string()));
    }
}
