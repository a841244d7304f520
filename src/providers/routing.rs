//! Routing configuration and adapter selection.
//!
//! Selection is a pure function of the request, the configured ordering and
//! each adapter's self-reported health:
//!
//! - an explicit model picks the first adapter (in default order) that
//!   supports it and is healthy;
//! - otherwise the first healthy adapter wins, with its own default model.
//!
//! ```rust,ignore
//! Promptgate::builder()
//!     .openrouter(key)
//!     .openai(openai_key)
//!     .routing(RoutingConfig::new().prefer("openai"))
//!     .build()?
//! ```

use std::sync::Arc;

use serde::Deserialize;

use super::traits::ProviderAdapter;
use crate::error::PromptgateError;
use crate::Result;

/// Default adapter ordering.
///
/// Adapters named in `default_order` are tried first, in that order; the
/// rest follow in registration order.
///
/// ```toml
/// [routing]
/// default_order = ["openai", "openrouter"]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub default_order: Vec<String>,
}

impl RoutingConfig {
    /// Create an empty routing config (registration order).
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an adapter name to the preferred ordering.
    pub fn prefer(mut self, provider: impl Into<String>) -> Self {
        self.default_order.push(provider.into());
        self
    }

    /// Replace the whole ordering.
    pub fn default_order<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_order = order.into_iter().map(Into::into).collect();
        self
    }

    /// Reorder `adapters` in place according to the configured ordering.
    ///
    /// Stable: adapters not named keep their relative registration order.
    pub(crate) fn apply(&self, adapters: &mut [Arc<dyn ProviderAdapter>]) {
        adapters.sort_by_key(|a| {
            self.default_order
                .iter()
                .position(|name| name == a.name())
                .unwrap_or(usize::MAX)
        });
    }
}

/// Adapter chosen for a request, with the model it will be asked for.
#[derive(Clone)]
pub struct Selection {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub model: String,
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selection")
            .field("adapter", &self.adapter.name())
            .field("model", &self.model)
            .finish()
    }
}

/// Pick an adapter for `model` from `adapters`, which must already be in
/// default order.
pub fn select_adapter(
    adapters: &[Arc<dyn ProviderAdapter>],
    model: Option<&str>,
) -> Result<Selection> {
    if adapters.is_empty() {
        return Err(PromptgateError::NoProvider);
    }

    match model.map(str::trim).filter(|m| !m.is_empty()) {
        Some(model) => {
            let mut supported = false;
            for adapter in adapters {
                if !adapter.supports_model(model) {
                    continue;
                }
                supported = true;
                if adapter.is_healthy() {
                    return Ok(Selection {
                        adapter: Arc::clone(adapter),
                        model: model.to_string(),
                    });
                }
            }
            if supported {
                Err(PromptgateError::NoHealthyProvider(model.to_string()))
            } else {
                Err(PromptgateError::ModelNotFound(model.to_string()))
            }
        }
        None => adapters
            .iter()
            .find(|a| a.is_healthy())
            .map(|adapter| Selection {
                adapter: Arc::clone(adapter),
                model: adapter.default_model().to_string(),
            })
            .ok_or_else(|| PromptgateError::NoHealthyProvider("default".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::types::{ChatRequest, Completion};

    struct Stub {
        name: &'static str,
        healthy: bool,
        models: &'static [&'static str],
    }

    #[async_trait]
    impl ProviderAdapter for Stub {
        fn name(&self) -> &str {
            self.name
        }

        fn default_model(&self) -> &str {
            self.models[0]
        }

        fn supports_model(&self, model: &str) -> bool {
            self.models.contains(&model)
        }

        fn is_healthy(&self) -> bool {
            self.healthy
        }

        async fn complete(
            &self,
            _request: &ChatRequest,
            _deadline: Duration,
            _cancel: &CancellationToken,
        ) -> Result<Completion> {
            unreachable!("selection never calls complete")
        }
    }

    fn stub(
        name: &'static str,
        healthy: bool,
        models: &'static [&'static str],
    ) -> Arc<dyn ProviderAdapter> {
        Arc::new(Stub {
            name,
            healthy,
            models,
        })
    }

    #[test]
    fn explicit_model_picks_first_supporting_healthy_adapter() {
        let adapters = vec![
            stub("a", true, &["x"]),
            stub("b", false, &["y"]),
            stub("c", true, &["y"]),
        ];
        let sel = select_adapter(&adapters, Some("y")).unwrap();
        assert_eq!(sel.adapter.name(), "c");
        assert_eq!(sel.model, "y");
    }

    #[test]
    fn default_walks_order_for_first_healthy() {
        let adapters = vec![stub("a", false, &["x"]), stub("b", true, &["z"])];
        let sel = select_adapter(&adapters, None).unwrap();
        assert_eq!(sel.adapter.name(), "b");
        assert_eq!(sel.model, "z");
    }

    #[test]
    fn unsupported_model_is_not_found() {
        let adapters = vec![stub("a", true, &["x"])];
        assert!(matches!(
            select_adapter(&adapters, Some("nope")),
            Err(PromptgateError::ModelNotFound(_))
        ));
    }

    #[test]
    fn supported_but_unhealthy_is_no_healthy_provider() {
        let adapters = vec![stub("a", false, &["x"])];
        assert!(matches!(
            select_adapter(&adapters, Some("x")),
            Err(PromptgateError::NoHealthyProvider(_))
        ));
    }

    #[test]
    fn empty_registry_is_no_provider() {
        assert!(matches!(
            select_adapter(&[], None),
            Err(PromptgateError::NoProvider)
        ));
    }

    #[test]
    fn ordering_moves_named_adapters_first() {
        let mut adapters = vec![
            stub("a", true, &["x"]),
            stub("b", true, &["x"]),
            stub("c", true, &["x"]),
        ];
        RoutingConfig::new().prefer("c").apply(&mut adapters);
        let names: Vec<_> = adapters.iter().map(|a| a.name().to_string()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }
}
