//! Provider adapters, adapter selection and the retry loop.
//!
//! Every backend implements [`ProviderAdapter`]. The OpenRouter adapter
//! speaks HTTP directly; OpenAI and Anthropic go through the llm crate.

#[cfg(any(feature = "openai", feature = "anthropic"))]
pub mod llm_direct;
#[cfg(feature = "openrouter")]
pub mod openrouter;
#[cfg(feature = "openrouter")]
mod openrouter_models;
pub mod retry;
pub mod routing;
pub mod traits;

#[cfg(any(feature = "openai", feature = "anthropic"))]
pub use llm_direct::LlmAdapter;
#[cfg(feature = "openrouter")]
pub use openrouter::OpenRouterAdapter;
pub use retry::RetryConfig;
pub use routing::{RoutingConfig, Selection, select_adapter};
pub use traits::{ProviderAdapter, estimate_tokens};
