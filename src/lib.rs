//! Promptgate - LLM request orchestration and caching gateway
//!
//! Promptgate sits between a prompt-engineering application and its LLM
//! providers. Every request is authorized, validated, served from the
//! response cache when possible, charged against the tenant's token budget,
//! and dispatched with retries. Identical requests in flight at the same
//! time share a single provider call. Long-running work can be submitted as
//! background jobs and polled.
//!
//! # Example
//!
//! ```rust,no_run
//! use promptgate::{ChatRequest, Message, Promptgate};
//!
//! #[tokio::main]
//! async fn main() -> promptgate::Result<()> {
//!     let gateway = Promptgate::builder()
//!         .openrouter("sk-or-your-key")
//!         .build()?;
//!
//!     let request = ChatRequest::new(vec![
//!         Message::system("You are a helpful assistant."),
//!         Message::user("What is the capital of France?"),
//!     ])
//!     .model("anthropic/claude-3.5-sonnet")
//!     .tenant("acme");
//!
//!     let completion = gateway.submit(request.clone()).await?;
//!     println!("{}", completion.content);
//!
//!     // Same request as a background job.
//!     let job = gateway.submit_async(request).await?;
//!     println!("{:?}", gateway.poll(&job).await?.state);
//!
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod budget;
pub mod cache;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod jobs;
pub mod providers;
#[cfg(feature = "server")]
pub mod server;
pub mod telemetry;
pub mod types;
pub mod version;

// Re-export main types at crate root
pub use budget::{BudgetConfig, BudgetUsage, Reservation, TokenBudgeter};
pub use cache::{CacheBackend, CacheConfig, CacheEntry, MemoryCacheBackend, ResponseCache};
pub use dispatch::{DispatchReport, Dispatcher};
pub use error::{ErrorKind, PromptgateError, Result, Retryability};
pub use gateway::{AdapterHealth, Gateway, Promptgate, PromptgateBuilder, ValidationLimits};
pub use identity::{AllowAll, IdentityProvider, StaticKeyIdentity, Verdict};
pub use jobs::{JobConfig, JobQueue, JobRunner, JobStore, MemoryJobStore, RunOutcome};
pub use providers::{ProviderAdapter, RetryConfig, RoutingConfig};

pub use types::{
    Caller, ChatRequest, Completion, Fingerprint, FinishReason, JobError, JobId, JobRecord,
    JobState, JobStatus, Message, ModelInfo, Priority, Role, SamplingParams, TenantId, Usage,
};
