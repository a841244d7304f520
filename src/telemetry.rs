//! Telemetry metric name constants.
//!
//! Centralised metric names for promptgate operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `promptgate_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `provider`: adapter name (e.g. "openrouter", "openai")
//! - `model`: resolved model identifier
//! - `status`: outcome: "ok" or an [`ErrorKind`](crate::ErrorKind) code
//! - `direction`: token direction: "prompt" or "completion"

/// Total provider calls issued by the dispatcher (one per attempt).
///
/// Labels: `provider`, `model`, `status`.
pub const PROVIDER_CALLS_TOTAL: &str = "promptgate_provider_calls_total";

/// Provider call duration in seconds.
///
/// Labels: `provider`.
pub const PROVIDER_CALL_DURATION_SECONDS: &str = "promptgate_provider_call_duration_seconds";

/// Total retry attempts (not counting the initial request).
///
/// Labels: `provider`.
pub const RETRIES_TOTAL: &str = "promptgate_retries_total";

/// Total tokens consumed, as reported by providers.
///
/// Labels: `model`, `direction` ("prompt" | "completion").
pub const TOKENS_TOTAL: &str = "promptgate_tokens_total";

/// Total gateway requests by surface.
///
/// Labels: `surface` ("sync" | "async"), `status`.
pub const REQUESTS_TOTAL: &str = "promptgate_requests_total";

/// Gateway request duration in seconds, cache hits included.
///
/// Labels: `surface`.
pub const REQUEST_DURATION_SECONDS: &str = "promptgate_request_duration_seconds";

/// Total response cache hits.
pub const CACHE_HITS_TOTAL: &str = "promptgate_cache_hits_total";

/// Total response cache misses.
pub const CACHE_MISSES_TOTAL: &str = "promptgate_cache_misses_total";

/// Total cache operations that degraded to bypass because the backend failed.
///
/// Labels: `operation` ("get" | "put" | "invalidate").
pub const CACHE_DEGRADED_TOTAL: &str = "promptgate_cache_degraded_total";

/// Total callers that joined an existing in-flight call instead of issuing their own.
pub const INFLIGHT_COALESCED_TOTAL: &str = "promptgate_inflight_coalesced_total";

/// Total requests rejected by the token budgeter.
///
/// Labels: `scope` ("request" | "tenant").
pub const BUDGET_REJECTIONS_TOTAL: &str = "promptgate_budget_rejections_total";

/// Total jobs enqueued.
///
/// Labels: `priority`.
pub const JOBS_ENQUEUED_TOTAL: &str = "promptgate_jobs_enqueued_total";

/// Total jobs reaching a terminal state.
///
/// Labels: `state` ("succeeded" | "failed" | "cancelled").
pub const JOBS_FINISHED_TOTAL: &str = "promptgate_jobs_finished_total";
