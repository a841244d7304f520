//! Tests for [`Dispatcher`]: in-flight coalescing, retries, cancellation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use promptgate::cache::{CacheConfig, ResponseCache};
use promptgate::dispatch::Dispatcher;
use promptgate::providers::{ProviderAdapter, RetryConfig};
use promptgate::{ChatRequest, Completion, Fingerprint, Message, PromptgateError, Result, Usage};

// ============================================================================
// Mock adapter
// ============================================================================

/// Adapter that plays back scripted results, then succeeds.
struct ScriptedAdapter {
    calls: AtomicU32,
    script: Mutex<VecDeque<PromptgateError>>,
    delay: Duration,
}

impl ScriptedAdapter {
    fn new(delay: Duration) -> Self {
        Self {
            calls: AtomicU32::new(0),
            script: Mutex::new(VecDeque::new()),
            delay,
        }
    }

    fn failing_with(self, errors: impl IntoIterator<Item = PromptgateError>) -> Self {
        self.script.lock().unwrap().extend(errors);
        self
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        _deadline: Duration,
        _cancel: &CancellationToken,
    ) -> Result<Completion> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        if let Some(err) = self.script.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(Completion {
            content: format!("answer #{n}"),
            model: request.model.clone().unwrap_or_default(),
            provider: "scripted".to_string(),
            usage: Usage::new(10, 5),
            ..Completion::default()
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn setup(adapter: Arc<ScriptedAdapter>, retry: RetryConfig) -> (Arc<Dispatcher>, Arc<ResponseCache>) {
    let cache = Arc::new(ResponseCache::new(&CacheConfig::default()));
    let dispatcher = Dispatcher::new(vec![adapter], retry, Arc::clone(&cache));
    (Arc::new(dispatcher), cache)
}

fn request() -> ChatRequest {
    ChatRequest::new(vec![Message::user("What is a monad?")]).model("mock-model")
}

fn fingerprint(request: &ChatRequest) -> Fingerprint {
    Fingerprint::compute(&request.messages, "mock-model", &request.params)
}

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig::new()
        .max_attempts(max_attempts)
        .initial_delay(Duration::from_millis(100))
        .jitter(false)
}

// ============================================================================
// Coalescing
// ============================================================================

#[tokio::test]
async fn concurrent_identical_requests_share_one_call() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::from_millis(50)));
    let (dispatcher, _cache) = setup(Arc::clone(&adapter), RetryConfig::disabled());
    let request = request();
    let fp = fingerprint(&request);
    let selection = dispatcher.select(&request).unwrap();
    let cancel = CancellationToken::new();

    let reports = join_all((0..5).map(|_| dispatcher.dispatch(&selection, &request, &fp, &cancel))).await;

    assert_eq!(adapter.calls(), 1);
    let reports: Vec<_> = reports.into_iter().map(|r| r.unwrap()).collect();
    assert!(reports.iter().all(|r| r.completion == reports[0].completion));
    assert_eq!(reports.iter().filter(|r| !r.shared).count(), 1);
    assert_eq!(reports.iter().filter(|r| r.incurred_cost()).count(), 1);
}

#[tokio::test]
async fn owner_writes_cache_before_releasing_slot() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::from_millis(10)));
    let (dispatcher, cache) = setup(Arc::clone(&adapter), RetryConfig::disabled());
    let request = request();
    let fp = fingerprint(&request);
    let selection = dispatcher.select(&request).unwrap();

    let report = dispatcher
        .dispatch(&selection, &request, &fp, &CancellationToken::new())
        .await
        .unwrap();

    assert!(cache.contains(&fp).await);
    assert_eq!(dispatcher.in_flight(), 0);
    assert_eq!(report.attempts, 1);
    assert!(!report.completion.cached);
}

#[tokio::test]
async fn owner_finding_cached_result_makes_no_call() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::ZERO));
    let (dispatcher, cache) = setup(Arc::clone(&adapter), RetryConfig::disabled());
    let request = request();
    let fp = fingerprint(&request);
    cache
        .store(
            &fp,
            Completion {
                content: "from cache".to_string(),
                ..Completion::default()
            },
        )
        .await;

    let selection = dispatcher.select(&request).unwrap();
    let report = dispatcher
        .dispatch(&selection, &request, &fp, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(adapter.calls(), 0);
    assert_eq!(report.completion.content, "from cache");
    assert!(report.completion.cached);
    assert!(!report.incurred_cost());
}

#[tokio::test]
async fn different_fingerprints_do_not_coalesce() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::from_millis(20)));
    let (dispatcher, _cache) = setup(Arc::clone(&adapter), RetryConfig::disabled());
    let a = request();
    let b = request().temperature(0.3);
    let (fa, fb) = (fingerprint(&a), fingerprint(&b));
    assert_ne!(fa, fb);
    let selection = dispatcher.select(&a).unwrap();
    let cancel = CancellationToken::new();

    let (ra, rb) = tokio::join!(
        dispatcher.dispatch(&selection, &a, &fa, &cancel),
        dispatcher.dispatch(&selection, &b, &fb, &cancel),
    );
    assert!(ra.is_ok() && rb.is_ok());
    assert_eq!(adapter.calls(), 2);
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let adapter = Arc::new(
        ScriptedAdapter::new(Duration::ZERO).failing_with([
            PromptgateError::RateLimited { retry_after: None },
            PromptgateError::Api {
                status: 503,
                message: "overloaded".to_string(),
            },
        ]),
    );
    let (dispatcher, _cache) = setup(Arc::clone(&adapter), fast_retry(3));
    let request = request();
    let selection = dispatcher.select(&request).unwrap();

    let report = dispatcher
        .dispatch(&selection, &request, &fingerprint(&request), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(adapter.calls(), 3);
    assert_eq!(report.attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_once_for_every_waiter() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::from_millis(5)).failing_with(
        (0..10).map(|_| PromptgateError::Http("connection reset".to_string())),
    ));
    let (dispatcher, _cache) = setup(Arc::clone(&adapter), fast_retry(3));
    let request = request();
    let fp = fingerprint(&request);
    let selection = dispatcher.select(&request).unwrap();
    let retry = fast_retry(3);
    let cancel = CancellationToken::new();

    let outcomes = join_all(
        (0..3).map(|_| dispatcher.dispatch_outcome(&selection, &request, &fp, &retry, &cancel)),
    )
    .await;

    for outcome in &outcomes {
        assert!(matches!(outcome.result, Err(PromptgateError::Http(_))));
        assert_eq!(outcome.attempts, 3);
    }
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(adapter.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_not_retried() {
    let adapter = Arc::new(
        ScriptedAdapter::new(Duration::ZERO).failing_with([PromptgateError::AuthenticationFailed]),
    );
    let (dispatcher, _cache) = setup(Arc::clone(&adapter), fast_retry(5));
    let request = request();
    let selection = dispatcher.select(&request).unwrap();

    let err = dispatcher
        .dispatch(&selection, &request, &fingerprint(&request), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PromptgateError::AuthenticationFailed));
    assert_eq!(adapter.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_after_hint_is_honoured() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::ZERO).failing_with([
        PromptgateError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        },
    ]));
    let (dispatcher, _cache) = setup(Arc::clone(&adapter), fast_retry(2));
    let request = request();
    let selection = dispatcher.select(&request).unwrap();

    let started = tokio::time::Instant::now();
    dispatcher
        .dispatch(&selection, &request, &fingerprint(&request), &CancellationToken::new())
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(7));
    assert_eq!(adapter.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn oversized_retry_after_hint_waits_only_max_delay() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::ZERO).failing_with([
        PromptgateError::RateLimited {
            retry_after: Some(Duration::from_secs(86_400)),
        },
    ]));
    let (dispatcher, _cache) = setup(
        Arc::clone(&adapter),
        fast_retry(2).max_delay(Duration::from_secs(30)),
    );
    let request = request();
    let selection = dispatcher.select(&request).unwrap();

    let started = tokio::time::Instant::now();
    dispatcher
        .dispatch(&selection, &request, &fingerprint(&request), &CancellationToken::new())
        .await
        .unwrap();

    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(30));
    assert!(waited < Duration::from_secs(31));
    assert_eq!(adapter.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_attempt_times_out_as_transient() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::from_secs(30)));
    let retry = RetryConfig::new()
        .max_attempts(2)
        .jitter(false)
        .attempt_timeout(Duration::from_secs(1));
    let (dispatcher, _cache) = setup(Arc::clone(&adapter), retry);
    let request = request();
    let selection = dispatcher.select(&request).unwrap();

    let err = dispatcher
        .dispatch(&selection, &request, &fingerprint(&request), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PromptgateError::Timeout(_)));
    assert_eq!(adapter.calls(), 2);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn cancelling_one_caller_leaves_the_other_served() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::from_secs(2)));
    let (dispatcher, _cache) = setup(Arc::clone(&adapter), RetryConfig::disabled());
    let request = request();
    let fp = fingerprint(&request);
    let selection = dispatcher.select(&request).unwrap();

    let quitter = CancellationToken::new();
    let stayer = CancellationToken::new();
    let quit = async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        quitter.cancel();
    };

    let (left, stayed, ()) = tokio::join!(
        dispatcher.dispatch(&selection, &request, &fp, &quitter),
        dispatcher.dispatch(&selection, &request, &fp, &stayer),
        quit,
    );

    assert!(matches!(left, Err(PromptgateError::Cancelled)));
    assert!(stayed.is_ok());
    assert_eq!(adapter.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn last_caller_leaving_abandons_the_call() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::from_secs(10)));
    let (dispatcher, cache) = setup(Arc::clone(&adapter), RetryConfig::disabled());
    let request = request();
    let fp = fingerprint(&request);
    let selection = dispatcher.select(&request).unwrap();

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });
    let err = dispatcher
        .dispatch(&selection, &request, &fp, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PromptgateError::Cancelled));

    // Let the owner task observe its token.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dispatcher.in_flight(), 0);
    assert!(!cache.contains(&fp).await);

    // A later caller starts a fresh call.
    let report = dispatcher
        .dispatch(&selection, &request, &fp, &CancellationToken::new())
        .await
        .unwrap();
    assert!(!report.shared);
    assert_eq!(adapter.calls(), 2);
}
