//! End-to-end tests for [`Gateway`] over a mock adapter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use promptgate::providers::ProviderAdapter;
use promptgate::{
    BudgetConfig, Caller, ChatRequest, Completion, ErrorKind, Gateway, JobConfig, JobId,
    JobRecord, JobState, JobStatus, JobStore, Message, Promptgate, PromptgateError, Result,
    RetryConfig, StaticKeyIdentity, TenantId, Usage,
};

// ============================================================================
// Mock adapter
// ============================================================================

/// Adapter that plays back scripted failures, then succeeds.
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

fn fast_retry() -> RetryConfig {
    RetryConfig::new()
        .initial_delay(Duration::from_millis(5))
        .jitter(false)
}

fn gateway(adapter: &Arc<ScriptedAdapter>) -> Gateway {
    Promptgate::builder()
        .adapter(adapter.clone())
        .retry(fast_retry())
        .build()
        .unwrap()
}

fn request(prompt: &str) -> ChatRequest {
    ChatRequest::new(vec![Message::user(prompt)])
}

fn anonymous() -> TenantId {
    Caller::default().tenant
}

async fn wait_terminal(gateway: &Gateway, id: &JobId) -> JobStatus {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = gateway.poll(id).await.unwrap();
            if status.state.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job did not finish")
}

// ============================================================================
// Builder
// ============================================================================

#[test]
fn builder_without_adapters_is_no_provider() {
    let result = Promptgate::builder().build();
    assert!(matches!(result, Err(PromptgateError::NoProvider)));
}

#[tokio::test]
async fn health_lists_configured_adapters() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::ZERO));
    let gateway = gateway(&adapter);

    let health = gateway.health();
    assert_eq!(health.len(), 1);
    assert_eq!(health[0].name, "scripted");
    assert_eq!(health[0].default_model, "mock-model");
    assert!(health[0].healthy);
}

// ============================================================================
// Synchronous submission
// ============================================================================

#[tokio::test]
async fn submit_resolves_default_model_and_charges_actual_usage() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::ZERO));
    let gateway = gateway(&adapter);

    let completion = gateway.submit(request("hello")).await.unwrap();

    assert_eq!(completion.content, "answer #1");
    assert_eq!(completion.model, "mock-model");
    assert!(!completion.cached);
    assert_eq!(gateway.budget_usage(&anonymous()).consumed, 15);
}

#[tokio::test]
async fn identical_concurrent_requests_make_one_call() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::from_millis(50)));
    let gateway = gateway(&adapter);

    let (a, b) = tokio::join!(
        gateway.submit(request("same question")),
        gateway.submit(request("same question")),
    );

    assert_eq!(adapter.calls(), 1);
    assert_eq!(a.unwrap().content, b.unwrap().content);
    // Only the caller that issued the call is charged.
    assert_eq!(gateway.budget_usage(&anonymous()).consumed, 15);
}

#[tokio::test]
async fn repeated_request_is_served_from_cache() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::ZERO));
    let gateway = gateway(&adapter);

    let first = gateway.submit(request("cache me")).await.unwrap();
    let second = gateway.submit(request("cache me")).await.unwrap();

    assert_eq!(adapter.calls(), 1);
    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(second.content, first.content);
    assert_eq!(gateway.budget_usage(&anonymous()).consumed, 15);
}

#[tokio::test]
async fn estimate_over_budget_is_rejected_before_any_call() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::ZERO));
    let gateway = Promptgate::builder()
        .adapter(adapter.clone())
        .budget(BudgetConfig::new().tenant_ceiling(100))
        .build()
        .unwrap();

    let err = gateway
        .submit(request("expensive").max_tokens(500))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::BudgetExceeded);
    assert_eq!(adapter.calls(), 0);
    assert_eq!(gateway.budget_usage(&anonymous()).consumed, 0);
}

#[tokio::test]
async fn failed_request_releases_reservation() {
    let adapter = Arc::new(
        ScriptedAdapter::new(Duration::ZERO).failing_with([PromptgateError::Api {
            status: 400,
            message: "bad request".to_string(),
        }]),
    );
    let gateway = gateway(&adapter);

    let err = gateway.submit(request("hello")).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ProviderPermanent);
    assert_eq!(adapter.calls(), 1);
    assert_eq!(gateway.budget_usage(&anonymous()).consumed, 0);
}

#[tokio::test]
async fn invalid_request_is_rejected_without_call() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::ZERO));
    let gateway = gateway(&adapter);

    let empty = gateway.submit(ChatRequest::new(vec![])).await.unwrap_err();
    let hot = gateway
        .submit(request("hello").temperature(3.0))
        .await
        .unwrap_err();

    assert_eq!(empty.kind(), ErrorKind::Validation);
    assert_eq!(hot.kind(), ErrorKind::Validation);
    assert_eq!(adapter.calls(), 0);
}

#[tokio::test]
async fn owner_leaving_early_is_still_charged_for_the_call() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::from_millis(200)));
    let gateway = Arc::new(gateway(&adapter));

    let owner = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            gateway
                .submit(request("shared").caller(Caller::new("first")))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let waiter = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            gateway
                .submit(request("shared").caller(Caller::new("second")))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    owner.abort();

    let completion = waiter.await.unwrap().unwrap();

    assert_eq!(adapter.calls(), 1);
    assert_eq!(completion.content, "answer #1");
    assert_eq!(gateway.budget_usage(&TenantId::new("first")).consumed, 15);
    assert_eq!(gateway.budget_usage(&TenantId::new("second")).consumed, 0);
}

// ============================================================================
// Identity
// ============================================================================

#[tokio::test]
async fn identity_denial_is_unauthorized() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::ZERO));
    let gateway = Promptgate::builder()
        .adapter(adapter.clone())
        .identity(Arc::new(StaticKeyIdentity::new().key("k1", "acme")))
        .build()
        .unwrap();

    let err = gateway.submit(request("hello")).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    assert_eq!(adapter.calls(), 0);
}

#[tokio::test]
async fn verified_tenant_is_charged_not_claimed_one() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::ZERO));
    let gateway = Promptgate::builder()
        .adapter(adapter.clone())
        .identity(Arc::new(StaticKeyIdentity::new().key("k1", "acme")))
        .build()
        .unwrap();

    let caller = Caller::new("globex").with_credential("k1");
    gateway.submit(request("hello").caller(caller)).await.unwrap();

    assert_eq!(gateway.budget_usage(&TenantId::new("acme")).consumed, 15);
    assert_eq!(gateway.budget_usage(&TenantId::new("globex")).consumed, 0);
}

// ============================================================================
// Asynchronous submission
// ============================================================================

#[tokio::test]
async fn submitted_job_completes_and_is_pollable() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::ZERO));
    let gateway = gateway(&adapter);

    let id = gateway.submit_async(request("background")).await.unwrap();
    let status = wait_terminal(&gateway, &id).await;

    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.attempts, 1);
    assert_eq!(status.tenant, anonymous());
    assert_eq!(status.result.unwrap().content, "answer #1");
}

#[tokio::test]
async fn job_retries_transient_failures_up_to_job_limit() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::ZERO).failing_with([
        PromptgateError::RateLimited { retry_after: None },
        PromptgateError::Http("connection reset".to_string()),
        PromptgateError::Api {
            status: 503,
            message: "overloaded".to_string(),
        },
    ]));
    let gateway = Promptgate::builder()
        .adapter(adapter.clone())
        .retry(fast_retry().max_attempts(1))
        .jobs(JobConfig::new().max_attempts(5))
        .build()
        .unwrap();

    let id = gateway.submit_async(request("flaky")).await.unwrap();
    let status = wait_terminal(&gateway, &id).await;

    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.attempts, 4);
    assert_eq!(adapter.calls(), 4);
}

#[tokio::test]
async fn cancelled_queued_job_never_reaches_provider() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::from_millis(200)));
    let gateway = Promptgate::builder()
        .adapter(adapter.clone())
        .jobs(JobConfig::new().workers(1))
        .build()
        .unwrap();

    // Occupies the only worker.
    let busy = gateway.submit_async(request("first")).await.unwrap();
    let queued = gateway.submit_async(request("second")).await.unwrap();

    let status = gateway.cancel(&queued).await.unwrap();
    assert_eq!(status.state, JobState::Cancelled);

    wait_terminal(&gateway, &busy).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(adapter.calls(), 1);
    assert_eq!(
        gateway.poll(&queued).await.unwrap().state,
        JobState::Cancelled
    );
}

#[tokio::test]
async fn cancelled_running_job_reports_attempts_made() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::from_secs(10)));
    let gateway = gateway(&adapter);

    let id = gateway.submit_async(request("long")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while adapter.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("call never started");

    gateway.cancel(&id).await.unwrap();
    let status = wait_terminal(&gateway, &id).await;

    assert_eq!(status.state, JobState::Cancelled);
    assert_eq!(status.attempts, 1);
}

#[tokio::test]
async fn admitted_job_keeps_no_credential() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::ZERO));
    let gateway = Promptgate::builder()
        .adapter(adapter.clone())
        .identity(Arc::new(StaticKeyIdentity::new().key("secret-key", "acme")))
        .build()
        .unwrap();

    let caller = Caller::new("acme").with_credential("secret-key");
    let id = gateway
        .submit_async(request("hello").caller(caller))
        .await
        .unwrap();

    let status = wait_terminal(&gateway, &id).await;
    assert_eq!(status.tenant, TenantId::new("acme"));
    assert!(!format!("{status:?}").contains("secret-key"));
}

#[tokio::test]
async fn shutdown_refuses_new_jobs() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::ZERO));
    let gateway = gateway(&adapter);

    gateway.shutdown().await;

    let err = gateway.submit_async(request("late")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueueUnavailable);
    // The synchronous path still works.
    assert!(gateway.submit(request("still here")).await.is_ok());
}

/// Store whose backend is down.
struct BrokenStore;

#[async_trait]
impl JobStore for BrokenStore {
    async fn get(&self, _id: &JobId) -> Result<Option<JobRecord>> {
        Err(down())
    }

    async fn put(&self, _record: JobRecord) -> Result<()> {
        Err(down())
    }

    async fn compare_and_set(&self, _expected_revision: u64, _record: JobRecord) -> Result<bool> {
        Err(down())
    }

    async fn delete(&self, _id: &JobId) -> Result<Option<JobRecord>> {
        Err(down())
    }

    async fn list(&self) -> Result<Vec<JobRecord>> {
        Err(down())
    }
}

fn down() -> PromptgateError {
    PromptgateError::QueueUnavailable("store offline".to_string())
}

#[tokio::test]
async fn unavailable_job_store_fails_only_async_submission() {
    let adapter = Arc::new(ScriptedAdapter::new(Duration::ZERO));
    let gateway = Promptgate::builder()
        .adapter(adapter.clone())
        .retry(fast_retry())
        .job_store(Arc::new(BrokenStore))
        .build()
        .unwrap();

    let err = gateway.submit_async(request("later")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueueUnavailable);
    assert_eq!(adapter.calls(), 0);

    let completion = gateway.submit(request("now")).await.unwrap();
    assert_eq!(completion.content, "answer #1");
}
