//! Provider dispatch with retries and in-flight deduplication.
//!
//! [`Dispatcher::dispatch`] guarantees at most one outbound provider call
//! per fingerprint. The owner's call runs in a spawned task so a caller that
//! gives up cannot strand the others; the call itself is cancelled only
//! once nobody is waiting for it.
//!
//! On success the owner writes the response cache, then releases the
//! in-flight slot, then wakes waiters. A caller arriving in between finds
//! the cache entry.
//!
//! The owner's budget reservation travels with the spawned call and is
//! settled there, so the call is charged even if the owning caller leaves
//! early. Waiters' reservations are released once the shared result arrives.

pub mod inflight;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::budget::Reservation;
use crate::cache::ResponseCache;
use crate::providers::retry::{RetryConfig, with_retry};
use crate::providers::routing::{Selection, select_adapter};
use crate::providers::ProviderAdapter;
use crate::telemetry;
use crate::types::{ChatRequest, Completion, Fingerprint};
use crate::{PromptgateError, Result};

use inflight::{InFlightTable, Join, Outcome, Publisher};

/// What a dispatch produced for one caller.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub completion: Completion,
    /// Provider attempts made by the call that produced the result. Zero when
    /// the owner found the result already cached.
    pub attempts: u32,
    /// Whether this caller joined a call started by someone else.
    pub shared: bool,
}

impl DispatchReport {
    /// Whether this caller's own call incurred provider cost.
    pub fn incurred_cost(&self) -> bool {
        !self.shared && !self.completion.cached && self.attempts > 0
    }
}

/// Selects adapters and runs deduplicated, retried provider calls.
pub struct Dispatcher {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    retry: RetryConfig,
    cache: Arc<ResponseCache>,
    inflight: Arc<InFlightTable>,
}

impl Dispatcher {
    /// `adapters` must already be in default routing order.
    pub fn new(
        adapters: Vec<Arc<dyn ProviderAdapter>>,
        retry: RetryConfig,
        cache: Arc<ResponseCache>,
    ) -> Self {
        Self {
            adapters,
            retry,
            cache,
            inflight: Arc::new(InFlightTable::new()),
        }
    }

    pub fn adapters(&self) -> &[Arc<dyn ProviderAdapter>] {
        &self.adapters
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Number of provider calls currently running.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Pick the adapter and model for `request`.
    pub fn select(&self, request: &ChatRequest) -> Result<Selection> {
        select_adapter(&self.adapters, request.model.as_deref())
    }

    /// Dispatch with the default retry policy.
    pub async fn dispatch(
        &self,
        selection: &Selection,
        request: &ChatRequest,
        fingerprint: &Fingerprint,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport> {
        self.dispatch_with(selection, request, fingerprint, &self.retry, cancel)
            .await
    }

    /// Dispatch `request` (model already resolved) under `retry`.
    ///
    /// `cancel` detaches this caller only. The retry policy applies when this
    /// caller ends up owning the call.
    pub async fn dispatch_with(
        &self,
        selection: &Selection,
        request: &ChatRequest,
        fingerprint: &Fingerprint,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport> {
        let outcome = self
            .dispatch_outcome(selection, request, fingerprint, retry, cancel)
            .await;
        Ok(DispatchReport {
            completion: outcome.result?,
            attempts: outcome.attempts,
            shared: outcome.shared,
        })
    }

    /// Like [`dispatch_with`](Self::dispatch_with), but keeps the attempt
    /// count on failure too.
    pub async fn dispatch_outcome(
        &self,
        selection: &Selection,
        request: &ChatRequest,
        fingerprint: &Fingerprint,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        self.run(selection, request, fingerprint, retry, cancel, None)
            .await
    }

    /// Dispatch on behalf of a caller holding `reservation`.
    ///
    /// If this caller owns the call, the reservation is settled against the
    /// provider's reported usage by the call itself, whether or not the
    /// caller is still waiting. Otherwise it is released once the caller
    /// is done.
    pub async fn dispatch_charged(
        &self,
        selection: &Selection,
        request: &ChatRequest,
        fingerprint: &Fingerprint,
        retry: &RetryConfig,
        cancel: &CancellationToken,
        reservation: Reservation,
    ) -> DispatchOutcome {
        self.run(selection, request, fingerprint, retry, cancel, Some(reservation))
            .await
    }

    #[instrument(
        name = "dispatch",
        skip_all,
        fields(fingerprint = fingerprint.short(), provider = selection.adapter.name(), model = %selection.model)
    )]
    async fn run(
        &self,
        selection: &Selection,
        request: &ChatRequest,
        fingerprint: &Fingerprint,
        retry: &RetryConfig,
        cancel: &CancellationToken,
        reservation: Option<Reservation>,
    ) -> DispatchOutcome {
        let (mut interest, shared, _held) = match self.inflight.join(fingerprint) {
            Join::Owner {
                publisher,
                interest,
            } => {
                let call = OwnerCall {
                    adapter: Arc::clone(&selection.adapter),
                    request: request.clone(),
                    fingerprint: fingerprint.clone(),
                    cache: Arc::clone(&self.cache),
                    retry: retry.clone(),
                    reservation,
                };
                tokio::spawn(call.run(publisher));
                (interest, false, None)
            }
            Join::Waiter(interest) => {
                debug!("joined in-flight call");
                metrics::counter!(telemetry::INFLIGHT_COALESCED_TOTAL).increment(1);
                (interest, true, reservation)
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => DispatchOutcome {
                result: Err(PromptgateError::Cancelled),
                attempts: interest.attempts(),
                shared,
            },
            outcome = interest.wait() => DispatchOutcome {
                result: outcome.result,
                attempts: outcome.attempts,
                shared,
            },
        }
    }
}

/// Full result of a dispatch, successful or not.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub result: Result<Completion>,
    pub attempts: u32,
    pub shared: bool,
}

/// Everything the spawned owner task needs, owned.
struct OwnerCall {
    adapter: Arc<dyn ProviderAdapter>,
    request: ChatRequest,
    fingerprint: Fingerprint,
    cache: Arc<ResponseCache>,
    retry: RetryConfig,
    reservation: Option<Reservation>,
}

impl OwnerCall {
    async fn run(mut self, publisher: Publisher) {
        // A previous owner may have finished between the caller's cache miss
        // and this task registering. Dropping the reservation releases it.
        if let Some(entry) = self.cache.lookup(&self.fingerprint).await {
            let mut completion = entry.completion;
            completion.cached = true;
            publisher.publish(Outcome {
                result: Ok(completion),
                attempts: 0,
            });
            return;
        }

        let cancel = publisher.cancel_token();
        let adapter = &self.adapter;
        let request = &self.request;
        let deadline = self.retry.attempt_timeout;
        let token = &cancel;
        let attempts = &publisher;
        let outcome = with_retry(
            &self.retry,
            adapter.name(),
            &cancel,
            |e| adapter.classify(e),
            move |_| {
                attempts.record_attempt();
                adapter.complete(request, deadline, token)
            },
        )
        .await;

        if let Some(reservation) = self.reservation.take() {
            match &outcome.result {
                Ok(completion) if outcome.attempts > 0 => {
                    let reported = u64::from(completion.usage.total_tokens);
                    // Providers that report no usage are charged the estimate.
                    let actual = if reported == 0 {
                        reservation.amount()
                    } else {
                        reported
                    };
                    reservation.settle(actual);
                }
                _ => reservation.release(),
            }
        }

        if let Ok(completion) = &outcome.result {
            record_usage(completion);
            self.cache
                .store(&self.fingerprint, completion.clone())
                .await;
        }
        publisher.publish(Outcome {
            result: outcome.result,
            attempts: outcome.attempts,
        });
    }
}

fn record_usage(completion: &Completion) {
    let usage = completion.usage;
    metrics::counter!(telemetry::TOKENS_TOTAL,
        "model" => completion.model.clone(),
        "direction" => "prompt",
    )
    .increment(u64::from(usage.prompt_tokens));
    metrics::counter!(telemetry::TOKENS_TOTAL,
        "model" => completion.model.clone(),
        "direction" => "completion",
    )
    .increment(u64::from(usage.completion_tokens));
}
