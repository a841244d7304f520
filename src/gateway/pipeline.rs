//! Cache, budget and dispatch path shared by both gateway surfaces.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::budget::TokenBudgeter;
use crate::cache::ResponseCache;
use crate::dispatch::Dispatcher;
use crate::jobs::{JobRunner, RunOutcome};
use crate::providers::RetryConfig;
use crate::types::{ChatRequest, Fingerprint};

pub(crate) struct Pipeline {
    pub(crate) cache: Arc<ResponseCache>,
    pub(crate) budgeter: TokenBudgeter,
    pub(crate) dispatcher: Dispatcher,
}

impl Pipeline {
    /// Run an authorized, validated request to completion.
    ///
    /// The tenant charged is `request.caller.tenant`, which the gateway has
    /// already replaced with the verified one.
    pub(crate) async fn execute(
        &self,
        request: &ChatRequest,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let selection = match self.dispatcher.select(request) {
            Ok(selection) => selection,
            Err(e) => return failed(e),
        };
        let mut resolved = request.clone();
        resolved.model = Some(selection.model.clone());
        let fingerprint =
            Fingerprint::compute(&resolved.messages, &selection.model, &resolved.params);

        if let Some(entry) = self.cache.get(&fingerprint).await {
            let mut completion = entry.completion;
            completion.cached = true;
            return RunOutcome {
                result: Ok(completion),
                attempts: 0,
            };
        }

        let tenant = &resolved.caller.tenant;
        let estimate = self
            .budgeter
            .estimate(selection.adapter.count_tokens(&resolved), &resolved.params);
        let reservation = match self.budgeter.reserve(tenant, estimate) {
            Ok(reservation) => reservation,
            Err(e) => return failed(e),
        };

        // The dispatcher settles or releases the reservation; a caller that
        // shared another's call or hit the cache is not charged.
        let outcome = self
            .dispatcher
            .dispatch_charged(&selection, &resolved, &fingerprint, retry, cancel, reservation)
            .await;
        if outcome.shared {
            debug!(%tenant, "result shared, nothing charged");
        }

        RunOutcome {
            result: outcome.result,
            attempts: outcome.attempts,
        }
    }
}

fn failed(e: crate::PromptgateError) -> RunOutcome {
    RunOutcome {
        result: Err(e),
        attempts: 0,
    }
}

#[async_trait]
impl JobRunner for Pipeline {
    async fn run(
        &self,
        request: &ChatRequest,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let retry = self
            .dispatcher
            .retry_config()
            .clone()
            .max_attempts(max_attempts);
        self.execute(request, &retry, cancel).await
    }
}
