//! Worker loop: claim, run, record.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{JobQueue, JobRunner, RunOutcome};
use crate::telemetry;
use crate::types::{JobError, JobId, JobState};
use crate::{PromptgateError, Result};

/// Tries at recording a job's terminal state before giving up.
const FINISH_ATTEMPTS: u32 = 4;
const FINISH_RETRY_DELAY: Duration = Duration::from_millis(50);

pub(super) async fn run(queue: Arc<JobQueue>, runner: Arc<dyn JobRunner>, slot: usize) {
    debug!(slot, "job worker ready");
    loop {
        let id = tokio::select! {
            biased;
            _ = queue.shutdown.cancelled() => break,
            id = next(&queue) => id,
        };
        if let Err(e) = process(&queue, runner.as_ref(), &id).await {
            warn!(slot, job = %id, error = %e, "job store unavailable while processing");
        }
    }
    debug!(slot, "job worker stopped");
}

async fn next(queue: &JobQueue) -> JobId {
    loop {
        if let Some(id) = queue.pop() {
            return id;
        }
        queue.notify.notified().await;
    }
}

async fn process(queue: &JobQueue, runner: &dyn JobRunner, id: &JobId) -> Result<()> {
    let Some(current) = queue.store.get(id).await? else {
        return Ok(());
    };
    if current.state != JobState::Queued {
        return Ok(());
    }

    // Registered before the claim so a cancel landing right after it finds
    // the token.
    let token = CancellationToken::new();
    queue.running.insert(*id, token.clone());

    let mut claimed = current.clone();
    claimed.state = JobState::Running;
    claimed.started_at = Some(Utc::now());
    match queue.store.compare_and_set(current.revision, claimed).await {
        Ok(true) => {}
        Ok(false) => {
            queue.running.remove(id);
            return Ok(());
        }
        Err(e) => {
            queue.running.remove(id);
            return Err(e);
        }
    }
    debug!(job = %id, "job claimed");

    let outcome = runner
        .run(&current.request, queue.config.max_attempts, &token)
        .await;
    queue.running.remove(id);

    // A lost terminal write leaves the record Running.
    let mut delay = FINISH_RETRY_DELAY;
    let mut tries = 1;
    loop {
        match finish(queue, id, &outcome, &token).await {
            Ok(()) => return Ok(()),
            Err(e) if tries < FINISH_ATTEMPTS => {
                warn!(job = %id, error = %e, tries, "recording job outcome failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                tries += 1;
            }
            Err(e) => {
                error!(job = %id, error = %e, tries, "job outcome lost, record left running");
                return Err(e);
            }
        }
    }
}

/// Move a running job to its terminal state.
async fn finish(
    queue: &JobQueue,
    id: &JobId,
    outcome: &RunOutcome,
    token: &CancellationToken,
) -> Result<()> {
    loop {
        let Some(current) = queue.store.get(id).await? else {
            return Ok(());
        };
        if current.state != JobState::Running {
            return Ok(());
        }

        let mut next = current.clone();
        next.attempts = outcome.attempts;
        next.finished_at = Some(Utc::now());
        if current.cancel_requested || token.is_cancelled() {
            next.state = JobState::Cancelled;
            next.error = Some(JobError::from(&PromptgateError::Cancelled));
        } else {
            match &outcome.result {
                Ok(completion) => {
                    next.state = JobState::Succeeded;
                    next.result = Some(completion.clone());
                }
                Err(e) => {
                    next.state = JobState::Failed;
                    next.error = Some(JobError::from(e));
                }
            }
        }
        debug_assert!(current.state.can_transition_to(next.state));

        if queue.store.compare_and_set(current.revision, next.clone()).await? {
            metrics::counter!(telemetry::JOBS_FINISHED_TOTAL, "state" => next.state.as_str())
                .increment(1);
            debug!(job = %id, state = next.state.as_str(), attempts = next.attempts, "job finished");
            return Ok(());
        }
    }
}
