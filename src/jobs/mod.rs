//! Asynchronous job queue.
//!
//! Jobs move `Queued → Running → {Succeeded, Failed, Cancelled}` or
//! `Queued → Cancelled`. Every transition is a compare-and-set on the stored
//! record, so a claim and a cancel racing for the same job cannot both win.
//!
//! Claim order is FIFO within a [`Priority`] class, higher classes first.
//! Workers never preempt a running job.
//!
//! ```rust,ignore
//! let queue = JobQueue::new(JobConfig::new().workers(4), Arc::new(MemoryJobStore::new()));
//! queue.start(runner)?;
//! let id = queue.enqueue(request).await?;
//! let status = queue.poll(&id).await?;
//! ```

pub mod store;
mod worker;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use store::{JobStore, MemoryJobStore};

use crate::telemetry;
use crate::types::{
    ChatRequest, Completion, JobError, JobId, JobRecord, JobState, JobStatus, Priority, TenantId,
};
use crate::{PromptgateError, Result};

/// Configuration for the job queue.
///
/// ```rust
/// # use promptgate::JobConfig;
/// # use std::time::Duration;
/// let config = JobConfig::new()
///     .workers(8)
///     .max_attempts(5)
///     .retention(Duration::from_secs(3600));
/// ```
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Worker tasks. Default: 4.
    pub workers: usize,
    /// Provider attempt ceiling per job. Default: 5.
    pub max_attempts: u32,
    /// How long finished jobs stay pollable. Default: 24 hours.
    pub retention: Duration,
    /// Maximum jobs waiting to be claimed. Default: 1,000.
    pub max_queued: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 5,
            retention: Duration::from_secs(24 * 3600),
            max_queued: 1_000,
        }
    }
}

impl JobConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n.max(1);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn max_queued(mut self, n: usize) -> Self {
        self.max_queued = n;
        self
    }
}

/// Result of running one job's request.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub result: Result<Completion>,
    /// Provider attempts made on behalf of the job.
    pub attempts: u32,
}

/// Executes a claimed job's request. Implemented by the gateway pipeline.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(
        &self,
        request: &ChatRequest,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> RunOutcome;
}

/// Priority queue of job ids plus the worker pool that drains it.
pub struct JobQueue {
    config: JobConfig,
    store: Arc<dyn JobStore>,
    pending: Mutex<BTreeMap<Priority, VecDeque<JobId>>>,
    notify: Notify,
    running: DashMap<JobId, CancellationToken>,
    idempotency: DashMap<(TenantId, String), JobId>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    last_sweep: Mutex<Option<Instant>>,
}

impl JobQueue {
    pub fn new(config: JobConfig, store: Arc<dyn JobStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            pending: Mutex::new(BTreeMap::new()),
            notify: Notify::new(),
            running: DashMap::new(),
            idempotency: DashMap::new(),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            last_sweep: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Spawn the worker pool. Requires a tokio runtime.
    pub fn start(self: &Arc<Self>, runner: Arc<dyn JobRunner>) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            PromptgateError::Configuration("job workers require a tokio runtime".to_string())
        })?;
        let mut workers = self.workers.lock();
        for slot in 0..self.config.workers {
            let queue = Arc::clone(self);
            let runner = Arc::clone(&runner);
            workers.push(handle.spawn(worker::run(queue, runner, slot)));
        }
        info!(workers = self.config.workers, "job workers started");
        Ok(())
    }

    /// Stop claiming new jobs and wait for running ones to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for result in futures_util::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "job worker ended abnormally");
            }
        }
    }

    /// Record a new job and queue it for a worker.
    ///
    /// A request carrying an idempotency key already used by the same
    /// tenant returns the existing job instead.
    pub async fn enqueue(&self, request: ChatRequest) -> Result<JobId> {
        if self.shutdown.is_cancelled() {
            return Err(PromptgateError::QueueUnavailable(
                "job queue is shutting down".to_string(),
            ));
        }
        self.sweep_expired().await;

        let record = JobRecord::queued(request);
        let id = record.id;
        let priority = record.priority;

        let key = record
            .request
            .idempotency_key
            .clone()
            .map(|k| (record.request.caller.tenant.clone(), k));
        if let Some(key) = &key {
            let existing = match self.idempotency.entry(key.clone()) {
                Entry::Occupied(e) => Some(*e.get()),
                Entry::Vacant(v) => {
                    v.insert(id);
                    None
                }
            };
            if let Some(existing) = existing {
                if self.store.get(&existing).await?.is_some() {
                    debug!(job = %existing, "idempotent resubmission");
                    return Ok(existing);
                }
                // The earlier job was purged; the key now belongs to this one.
                self.idempotency.insert(key.clone(), id);
            }
        }

        if self.queued_len() >= self.config.max_queued {
            self.forget_key(key.as_ref(), id);
            return Err(PromptgateError::QueueUnavailable(format!(
                "queue full ({} jobs waiting)",
                self.config.max_queued
            )));
        }

        if let Err(e) = self.store.put(record).await {
            self.forget_key(key.as_ref(), id);
            return Err(e);
        }
        self.pending
            .lock()
            .entry(priority)
            .or_default()
            .push_back(id);
        self.notify.notify_one();

        metrics::counter!(telemetry::JOBS_ENQUEUED_TOTAL, "priority" => priority.as_str())
            .increment(1);
        debug!(job = %id, priority = priority.as_str(), "job enqueued");
        Ok(id)
    }

    /// Current status of a job.
    pub async fn poll(&self, id: &JobId) -> Result<JobStatus> {
        self.store
            .get(id)
            .await?
            .map(|r| r.status())
            .ok_or_else(|| PromptgateError::JobNotFound(id.to_string()))
    }

    /// Cancel a job.
    ///
    /// A queued job is cancelled immediately. A running job is marked
    /// cancel-requested and its token is signalled; the worker fixes the
    /// final state. Cancelling a finished job returns its status unchanged.
    pub async fn cancel(&self, id: &JobId) -> Result<JobStatus> {
        loop {
            let current = self
                .store
                .get(id)
                .await?
                .ok_or_else(|| PromptgateError::JobNotFound(id.to_string()))?;

            let mut next = current.clone();
            match current.state {
                JobState::Queued => {
                    next.state = JobState::Cancelled;
                    next.cancel_requested = true;
                    next.finished_at = Some(Utc::now());
                    next.error = Some(JobError::from(&PromptgateError::Cancelled));
                }
                JobState::Running if current.cancel_requested => {
                    self.signal(id);
                    return Ok(current.status());
                }
                JobState::Running => {
                    next.cancel_requested = true;
                }
                _ => return Ok(current.status()),
            }

            if self.store.compare_and_set(current.revision, next.clone()).await? {
                if next.state == JobState::Cancelled {
                    self.remove_pending(id, current.priority);
                    metrics::counter!(telemetry::JOBS_FINISHED_TOTAL, "state" => "cancelled")
                        .increment(1);
                    debug!(job = %id, "queued job cancelled");
                } else {
                    self.signal(id);
                    debug!(job = %id, "cancel requested for running job");
                }
                return Ok(next.status());
            }
        }
    }

    /// Delete a finished job's record.
    pub async fn purge(&self, id: &JobId) -> Result<()> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| PromptgateError::JobNotFound(id.to_string()))?;
        if !record.state.is_terminal() {
            return Err(PromptgateError::Validation(format!(
                "job {id} is {} and cannot be purged",
                record.state.as_str()
            )));
        }
        self.store.delete(id).await?;
        self.forget_record_key(&record);
        Ok(())
    }

    /// Jobs waiting to be claimed.
    pub fn queued_len(&self) -> usize {
        self.pending.lock().values().map(VecDeque::len).sum()
    }

    /// Jobs currently being worked on.
    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    fn signal(&self, id: &JobId) {
        if let Some(token) = self.running.get(id) {
            token.cancel();
        }
    }

    /// Next job id to claim: highest priority class first, FIFO within it.
    fn pop(&self) -> Option<JobId> {
        let mut pending = self.pending.lock();
        pending
            .iter_mut()
            .rev()
            .find_map(|(_, ids)| ids.pop_front())
    }

    fn remove_pending(&self, id: &JobId, priority: Priority) {
        if let Some(ids) = self.pending.lock().get_mut(&priority) {
            ids.retain(|queued| queued != id);
        }
    }

    fn forget_key(&self, key: Option<&(TenantId, String)>, id: JobId) {
        if let Some(key) = key {
            self.idempotency.remove_if(key, |_, current| *current == id);
        }
    }

    fn forget_record_key(&self, record: &JobRecord) {
        let key = record
            .request
            .idempotency_key
            .clone()
            .map(|k| (record.request.caller.tenant.clone(), k));
        self.forget_key(key.as_ref(), record.id);
    }

    /// Drop finished jobs older than the retention window. Runs at most once
    /// per sweep interval, piggybacking on enqueue.
    async fn sweep_expired(&self) {
        let interval = self.config.retention.min(Duration::from_secs(60));
        {
            let mut last = self.last_sweep.lock();
            let now = Instant::now();
            if last.is_some_and(|t| now.duration_since(t) < interval) {
                return;
            }
            *last = Some(now);
        }

        let records = match self.store.list().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "job retention sweep failed");
                return;
            }
        };
        let retention = TimeDelta::from_std(self.config.retention).unwrap_or(TimeDelta::MAX);
        let now = Utc::now();
        for record in records {
            let expired = record.state.is_terminal()
                && record
                    .finished_at
                    .and_then(|t| t.checked_add_signed(retention))
                    .is_some_and(|deadline| deadline <= now);
            if expired {
                if let Err(e) = self.store.delete(&record.id).await {
                    warn!(job = %record.id, error = %e, "failed to purge expired job");
                    continue;
                }
                self.forget_record_key(&record);
                debug!(job = %record.id, "expired job purged");
            }
        }
    }
}
