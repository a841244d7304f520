//! Job records for asynchronous submissions

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ChatRequest, Completion, Priority, TenantId};
use crate::error::{ErrorKind, PromptgateError};

/// Job identifier handed back by asynchronous submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| PromptgateError::JobNotFound(s.to_string()))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    /// Whether `self -> next` is a legal transition.
    ///
    /// Legal: Queued→Running, Queued→Cancelled, Running→Succeeded,
    /// Running→Failed, Running→Cancelled.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running)
                | (JobState::Queued, JobState::Cancelled)
                | (JobState::Running, JobState::Succeeded)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

/// Failure recorded on a job, reduced to its stable kind and message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PromptgateError> for JobError {
    fn from(err: &PromptgateError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Durable job record as held by a [`JobStore`](crate::jobs::JobStore).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub request: ChatRequest,
    pub state: JobState,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Completion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Provider attempts made on behalf of this job.
    pub attempts: u32,
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every successful write.
    #[serde(default)]
    pub revision: u64,
}

impl JobRecord {
    /// New record in the `Queued` state.
    pub fn queued(request: ChatRequest) -> Self {
        Self {
            id: JobId::new(),
            priority: request.priority,
            request,
            state: JobState::Queued,
            result: None,
            error: None,
            attempts: 0,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            revision: 0,
        }
    }

    /// Caller-facing snapshot.
    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id,
            tenant: self.request.caller.tenant.clone(),
            state: self.state,
            result: self.result.clone(),
            error: self.error.clone(),
            attempts: self.attempts,
            cancel_requested: self.cancel_requested,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// What a caller sees when polling a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    /// Tenant that submitted the job.
    pub tenant: TenantId,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Completion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub attempts: u32,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}
