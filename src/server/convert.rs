//! Conversions between promptgate native types and protobuf types.
//!
//! Proto → native for requests, native → proto for responses, and
//! [`PromptgateError`] → [`tonic::Status`] for failures.

use chrono::{DateTime, Utc};
use tonic::metadata::MetadataValue;
use tonic::{Code, Status};

use crate::{
    ChatRequest, Completion, ErrorKind, FinishReason, JobError, JobState, JobStatus, Message,
    ModelInfo, Priority, PromptgateError, Role, SamplingParams, Usage,
};

use super::proto;

// =============================================================================
// From Proto → Native (incoming requests)
// =============================================================================

impl TryFrom<proto::Message> for Message {
    type Error = PromptgateError;

    fn try_from(p: proto::Message) -> Result<Self, Self::Error> {
        let role = match proto::Role::try_from(p.role).unwrap_or(proto::Role::Unspecified) {
            proto::Role::System => Role::System,
            proto::Role::User => Role::User,
            proto::Role::Assistant => Role::Assistant,
            proto::Role::Unspecified => {
                return Err(PromptgateError::Validation(
                    "message role is required".to_string(),
                ));
            }
        };
        Ok(Message {
            role,
            content: p.content,
        })
    }
}

impl From<proto::SamplingParams> for SamplingParams {
    fn from(p: proto::SamplingParams) -> Self {
        SamplingParams {
            temperature: p.temperature,
            max_tokens: p.max_tokens,
            top_p: p.top_p,
            stop: if p.stop.is_empty() { None } else { Some(p.stop) },
            frequency_penalty: p.frequency_penalty,
            presence_penalty: p.presence_penalty,
            seed: p.seed,
        }
    }
}

impl From<proto::Priority> for Priority {
    fn from(p: proto::Priority) -> Self {
        match p {
            proto::Priority::Low => Priority::Low,
            proto::Priority::Normal => Priority::Normal,
            proto::Priority::High => Priority::High,
        }
    }
}

impl TryFrom<proto::CompleteRequest> for ChatRequest {
    type Error = PromptgateError;

    fn try_from(p: proto::CompleteRequest) -> Result<Self, Self::Error> {
        let priority = proto::Priority::try_from(p.priority).unwrap_or(proto::Priority::Normal);
        let messages = p
            .messages
            .into_iter()
            .map(Message::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let mut request = ChatRequest::new(messages)
            .params(p.params.map(Into::into).unwrap_or_default())
            .priority(priority.into());
        request.model = p.model;
        request.idempotency_key = p.idempotency_key;
        Ok(request)
    }
}

// =============================================================================
// From Native → Proto (outgoing responses)
// =============================================================================

impl From<Usage> for proto::Usage {
    fn from(u: Usage) -> Self {
        proto::Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

impl From<FinishReason> for proto::FinishReason {
    fn from(r: FinishReason) -> Self {
        match r {
            FinishReason::Stop => proto::FinishReason::Stop,
            FinishReason::Length => proto::FinishReason::Length,
            FinishReason::ContentFilter => proto::FinishReason::ContentFilter,
            FinishReason::Other => proto::FinishReason::Other,
        }
    }
}

impl From<Completion> for proto::CompleteResponse {
    fn from(c: Completion) -> Self {
        proto::CompleteResponse {
            content: c.content,
            model: c.model,
            provider: c.provider,
            usage: Some(c.usage.into()),
            finish_reason: proto::FinishReason::from(c.finish_reason) as i32,
            cached: c.cached,
        }
    }
}

impl From<JobState> for proto::JobState {
    fn from(s: JobState) -> Self {
        match s {
            JobState::Queued => proto::JobState::Queued,
            JobState::Running => proto::JobState::Running,
            JobState::Succeeded => proto::JobState::Succeeded,
            JobState::Failed => proto::JobState::Failed,
            JobState::Cancelled => proto::JobState::Cancelled,
        }
    }
}

impl From<JobError> for proto::JobError {
    fn from(e: JobError) -> Self {
        proto::JobError {
            code: e.kind.code().to_string(),
            message: e.message,
        }
    }
}

impl From<JobStatus> for proto::JobStatus {
    fn from(s: JobStatus) -> Self {
        proto::JobStatus {
            job_id: s.id.to_string(),
            state: proto::JobState::from(s.state) as i32,
            result: s.result.map(Into::into),
            error: s.error.map(Into::into),
            attempts: s.attempts,
            cancel_requested: s.cancel_requested,
            created_at_ms: millis(s.created_at),
            started_at_ms: s.started_at.map(millis),
            finished_at_ms: s.finished_at.map(millis),
        }
    }
}

impl From<ModelInfo> for proto::ModelInfo {
    fn from(m: ModelInfo) -> Self {
        proto::ModelInfo {
            id: m.id,
            provider: m.provider,
            name: m.name,
            description: m.description,
            context_length: m.context_length,
            max_completion_tokens: m.max_completion_tokens,
            prompt_cost_per_mtok: m.prompt_cost_per_mtok,
            completion_cost_per_mtok: m.completion_cost_per_mtok,
        }
    }
}

fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

// =============================================================================
// Errors
// =============================================================================

/// gRPC code for an error kind.
pub fn status_code(kind: ErrorKind) -> Code {
    match kind {
        ErrorKind::Validation => Code::InvalidArgument,
        ErrorKind::Unauthorized => Code::Unauthenticated,
        ErrorKind::BudgetExceeded => Code::ResourceExhausted,
        ErrorKind::ProviderTransient
        | ErrorKind::CacheUnavailable
        | ErrorKind::QueueUnavailable => Code::Unavailable,
        ErrorKind::ProviderPermanent => Code::FailedPrecondition,
        ErrorKind::Cancelled => Code::Cancelled,
        ErrorKind::NotFound => Code::NotFound,
        ErrorKind::Configuration => Code::Internal,
    }
}

impl From<PromptgateError> for Status {
    fn from(err: PromptgateError) -> Self {
        let kind = err.kind();
        let mut status = Status::new(status_code(kind), err.to_string());
        status
            .metadata_mut()
            .insert("x-error-code", MetadataValue::from_static(kind.code()));
        status
    }
}
