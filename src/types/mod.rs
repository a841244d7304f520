//! Public types for the Promptgate API.

mod fingerprint;
mod job;
mod message;
mod model;
mod options;
mod request;
mod response;

pub use fingerprint::Fingerprint;
pub use job::{JobError, JobId, JobRecord, JobState, JobStatus};
pub use message::{Message, Role};
pub use model::ModelInfo;
pub use options::SamplingParams;
pub use request::{Caller, ChatRequest, Priority, TenantId};
pub use response::{Completion, FinishReason, Usage};
