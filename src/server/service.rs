//! gRPC service implementation.
//!
//! Callers identify themselves with `authorization: Bearer <key>` metadata;
//! `x-tenant` carries the claimed tenant for deployments that trust it.
//! Job RPCs only see jobs submitted by the caller's own tenant.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::instrument;

use super::proto;
use super::proto::promptgate_server::Promptgate as PromptgateRpc;
use crate::types::{Caller, ChatRequest, JobId, JobStatus};
use crate::{Gateway, PromptgateError};

/// gRPC service that wraps a [`Gateway`].
pub struct PromptgateService {
    gateway: Arc<Gateway>,
}

impl PromptgateService {
    /// Create a new service wrapping the given gateway.
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Poll a job on behalf of `caller`. Jobs owned by other tenants are
    /// reported as missing.
    async fn owned_job(&self, caller: &Caller, job_id: &str) -> Result<(JobId, JobStatus), Status> {
        let tenant = self.gateway.authorize(caller).await?;
        let id = JobId::parse(job_id)?;
        let status = self.gateway.poll(&id).await?;
        if status.tenant != tenant {
            return Err(PromptgateError::JobNotFound(job_id.to_string()).into());
        }
        Ok((id, status))
    }
}

/// Caller identity from request metadata.
fn caller<T>(request: &Request<T>) -> Caller {
    let metadata = request.metadata();
    let tenant = metadata
        .get("x-tenant")
        .and_then(|v| v.to_str().ok())
        .filter(|t| !t.is_empty());
    let mut caller = tenant.map(Caller::new).unwrap_or_default();

    let token = metadata
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = token {
        caller = caller.with_credential(token);
    }
    caller
}

fn chat_request(request: Request<proto::CompleteRequest>) -> Result<ChatRequest, Status> {
    let caller = caller(&request);
    let chat = ChatRequest::try_from(request.into_inner())?;
    Ok(chat.caller(caller))
}

#[tonic::async_trait]
impl PromptgateRpc for PromptgateService {
    #[instrument(name = "rpc.complete", skip_all)]
    async fn complete(
        &self,
        request: Request<proto::CompleteRequest>,
    ) -> Result<Response<proto::CompleteResponse>, Status> {
        let chat = chat_request(request)?;
        let completion = self.gateway.submit(chat).await?;
        Ok(Response::new(completion.into()))
    }

    #[instrument(name = "rpc.submit", skip_all)]
    async fn submit(
        &self,
        request: Request<proto::CompleteRequest>,
    ) -> Result<Response<proto::SubmitResponse>, Status> {
        let chat = chat_request(request)?;
        let id = self.gateway.submit_async(chat).await?;
        Ok(Response::new(proto::SubmitResponse {
            job_id: id.to_string(),
        }))
    }

    async fn get_job(
        &self,
        request: Request<proto::JobRequest>,
    ) -> Result<Response<proto::JobStatus>, Status> {
        let caller = caller(&request);
        let (_, status) = self
            .owned_job(&caller, &request.into_inner().job_id)
            .await?;
        Ok(Response::new(status.into()))
    }

    async fn cancel_job(
        &self,
        request: Request<proto::JobRequest>,
    ) -> Result<Response<proto::JobStatus>, Status> {
        let caller = caller(&request);
        let (id, _) = self
            .owned_job(&caller, &request.into_inner().job_id)
            .await?;
        let status = self.gateway.cancel(&id).await?;
        Ok(Response::new(status.into()))
    }

    async fn health(
        &self,
        _request: Request<proto::HealthRequest>,
    ) -> Result<Response<proto::HealthResponse>, Status> {
        let providers: Vec<proto::ProviderHealth> = self
            .gateway
            .health()
            .into_iter()
            .map(|a| proto::ProviderHealth {
                name: a.name,
                default_model: a.default_model,
                healthy: a.healthy,
            })
            .collect();
        let jobs = self.gateway.jobs();

        Ok(Response::new(proto::HealthResponse {
            healthy: providers.iter().any(|p| p.healthy),
            version: crate::version::version_string(),
            providers,
            in_flight: self.gateway.in_flight() as u32,
            queued_jobs: jobs.queued_len() as u32,
            running_jobs: jobs.running_len() as u32,
        }))
    }

    #[instrument(name = "rpc.list_models", skip_all)]
    async fn list_models(
        &self,
        _request: Request<proto::ListModelsRequest>,
    ) -> Result<Response<proto::ListModelsResponse>, Status> {
        let models = self.gateway.list_models().await?;
        Ok(Response::new(proto::ListModelsResponse {
            models: models.into_iter().map(Into::into).collect(),
        }))
    }

    #[instrument(name = "rpc.get_model", skip_all)]
    async fn get_model(
        &self,
        request: Request<proto::ModelRequest>,
    ) -> Result<Response<proto::ModelInfo>, Status> {
        let model = request.into_inner().model;
        if model.trim().is_empty() {
            return Err(PromptgateError::Validation("model is required".to_string()).into());
        }
        match self.gateway.model_info(&model).await? {
            Some(info) => Ok(Response::new(info.into())),
            None => Err(Status::not_found(format!("unknown model: {model}"))),
        }
    }
}
