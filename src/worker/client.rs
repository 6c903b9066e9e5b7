use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::error::ApiError;
use crate::orchestrator::{Orchestrator, PollResponse, Registration};
use crate::scheduler::build::{BuildOutcome, WorkerCapabilities};

/// The wire surface a worker speaks to the orchestrator. The transport
/// framing is an external concern; implementations only have to preserve
/// these semantics. [`LocalClient`] adapts an in-process orchestrator (used
/// by the CLI and tests); a remote HTTP/gRPC client is a drop-in.
#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    async fn register(
        &self,
        worker_id: Option<Uuid>,
        name: &str,
        capabilities: WorkerCapabilities,
        active_build_count: u32,
    ) -> Result<Registration, ApiError>;

    async fn poll(&self, worker_id: Uuid, token: &str) -> Result<PollResponse, ApiError>;

    async fn heartbeat(&self, build_id: Uuid, worker_id: Uuid, token: &str)
        -> Result<(), ApiError>;

    async fn report(
        &self,
        build_id: Uuid,
        worker_id: Uuid,
        token: &str,
        outcome: BuildOutcome,
        artifact: Option<Bytes>,
    ) -> Result<(), ApiError>;

    async fn abandon(
        &self,
        build_id: Uuid,
        worker_id: Uuid,
        token: &str,
        reason: &str,
    ) -> Result<(), ApiError>;
}

/// In-process client for an orchestrator living in the same process.
pub struct LocalClient {
    orchestrator: Arc<Orchestrator>,
}

impl LocalClient {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl OrchestratorClient for LocalClient {
    async fn register(
        &self,
        worker_id: Option<Uuid>,
        name: &str,
        capabilities: WorkerCapabilities,
        active_build_count: u32,
    ) -> Result<Registration, ApiError> {
        self.orchestrator
            .register(worker_id, name, capabilities, active_build_count)
            .await
            .map_err(ApiError::from)
    }

    async fn poll(&self, worker_id: Uuid, token: &str) -> Result<PollResponse, ApiError> {
        self.orchestrator
            .poll(worker_id, token)
            .await
            .map_err(ApiError::from)
    }

    async fn heartbeat(
        &self,
        build_id: Uuid,
        worker_id: Uuid,
        token: &str,
    ) -> Result<(), ApiError> {
        self.orchestrator
            .heartbeat(build_id, worker_id, token)
            .await
            .map_err(ApiError::from)
    }

    async fn report(
        &self,
        build_id: Uuid,
        worker_id: Uuid,
        token: &str,
        outcome: BuildOutcome,
        artifact: Option<Bytes>,
    ) -> Result<(), ApiError> {
        self.orchestrator
            .report(build_id, worker_id, token, outcome, artifact)
            .await
            .map_err(ApiError::from)
    }

    async fn abandon(
        &self,
        build_id: Uuid,
        worker_id: Uuid,
        token: &str,
        reason: &str,
    ) -> Result<(), ApiError> {
        self.orchestrator
            .abandon(build_id, worker_id, token, reason)
            .await
            .map_err(ApiError::from)
    }
}
