use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::build::BuildStatus;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Build not found: {0}")]
    BuildNotFound(Uuid),

    #[error("Worker not found: {0}")]
    WorkerNotFound(Uuid),

    #[error("Build {build_id} is not owned by worker {worker_id}")]
    NotOwner { build_id: Uuid, worker_id: Uuid },

    #[error("Build {0} has already reached a terminal state")]
    BuildTerminal(Uuid),

    #[error("Invalid or expired access token")]
    Unauthorized,

    #[error("Illegal build status transition: {from} -> {to}")]
    InvalidTransition { from: BuildStatus, to: BuildStatus },

    #[error("Blob not found for build {0}")]
    BlobNotFound(Uuid),

    #[error("Store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors a worker observes when talking to the orchestrator, classified
/// the way the session manager needs them. `Unauthorized` and
/// `UnknownWorker` drive the two distinct re-registration paths; everything
/// else is either a hard rejection or a retryable transport problem.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Token invalid or expired (401-equivalent). The worker identity is
    /// still believed good; re-register preserving the id.
    #[error("Access token rejected")]
    Unauthorized,

    /// Worker id unknown to the server (404-equivalent), e.g. after a
    /// server-side store reset. Re-register with a fresh identity.
    #[error("Worker id unknown to the server")]
    UnknownWorker,

    /// Request was understood but refused (ownership violation, terminal
    /// build). Not retryable as-is.
    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Unauthorized => ApiError::Unauthorized,
            OrchestratorError::WorkerNotFound(_) => ApiError::UnknownWorker,
            OrchestratorError::NotOwner { .. }
            | OrchestratorError::BuildTerminal(_)
            | OrchestratorError::InvalidTransition { .. } => ApiError::Rejected(err.to_string()),
            other => ApiError::Transport(other.to_string()),
        }
    }
}
