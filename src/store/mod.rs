//! Persistent store interface.
//!
//! The orchestrator treats storage as an external collaborator: durable
//! Build/Worker records with one atomic primitive,
//! [`BuildStore::compare_and_swap_status`], plus an opaque blob store for
//! source archives and result artifacts keyed by build id. The in-memory
//! [`MemoryStore`] is the reference implementation used by tests and the
//! CLI; a database-backed store plugs in behind the same traits.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::build::{Build, BuildStatus, Worker, WorkerStatus};

pub use memory::MemoryStore;

/// Field updates applied together with a status swap.
///
/// `worker_id` is a double Option: `None` leaves the column untouched,
/// `Some(None)` clears the assignment, `Some(Some(id))` sets it.
#[derive(Debug, Clone, Default)]
pub struct BuildFields {
    pub worker_id: Option<Option<Uuid>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result_ref: Option<String>,
    /// Patch for the owning worker record, committed atomically with the
    /// build swap. A build must never be assigned to a worker still
    /// recorded as idle, so claim/complete/reclaim carry the worker
    /// mutation inside the same conditional update.
    pub worker: Option<WorkerPatch>,
}

impl BuildFields {
    pub fn apply(&self, build: &mut Build) {
        if let Some(worker_id) = self.worker_id {
            build.worker_id = worker_id;
        }
        if let Some(started_at) = self.started_at {
            build.started_at = Some(started_at);
        }
        if let Some(completed_at) = self.completed_at {
            build.completed_at = Some(completed_at);
        }
        if let Some(last_heartbeat_at) = self.last_heartbeat_at {
            build.last_heartbeat_at = Some(last_heartbeat_at);
        }
        if let Some(ref msg) = self.error_message {
            build.error_message = Some(msg.clone());
        }
        if let Some(ref result_ref) = self.result_ref {
            build.result_ref = Some(result_ref.clone());
        }
    }
}

/// Mutation of a worker record piggy-backed on a build status swap.
#[derive(Debug, Clone)]
pub struct WorkerPatch {
    pub worker_id: Uuid,
    pub status: WorkerStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub increment_completed: bool,
    pub increment_failed: bool,
}

impl WorkerPatch {
    pub fn status(worker_id: Uuid, status: WorkerStatus) -> Self {
        Self {
            worker_id,
            status,
            last_seen_at: None,
            increment_completed: false,
            increment_failed: false,
        }
    }

    pub fn seen_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_seen_at = Some(at);
        self
    }

    pub fn counting(mut self, status: BuildStatus) -> Self {
        match status {
            BuildStatus::Completed => self.increment_completed = true,
            BuildStatus::Failed => self.increment_failed = true,
            _ => {}
        }
        self
    }

    pub fn apply(&self, worker: &mut Worker) {
        worker.status = self.status;
        if let Some(at) = self.last_seen_at {
            worker.last_seen_at = at;
        }
        if self.increment_completed {
            worker.builds_completed += 1;
        }
        if self.increment_failed {
            worker.builds_failed += 1;
        }
    }
}

/// Durable table-like storage for Build and Worker records.
///
/// `compare_and_swap_status` is the sole synchronization primitive: a
/// read-then-write whose WHERE-predicate is the expected status. Concurrent
/// claimants race harmlessly; exactly one swap succeeds per build.
#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn get_build(&self, id: Uuid) -> Result<Option<Build>>;
    async fn put_build(&self, build: Build) -> Result<()>;
    async fn builds_with_status(&self, statuses: &[BuildStatus]) -> Result<Vec<Build>>;

    async fn get_worker(&self, id: Uuid) -> Result<Option<Worker>>;
    async fn put_worker(&self, worker: Worker) -> Result<()>;
    async fn all_workers(&self) -> Result<Vec<Worker>>;

    /// Atomically transition `build_id` from `expected` to `new`, applying
    /// `fields` (including any owning-worker patch) in the same commit.
    /// Returns false without side effects if the build's current status is
    /// no longer `expected` (another claimant won, or the build is gone).
    async fn compare_and_swap_status(
        &self,
        build_id: Uuid,
        expected: BuildStatus,
        new: BuildStatus,
        fields: BuildFields,
    ) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobKind {
    Source,
    Certs,
    Result,
}

impl std::fmt::Display for BlobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobKind::Source => write!(f, "source"),
            BlobKind::Certs => write!(f, "certs"),
            BlobKind::Result => write!(f, "result"),
        }
    }
}

/// Opaque payload storage keyed by build id.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put_blob(&self, build_id: Uuid, kind: BlobKind, data: Bytes) -> Result<String>;
    async fn get_blob(&self, build_id: Uuid, kind: BlobKind) -> Result<Option<Bytes>>;
}
