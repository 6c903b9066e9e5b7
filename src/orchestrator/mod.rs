//! The facade workers and submitters call.
//!
//! Composes the store, the job queue, and the session/token machinery, and
//! enforces the build/worker state machine. Exactly one orchestrator
//! process is the authority for any given build; transports (HTTP, gRPC)
//! are external collaborators that deliver these operations verbatim.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::scheduler::build::{
    Build, BuildOutcome, BuildStatus, Platform, Worker, WorkerCapabilities, WorkerStatus,
};
use crate::scheduler::queue::JobQueue;
use crate::store::{BlobKind, BlobStore, BuildStore};

/// What a submitter gets back: the build id plus a capability token scoped
/// to that build only.
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub build_id: Uuid,
    pub access_token: String,
}

/// A freshly issued worker session credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub worker_id: Uuid,
    pub grant: TokenGrant,
}

/// A claimed build as handed to a worker.
#[derive(Debug, Clone)]
pub struct JobOffer {
    pub build_id: Uuid,
    pub platform: Platform,
    pub source_ref: Option<String>,
    pub certs_ref: Option<String>,
}

impl JobOffer {
    fn from_build(build: &Build) -> Self {
        Self {
            build_id: build.id,
            platform: build.platform,
            source_ref: build.source_ref.clone(),
            certs_ref: build.certs_ref.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PollResponse {
    pub job: Option<JobOffer>,
    /// Refresh-ahead rotation: set when the caller's token was close to
    /// expiry, already persisted by the time the response is produced.
    pub rotated_token: Option<TokenGrant>,
}

pub struct Orchestrator {
    store: Arc<dyn BuildStore>,
    blobs: Arc<dyn BlobStore>,
    queue: Arc<JobQueue>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn BuildStore>,
        blobs: Arc<dyn BlobStore>,
        config: OrchestratorConfig,
    ) -> Self {
        let queue = Arc::new(JobQueue::new(store.clone()));
        Self {
            store,
            blobs,
            queue,
            config,
        }
    }

    pub fn queue(&self) -> Arc<JobQueue> {
        self.queue.clone()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Rebuild the queue's working set from the store (startup path).
    pub async fn restore(&self) -> Result<()> {
        self.queue.restore().await
    }

    fn issue_grant(&self, now: DateTime<Utc>) -> TokenGrant {
        let ttl = ChronoDuration::from_std(self.config.token_ttl)
            .unwrap_or_else(|_| ChronoDuration::seconds(90));
        TokenGrant {
            token: format!("bf-{}", Uuid::new_v4().simple()),
            expires_at: now + ttl,
        }
    }

    // =========================================================================
    // Submitter surface
    // =========================================================================

    /// Accept a new build: store the source (and optional signing material)
    /// and enqueue it pending.
    pub async fn submit(
        &self,
        platform: Platform,
        source: Bytes,
        certs: Option<Bytes>,
    ) -> Result<SubmitReceipt> {
        let now = Utc::now();
        let access_token = format!("bs-{}", Uuid::new_v4().simple());
        let mut build = Build::new(platform, access_token.clone(), now);

        build.source_ref = Some(self.blobs.put_blob(build.id, BlobKind::Source, source).await?);
        if let Some(certs) = certs {
            build.certs_ref = Some(self.blobs.put_blob(build.id, BlobKind::Certs, certs).await?);
        }

        let build_id = build.id;
        self.queue.enqueue(build).await?;
        Ok(SubmitReceipt {
            build_id,
            access_token,
        })
    }

    fn authorize_submitter<'a>(&self, build: &'a Build, access_token: &str) -> Result<&'a Build> {
        if build.access_token != access_token {
            return Err(OrchestratorError::Unauthorized);
        }
        Ok(build)
    }

    /// Capability-gated status read for the original submitter.
    pub async fn build_status(&self, build_id: Uuid, access_token: &str) -> Result<Build> {
        let build = self
            .store
            .get_build(build_id)
            .await?
            .ok_or(OrchestratorError::BuildNotFound(build_id))?;
        self.authorize_submitter(&build, access_token)?;
        Ok(build)
    }

    /// Submitter-initiated cancellation; works against pending and active
    /// builds alike.
    pub async fn cancel(&self, build_id: Uuid, access_token: &str) -> Result<()> {
        let build = self
            .store
            .get_build(build_id)
            .await?
            .ok_or(OrchestratorError::BuildNotFound(build_id))?;
        self.authorize_submitter(&build, access_token)?;
        self.queue
            .cancel(build_id, "Build cancelled by submitter", Utc::now())
            .await
    }

    pub async fn download_result(&self, build_id: Uuid, access_token: &str) -> Result<Bytes> {
        let build = self.build_status(build_id, access_token).await?;
        if build.status != BuildStatus::Completed {
            return Err(OrchestratorError::BlobNotFound(build_id));
        }
        self.blobs
            .get_blob(build_id, BlobKind::Result)
            .await?
            .ok_or(OrchestratorError::BlobNotFound(build_id))
    }

    // =========================================================================
    // Worker surface
    // =========================================================================

    /// Idempotent registration upsert. A known id keeps its accrued
    /// counters and history and gets fresh identity/session fields; an
    /// unknown or absent id creates a new idle worker.
    pub async fn register(
        &self,
        worker_id: Option<Uuid>,
        name: &str,
        capabilities: WorkerCapabilities,
        active_build_count: u32,
    ) -> Result<Registration> {
        let now = Utc::now();
        let grant = self.issue_grant(now);

        let existing = match worker_id {
            Some(id) => self.store.get_worker(id).await?,
            None => None,
        };

        let worker = match existing {
            Some(mut worker) => {
                worker.name = name.to_string();
                worker.capabilities = capabilities;
                worker.status = WorkerStatus::Idle;
                worker.access_token = grant.token.clone();
                worker.access_token_expires_at = grant.expires_at;
                worker.last_seen_at = now;
                worker.active_build_count = active_build_count;
                self.store.put_worker(worker.clone()).await?;
                tracing::info!(worker_id = %worker.id, name, "Worker reregistered");

                let remaining = self
                    .reconcile_assignments(&worker, active_build_count, now)
                    .await?;
                if remaining > 0 {
                    // Re-registered mid-build (e.g. after a token
                    // rejection): the worker still owns assignments, so it
                    // is building, not idle.
                    worker.status = WorkerStatus::Building;
                    self.store.put_worker(worker.clone()).await?;
                }
                worker
            }
            None => {
                let worker = Worker::new(
                    name.to_string(),
                    capabilities,
                    grant.token.clone(),
                    grant.expires_at,
                    now,
                );
                self.store.put_worker(worker.clone()).await?;
                tracing::info!(worker_id = %worker.id, name, "Worker registered");
                worker
            }
        };

        Ok(Registration {
            worker_id: worker.id,
            grant,
        })
    }

    /// Capacity-drift reconciliation: the store is authoritative. When a
    /// re-registering worker reports fewer active builds than the store has
    /// assigned to it (crash/restart lost them), the surplus assignments
    /// are implicitly abandoned and requeued. Returns how many assignments
    /// the worker still holds afterwards.
    async fn reconcile_assignments(
        &self,
        worker: &Worker,
        reported: u32,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let assigned: Vec<Build> = self
            .store
            .builds_with_status(&[BuildStatus::Assigned, BuildStatus::Building])
            .await?
            .into_iter()
            .filter(|b| b.worker_id == Some(worker.id))
            .collect();

        if assigned.len() <= reported as usize {
            return Ok(assigned.len());
        }

        tracing::warn!(
            worker_id = %worker.id,
            recorded = assigned.len(),
            reported,
            "Worker re-registered with fewer active builds than the store records; \
             requeueing dangling assignments"
        );
        let mut kept = 0;
        for build in &assigned {
            if self.queue.requeue_dangling(build, now).await? {
                tracing::info!(build_id = %build.id, worker_id = %worker.id,
                    "Dangling assignment requeued");
            } else {
                kept += 1;
            }
        }
        Ok(kept)
    }

    async fn authenticate_worker(&self, worker_id: Uuid, token: &str) -> Result<Worker> {
        let worker = self
            .store
            .get_worker(worker_id)
            .await?
            .ok_or(OrchestratorError::WorkerNotFound(worker_id))?;
        if worker.access_token != token || worker.access_token_expires_at < Utc::now() {
            return Err(OrchestratorError::Unauthorized);
        }
        Ok(worker)
    }

    /// Poll for work. Authenticated; rotates the session token refresh-ahead
    /// when its remaining lifetime is short, persisting the new token
    /// before any job (or "no job") is returned, so a worker is never left
    /// holding a token that expires mid-build.
    pub async fn poll(&self, worker_id: Uuid, token: &str) -> Result<PollResponse> {
        let now = Utc::now();
        let mut worker = self.authenticate_worker(worker_id, token).await?;

        worker.last_seen_at = now;
        if worker.status == WorkerStatus::Offline {
            worker.status = WorkerStatus::Idle;
        }

        let refresh_window = ChronoDuration::from_std(self.config.token_refresh_window)
            .unwrap_or_else(|_| ChronoDuration::seconds(30));
        let rotated_token = if worker.access_token_expires_at - now < refresh_window {
            let grant = self.issue_grant(now);
            worker.access_token = grant.token.clone();
            worker.access_token_expires_at = grant.expires_at;
            Some(grant)
        } else {
            None
        };
        self.store.put_worker(worker.clone()).await?;

        let job = self
            .queue
            .claim_next(&worker, now)
            .await?
            .map(|build| JobOffer::from_build(&build));

        Ok(PollResponse { job, rotated_token })
    }

    /// Ownership-validated heartbeat ingest for an in-progress build.
    pub async fn heartbeat(&self, build_id: Uuid, worker_id: Uuid, token: &str) -> Result<()> {
        self.authenticate_worker(worker_id, token).await?;
        self.queue
            .record_heartbeat(build_id, worker_id, Utc::now())
            .await
    }

    /// Terminal result upload. The artifact (if any) is stored before the
    /// terminal transition so a completed build always has its result
    /// available. Duplicate reports are no-ops.
    pub async fn report(
        &self,
        build_id: Uuid,
        worker_id: Uuid,
        token: &str,
        outcome: BuildOutcome,
        artifact: Option<Bytes>,
    ) -> Result<()> {
        self.authenticate_worker(worker_id, token).await?;

        let result_ref = match (&outcome, artifact) {
            (BuildOutcome::Succeeded, Some(artifact)) => Some(
                self.blobs
                    .put_blob(build_id, BlobKind::Result, artifact)
                    .await?,
            ),
            _ => None,
        };
        self.queue
            .complete(build_id, worker_id, &outcome, result_ref, Utc::now())
            .await
    }

    /// Voluntary release of a claimed build back to pending.
    pub async fn abandon(
        &self,
        build_id: Uuid,
        worker_id: Uuid,
        token: &str,
        reason: &str,
    ) -> Result<()> {
        self.authenticate_worker(worker_id, token).await?;
        self.queue
            .abandon(build_id, worker_id, reason, Utc::now())
            .await
    }
}
