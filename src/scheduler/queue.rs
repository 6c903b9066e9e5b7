use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::scheduler::build::{Build, BuildOutcome, BuildStatus, Platform, Worker, WorkerStatus};
use crate::store::{BuildFields, BuildStore, WorkerPatch};

/// In-memory view of the queue. A cache over the store, never the source
/// of truth; [`JobQueue::restore`] rebuilds it from scratch after a
/// restart. The mutex is held only for index mutations, never across a
/// store round-trip.
#[derive(Default)]
struct QueueIndex {
    /// Pending builds in FIFO order (first-submitted, first-served).
    pending: BTreeMap<(DateTime<Utc>, Uuid), Platform>,
    /// Active build -> owning worker.
    active: HashMap<Uuid, Uuid>,
}

impl QueueIndex {
    fn build_for_worker(&self, worker_id: Uuid) -> Option<Uuid> {
        self.active
            .iter()
            .find(|(_, w)| **w == worker_id)
            .map(|(b, _)| *b)
    }
}

/// Hands out at most one pending build per claim request. Concurrent
/// claimants race on the store's conditional update; exactly one wins per
/// build and the losers move on to the next candidate.
pub struct JobQueue {
    store: Arc<dyn BuildStore>,
    index: Mutex<QueueIndex>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn BuildStore>) -> Self {
        Self {
            store,
            index: Mutex::new(QueueIndex::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn BuildStore> {
        &self.store
    }

    pub fn pending_count(&self) -> usize {
        self.index.lock().unwrap().pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.index.lock().unwrap().active.len()
    }

    /// Add a newly submitted build to the pending set. Touches no worker
    /// state.
    pub async fn enqueue(&self, build: Build) -> Result<()> {
        let id = build.id;
        let key = (build.submitted_at, build.id);
        let platform = build.platform;
        self.store.put_build(build).await?;
        self.index.lock().unwrap().pending.insert(key, platform);
        tracing::info!(build_id = %id, platform = %platform, "Build enqueued");
        Ok(())
    }

    /// Rebuild the index from the store after a process restart. The set of
    /// builds considered active afterwards is exactly the set with an
    /// active status in the store.
    pub async fn restore(&self) -> Result<()> {
        let builds = self
            .store
            .builds_with_status(&[
                BuildStatus::Pending,
                BuildStatus::Assigned,
                BuildStatus::Building,
            ])
            .await?;
        let workers = self.store.all_workers().await?;

        let mut index = self.index.lock().unwrap();
        index.pending.clear();
        index.active.clear();
        for build in &builds {
            match build.status {
                BuildStatus::Pending => {
                    index
                        .pending
                        .insert((build.submitted_at, build.id), build.platform);
                }
                BuildStatus::Assigned | BuildStatus::Building => {
                    // Invariant: active builds always carry an owner.
                    if let Some(worker_id) = build.worker_id {
                        index.active.insert(build.id, worker_id);
                    } else {
                        tracing::error!(build_id = %build.id, status = %build.status,
                            "Active build without an owner in the store, skipping");
                    }
                }
                _ => {}
            }
        }
        let (pending, active) = (index.pending.len(), index.active.len());
        drop(index);

        tracing::info!(
            pending,
            active,
            workers = workers.len(),
            "Queue restored from store"
        );
        Ok(())
    }

    /// Claim the oldest pending build matching the worker's platform
    /// capabilities. Returns the worker's existing assignment if it already
    /// holds one (poll is idempotent), `None` when no matching build is
    /// pending.
    pub async fn claim_next(&self, worker: &Worker, now: DateTime<Utc>) -> Result<Option<Build>> {
        // Repeated poll before the worker uploaded a result: hand back the
        // same build instead of claiming a second one.
        let existing = self.index.lock().unwrap().build_for_worker(worker.id);
        if let Some(build_id) = existing {
            let build = self
                .store
                .get_build(build_id)
                .await?
                .ok_or(OrchestratorError::BuildNotFound(build_id))?;
            return Ok(Some(build));
        }

        loop {
            let candidate = {
                let index = self.index.lock().unwrap();
                index
                    .pending
                    .iter()
                    .find(|(_, platform)| worker.capabilities.supports(**platform))
                    .map(|(key, _)| *key)
            };
            let Some((submitted_at, build_id)) = candidate else {
                return Ok(None);
            };

            let fields = BuildFields {
                worker_id: Some(Some(worker.id)),
                started_at: Some(now),
                worker: Some(
                    WorkerPatch::status(worker.id, WorkerStatus::Building).seen_at(now),
                ),
                ..Default::default()
            };
            let won = self
                .store
                .compare_and_swap_status(build_id, BuildStatus::Pending, BuildStatus::Assigned, fields)
                .await?;

            {
                let mut index = self.index.lock().unwrap();
                index.pending.remove(&(submitted_at, build_id));
                if won {
                    index.active.insert(build_id, worker.id);
                }
            }
            if !won {
                // Another claimant got there first. Never retry the same
                // build; move on to the next candidate.
                continue;
            }

            tracing::info!(build_id = %build_id, worker_id = %worker.id, "Build claimed");
            let build = self
                .store
                .get_build(build_id)
                .await?
                .ok_or(OrchestratorError::BuildNotFound(build_id))?;
            return Ok(Some(build));
        }
    }

    /// Transition an active build to its terminal state and return the
    /// owning worker to idle, bumping its counter in the same commit.
    /// Idempotent: a repeat call for an already-terminal build is a logged
    /// no-op, so duplicate result uploads after a retried network call are
    /// harmless.
    pub async fn complete(
        &self,
        build_id: Uuid,
        worker_id: Uuid,
        outcome: &BuildOutcome,
        result_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        loop {
            let build = self
                .store
                .get_build(build_id)
                .await?
                .ok_or(OrchestratorError::BuildNotFound(build_id))?;
            if build.is_terminal() {
                tracing::info!(build_id = %build_id, status = %build.status,
                    "Duplicate completion for terminal build ignored");
                return Ok(());
            }
            if !build.is_owned_by(worker_id) {
                return Err(OrchestratorError::NotOwner {
                    build_id,
                    worker_id,
                });
            }

            let terminal = outcome.terminal_status();
            if !BuildStatus::can_transition(build.status, terminal) {
                return Err(OrchestratorError::InvalidTransition {
                    from: build.status,
                    to: terminal,
                });
            }
            let error_message = match outcome {
                BuildOutcome::Succeeded => None,
                BuildOutcome::Failed { error } => Some(error.clone()),
            };
            let fields = BuildFields {
                completed_at: Some(now),
                error_message,
                result_ref: result_ref.clone(),
                worker: Some(
                    WorkerPatch::status(worker_id, WorkerStatus::Idle)
                        .seen_at(now)
                        .counting(terminal),
                ),
                ..Default::default()
            };
            let swapped = self
                .store
                .compare_and_swap_status(build_id, build.status, terminal, fields)
                .await?;
            if !swapped {
                // The status moved between the read and the swap (our own
                // heartbeat landing assigned -> building, a sweep, an
                // abandon). Re-read and decide from the new state: terminal
                // resolves to the late-upload no-op above, a lost ownership
                // to the owner check.
                continue;
            }

            self.index.lock().unwrap().active.remove(&build_id);
            tracing::info!(build_id = %build_id, worker_id = %worker_id, status = %terminal,
                "Build completed");
            return Ok(());
        }
    }

    /// A worker voluntarily releases a build it cannot complete. The build
    /// goes back to pending (not failed) and is immediately claimable;
    /// `started_at` stays on the record for audit and is overwritten by the
    /// next claim.
    pub async fn abandon(
        &self,
        build_id: Uuid,
        worker_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        loop {
            let build = self
                .store
                .get_build(build_id)
                .await?
                .ok_or(OrchestratorError::BuildNotFound(build_id))?;
            if build.is_terminal() {
                tracing::info!(build_id = %build_id, status = %build.status,
                    "Abandon of terminal build ignored");
                return Ok(());
            }
            if !build.is_owned_by(worker_id) {
                return Err(OrchestratorError::NotOwner {
                    build_id,
                    worker_id,
                });
            }
            if !BuildStatus::can_transition(build.status, BuildStatus::Pending) {
                return Err(OrchestratorError::InvalidTransition {
                    from: build.status,
                    to: BuildStatus::Pending,
                });
            }

            let fields = BuildFields {
                worker_id: Some(None),
                worker: Some(WorkerPatch::status(worker_id, WorkerStatus::Idle).seen_at(now)),
                ..Default::default()
            };
            let swapped = self
                .store
                .compare_and_swap_status(build_id, build.status, BuildStatus::Pending, fields)
                .await?;
            if !swapped {
                // Same recovery as complete: the status moved under us;
                // re-read and decide from the new state.
                continue;
            }

            {
                let mut index = self.index.lock().unwrap();
                index.active.remove(&build_id);
                index
                    .pending
                    .insert((build.submitted_at, build_id), build.platform);
            }
            tracing::info!(build_id = %build_id, worker_id = %worker_id, reason,
                "Build abandoned, requeued");
            return Ok(());
        }
    }

    /// Submitter-initiated cancellation. Same terminal transition as a
    /// liveness timeout but with its own message; a still-pending build is
    /// removed from the queue directly without touching any worker.
    pub async fn cancel(&self, build_id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<()> {
        loop {
            let build = self
                .store
                .get_build(build_id)
                .await?
                .ok_or(OrchestratorError::BuildNotFound(build_id))?;
            if build.is_terminal() {
                tracing::info!(build_id = %build_id, status = %build.status,
                    "Cancel of terminal build ignored");
                return Ok(());
            }

            let fields = BuildFields {
                worker_id: Some(None),
                completed_at: Some(now),
                error_message: Some(reason.to_string()),
                worker: build
                    .worker_id
                    .map(|w| WorkerPatch::status(w, WorkerStatus::Idle)),
                ..Default::default()
            };
            let swapped = self
                .store
                .compare_and_swap_status(build_id, build.status, BuildStatus::Failed, fields)
                .await?;
            if !swapped {
                // Status moved between the read and the swap (e.g. a claim
                // landed). Re-read and try again from the new state.
                continue;
            }

            {
                let mut index = self.index.lock().unwrap();
                index.pending.remove(&(build.submitted_at, build_id));
                index.active.remove(&build_id);
            }
            tracing::info!(build_id = %build_id, reason, "Build cancelled");
            return Ok(());
        }
    }

    /// Heartbeat ingest for a build currently owned by the calling worker.
    /// The first heartbeat moves the build from assigned to building.
    /// Rejected once the build is terminal, so a sweep that already
    /// reclaimed it wins over a late heartbeat (the status check is
    /// authoritative, not last-write-wins).
    pub async fn record_heartbeat(
        &self,
        build_id: Uuid,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let build = self
            .store
            .get_build(build_id)
            .await?
            .ok_or(OrchestratorError::BuildNotFound(build_id))?;
        if build.is_terminal() {
            return Err(OrchestratorError::BuildTerminal(build_id));
        }
        if !build.is_owned_by(worker_id) {
            return Err(OrchestratorError::NotOwner {
                build_id,
                worker_id,
            });
        }

        let fields = BuildFields {
            last_heartbeat_at: Some(now),
            ..Default::default()
        };
        let swapped = self
            .store
            .compare_and_swap_status(build_id, build.status, BuildStatus::Building, fields)
            .await?;
        if !swapped {
            // A concurrent sweep or abandon changed the status under us.
            return Err(OrchestratorError::BuildTerminal(build_id));
        }
        tracing::debug!(build_id = %build_id, worker_id = %worker_id, "Heartbeat recorded");
        Ok(())
    }

    /// One-way reclaim used by the heartbeat monitor. Returns false when
    /// the build moved on (completed, abandoned) before the swap landed.
    pub(crate) async fn fail_for_timeout(
        &self,
        build: &Build,
        silence: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let message = format!(
            "Build timed out: no heartbeat from worker for {}s",
            silence.num_seconds()
        );
        let fields = BuildFields {
            worker_id: Some(None),
            completed_at: Some(now),
            error_message: Some(message),
            worker: build
                .worker_id
                .map(|w| WorkerPatch::status(w, WorkerStatus::Idle)),
            ..Default::default()
        };
        let swapped = self
            .store
            .compare_and_swap_status(build.id, build.status, BuildStatus::Failed, fields)
            .await?;
        if swapped {
            self.index.lock().unwrap().active.remove(&build.id);
            tracing::warn!(
                build_id = %build.id,
                worker_id = ?build.worker_id,
                silence_secs = silence.num_seconds(),
                "Build failed: heartbeat timeout, worker presumed dead"
            );
        }
        Ok(swapped)
    }

    /// Requeue a dangling assignment whose worker re-registered without
    /// knowing about it (crash/restart capacity drift). The store is
    /// authoritative; the assignment is treated as implicitly abandoned.
    pub(crate) async fn requeue_dangling(&self, build: &Build, now: DateTime<Utc>) -> Result<bool> {
        let fields = BuildFields {
            worker_id: Some(None),
            worker: build
                .worker_id
                .map(|w| WorkerPatch::status(w, WorkerStatus::Idle).seen_at(now)),
            ..Default::default()
        };
        let swapped = self
            .store
            .compare_and_swap_status(build.id, build.status, BuildStatus::Pending, fields)
            .await?;
        if swapped {
            let mut index = self.index.lock().unwrap();
            index.active.remove(&build.id);
            index
                .pending
                .insert((build.submitted_at, build.id), build.platform);
        }
        Ok(swapped)
    }
}
