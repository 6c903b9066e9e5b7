use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::scheduler::build::{BuildStatus, WorkerStatus};
use crate::scheduler::queue::JobQueue;

/// Lease-like liveness monitor. There is no consensus protocol to detect
/// worker death, so heartbeat silence is the only signal: builds whose
/// worker stopped reporting are failed and their worker freed.
pub struct HeartbeatMonitor {
    queue: Arc<JobQueue>,
    config: OrchestratorConfig,
}

impl HeartbeatMonitor {
    pub fn new(queue: Arc<JobQueue>, config: OrchestratorConfig) -> Self {
        Self { queue, config }
    }

    /// Drive [`sweep_once`](Self::sweep_once) on a fixed interval until
    /// cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        tracing::error!(error = %e, "Heartbeat sweep failed");
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Heartbeat monitor stopping");
                    break;
                }
            }
        }
    }

    /// One sweep over the active builds. Returns the ids of builds
    /// reclaimed in this pass. Takes `now` explicitly so tests can drive
    /// time deterministically.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let active = self
            .queue
            .store()
            .builds_with_status(&[BuildStatus::Assigned, BuildStatus::Building])
            .await?;

        let grace = chrono::Duration::from_std(self.config.grace_period)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let timeout = chrono::Duration::from_std(self.config.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));

        let mut reclaimed = Vec::new();
        let mut just_freed = HashSet::new();
        for build in active {
            let Some(started_at) = build.started_at else {
                tracing::error!(build_id = %build.id, "Active build without started_at, skipping");
                continue;
            };

            // Too young to have sent a first heartbeat; flagging it now
            // would be a false positive.
            if now - started_at < grace {
                continue;
            }

            let silence = now - build.last_heartbeat_at.unwrap_or(started_at);
            if silence <= timeout {
                continue;
            }

            // One-way transition; a worker that resurfaces later is turned
            // away by the terminal-state check on upload.
            if self.queue.fail_for_timeout(&build, silence, now).await? {
                reclaimed.push(build.id);
                just_freed.extend(build.worker_id);
            }
        }

        self.mark_lapsed_workers_offline(now, timeout, &just_freed)
            .await?;
        Ok(reclaimed)
    }

    /// Idle workers whose poll cadence lapsed drift to offline. They come
    /// back to idle on their next successful poll or registration; nothing
    /// is deleted. A building worker is not checked here: while a build
    /// runs, liveness is the build's heartbeat, not the poll cadence.
    async fn mark_lapsed_workers_offline(
        &self,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
        just_freed: &HashSet<Uuid>,
    ) -> Result<()> {
        let store = self.queue.store();
        for mut worker in store.all_workers().await? {
            if worker.status != WorkerStatus::Idle || now - worker.last_seen_at <= timeout {
                continue;
            }
            // A reclaim this pass just returned the worker to idle; it gets
            // until the next sweep to resurface before going offline.
            if just_freed.contains(&worker.id) {
                continue;
            }
            tracing::info!(worker_id = %worker.id, name = %worker.name,
                "Worker silent past timeout, marking offline");
            worker.status = WorkerStatus::Offline;
            store.put_worker(worker).await?;
        }
        Ok(())
    }
}
