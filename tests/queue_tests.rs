
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use buildfleet::error::{OrchestratorError, Result as StoreResult};
use buildfleet::scheduler::build::{
    Build, BuildOutcome, BuildStatus, Platform, Worker, WorkerStatus,
};
use buildfleet::scheduler::JobQueue;
use buildfleet::store::{BuildFields, BuildStore, MemoryStore};
use test_harness::seed_worker;

fn new_queue() -> (Arc<MemoryStore>, JobQueue) {
    let store = Arc::new(MemoryStore::new());
    let queue = JobQueue::new(store.clone());
    (store, queue)
}

fn pending_build(platform: Platform, submitted_at: chrono::DateTime<Utc>) -> Build {
    Build::new(platform, format!("tok-{}", Uuid::new_v4().simple()), submitted_at)
}

#[tokio::test]
async fn test_claim_is_fifo() {
    let (store, queue) = new_queue();
    let worker = seed_worker(&store, "w1", vec![Platform::Ios]).await;

    let t0 = Utc::now();
    let first = pending_build(Platform::Ios, t0);
    let second = pending_build(Platform::Ios, t0 + ChronoDuration::seconds(1));
    let first_id = first.id;
    queue.enqueue(second).await.unwrap();
    queue.enqueue(first).await.unwrap();

    let claimed = queue.claim_next(&worker, Utc::now()).await.unwrap().unwrap();
    assert_eq!(claimed.id, first_id, "oldest submission should be claimed first");
    assert_eq!(claimed.status, BuildStatus::Assigned);
    assert_eq!(claimed.worker_id, Some(worker.id));
    assert!(claimed.started_at.is_some());
}

#[tokio::test]
async fn test_claim_filters_by_platform() {
    let (store, queue) = new_queue();
    let android_worker = seed_worker(&store, "droid", vec![Platform::Android]).await;

    let t0 = Utc::now();
    let ios = pending_build(Platform::Ios, t0);
    let android = pending_build(Platform::Android, t0 + ChronoDuration::seconds(1));
    let android_id = android.id;
    queue.enqueue(ios).await.unwrap();
    queue.enqueue(android).await.unwrap();

    // The ios build is older but outside this worker's capabilities.
    let claimed = queue
        .claim_next(&android_worker, Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, android_id);
}

#[tokio::test]
async fn test_claim_empty_queue_returns_none() {
    let (store, queue) = new_queue();
    let worker = seed_worker(&store, "w1", vec![Platform::Ios]).await;
    assert!(queue.claim_next(&worker, Utc::now()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_claims_exactly_one_winner() {
    let (store, queue) = new_queue();
    let queue = Arc::new(queue);

    let build = pending_build(Platform::Ios, Utc::now());
    let build_id = build.id;
    queue.enqueue(build).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let worker = seed_worker(&store, &format!("w{}", i), vec![Platform::Ios]).await;
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue.claim_next(&worker, Utc::now()).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if let Some(build) = handle.await.unwrap() {
            assert_eq!(build.id, build_id);
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one claimant must win the build");
}

#[tokio::test]
async fn test_repeated_poll_returns_same_build() {
    let (store, queue) = new_queue();
    let worker = seed_worker(&store, "w1", vec![Platform::Ios]).await;

    queue
        .enqueue(pending_build(Platform::Ios, Utc::now()))
        .await
        .unwrap();
    queue
        .enqueue(pending_build(Platform::Ios, Utc::now() + ChronoDuration::seconds(1)))
        .await
        .unwrap();

    let first = queue.claim_next(&worker, Utc::now()).await.unwrap().unwrap();
    let second = queue.claim_next(&worker, Utc::now()).await.unwrap().unwrap();
    assert_eq!(
        first.id, second.id,
        "poll is idempotent while the worker holds an assignment"
    );
    assert_eq!(queue.pending_count(), 1);
}

#[tokio::test]
async fn test_complete_success_frees_worker_and_counts() {
    let (store, queue) = new_queue();
    let worker = seed_worker(&store, "w1", vec![Platform::Ios]).await;

    queue
        .enqueue(pending_build(Platform::Ios, Utc::now()))
        .await
        .unwrap();
    let claimed = queue.claim_next(&worker, Utc::now()).await.unwrap().unwrap();

    queue
        .complete(
            claimed.id,
            worker.id,
            &BuildOutcome::Succeeded,
            Some("mem://result".to_string()),
            Utc::now(),
        )
        .await
        .unwrap();

    let build = store.get_build(claimed.id).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Completed);
    assert!(build.completed_at.is_some());
    assert_eq!(build.result_ref.as_deref(), Some("mem://result"));

    let worker = store.get_worker(worker.id).await.unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Idle);
    assert_eq!(worker.builds_completed, 1);
    assert_eq!(worker.builds_failed, 0);
    assert_eq!(queue.active_count(), 0);
}

#[tokio::test]
async fn test_complete_twice_does_not_double_count() {
    let (store, queue) = new_queue();
    let worker = seed_worker(&store, "w1", vec![Platform::Ios]).await;

    queue
        .enqueue(pending_build(Platform::Ios, Utc::now()))
        .await
        .unwrap();
    let claimed = queue.claim_next(&worker, Utc::now()).await.unwrap().unwrap();

    for _ in 0..2 {
        queue
            .complete(claimed.id, worker.id, &BuildOutcome::Succeeded, None, Utc::now())
            .await
            .unwrap();
    }

    let build = store.get_build(claimed.id).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Completed);
    let worker = store.get_worker(worker.id).await.unwrap().unwrap();
    assert_eq!(worker.builds_completed, 1, "duplicate upload must not double-count");
}

#[tokio::test]
async fn test_complete_failure_counts_failed() {
    let (store, queue) = new_queue();
    let worker = seed_worker(&store, "w1", vec![Platform::Ios]).await;

    queue
        .enqueue(pending_build(Platform::Ios, Utc::now()))
        .await
        .unwrap();
    let claimed = queue.claim_next(&worker, Utc::now()).await.unwrap().unwrap();

    queue
        .complete(
            claimed.id,
            worker.id,
            &BuildOutcome::Failed {
                error: "xcodebuild exited 65".to_string(),
            },
            None,
            Utc::now(),
        )
        .await
        .unwrap();

    let build = store.get_build(claimed.id).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Failed);
    assert_eq!(build.error_message.as_deref(), Some("xcodebuild exited 65"));
    let worker = store.get_worker(worker.id).await.unwrap().unwrap();
    assert_eq!(worker.builds_failed, 1);
    assert_eq!(worker.builds_completed, 0);
}

#[tokio::test]
async fn test_complete_by_non_owner_rejected() {
    let (store, queue) = new_queue();
    let owner = seed_worker(&store, "owner", vec![Platform::Ios]).await;
    let intruder = seed_worker(&store, "intruder", vec![Platform::Ios]).await;

    queue
        .enqueue(pending_build(Platform::Ios, Utc::now()))
        .await
        .unwrap();
    let claimed = queue.claim_next(&owner, Utc::now()).await.unwrap().unwrap();

    let err = queue
        .complete(claimed.id, intruder.id, &BuildOutcome::Succeeded, None, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotOwner { .. }));

    let build = store.get_build(claimed.id).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Assigned);
    assert_eq!(build.worker_id, Some(owner.id));
}

#[tokio::test]
async fn test_abandon_requeues_for_another_worker() {
    let (store, queue) = new_queue();
    let w1 = seed_worker(&store, "w1", vec![Platform::Ios]).await;
    let w2 = seed_worker(&store, "w2", vec![Platform::Ios]).await;

    queue
        .enqueue(pending_build(Platform::Ios, Utc::now()))
        .await
        .unwrap();
    let first_claim_at = Utc::now();
    let claimed = queue.claim_next(&w1, first_claim_at).await.unwrap().unwrap();

    queue
        .abandon(claimed.id, w1.id, "missing signing certificate", Utc::now())
        .await
        .unwrap();

    let build = store.get_build(claimed.id).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Pending);
    assert!(build.worker_id.is_none());
    let w1_record = store.get_worker(w1.id).await.unwrap().unwrap();
    assert_eq!(w1_record.status, WorkerStatus::Idle);

    let reclaim_at = first_claim_at + ChronoDuration::seconds(10);
    let reclaimed = queue.claim_next(&w2, reclaim_at).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, claimed.id);
    assert_eq!(reclaimed.worker_id, Some(w2.id));
    assert_eq!(
        reclaimed.started_at,
        Some(reclaim_at),
        "started_at must reflect the new claim"
    );
}

#[tokio::test]
async fn test_abandon_by_non_owner_rejected() {
    let (store, queue) = new_queue();
    let owner = seed_worker(&store, "owner", vec![Platform::Ios]).await;
    let intruder = seed_worker(&store, "intruder", vec![Platform::Ios]).await;

    queue
        .enqueue(pending_build(Platform::Ios, Utc::now()))
        .await
        .unwrap();
    let claimed = queue.claim_next(&owner, Utc::now()).await.unwrap().unwrap();

    let err = queue
        .abandon(claimed.id, intruder.id, "not mine", Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotOwner { .. }));
}

#[tokio::test]
async fn test_cancel_pending_touches_no_worker() {
    let (store, queue) = new_queue();
    let worker = seed_worker(&store, "w1", vec![Platform::Ios]).await;

    let build = pending_build(Platform::Ios, Utc::now());
    let build_id = build.id;
    queue.enqueue(build).await.unwrap();

    queue
        .cancel(build_id, "Build cancelled by submitter", Utc::now())
        .await
        .unwrap();

    let build = store.get_build(build_id).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Failed);
    assert_eq!(build.error_message.as_deref(), Some("Build cancelled by submitter"));
    assert_eq!(queue.pending_count(), 0);

    let worker_record = store.get_worker(worker.id).await.unwrap().unwrap();
    assert_eq!(worker_record.status, WorkerStatus::Idle);
    assert!(queue.claim_next(&worker, Utc::now()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_active_frees_worker() {
    let (store, queue) = new_queue();
    let worker = seed_worker(&store, "w1", vec![Platform::Ios]).await;

    queue
        .enqueue(pending_build(Platform::Ios, Utc::now()))
        .await
        .unwrap();
    let claimed = queue.claim_next(&worker, Utc::now()).await.unwrap().unwrap();

    queue
        .cancel(claimed.id, "Build cancelled by submitter", Utc::now())
        .await
        .unwrap();

    let build = store.get_build(claimed.id).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Failed);
    assert!(build.worker_id.is_none());
    let worker_record = store.get_worker(worker.id).await.unwrap().unwrap();
    assert_eq!(worker_record.status, WorkerStatus::Idle);
    assert_eq!(queue.active_count(), 0);
}

#[tokio::test]
async fn test_cancel_terminal_is_noop() {
    let (store, queue) = new_queue();
    let worker = seed_worker(&store, "w1", vec![Platform::Ios]).await;

    queue
        .enqueue(pending_build(Platform::Ios, Utc::now()))
        .await
        .unwrap();
    let claimed = queue.claim_next(&worker, Utc::now()).await.unwrap().unwrap();
    queue
        .complete(claimed.id, worker.id, &BuildOutcome::Succeeded, None, Utc::now())
        .await
        .unwrap();

    queue
        .cancel(claimed.id, "too late", Utc::now())
        .await
        .unwrap();
    let build = store.get_build(claimed.id).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Completed, "terminal state must not change");
}

/// Store wrapper that lands a heartbeat transition between a caller's
/// status read and its swap, reproducing an owner racing its own
/// heartbeat.
struct HeartbeatRacingStore {
    inner: Arc<MemoryStore>,
    armed: AtomicBool,
}

#[async_trait]
impl BuildStore for HeartbeatRacingStore {
    async fn get_build(&self, id: Uuid) -> StoreResult<Option<Build>> {
        self.inner.get_build(id).await
    }

    async fn put_build(&self, build: Build) -> StoreResult<()> {
        self.inner.put_build(build).await
    }

    async fn builds_with_status(&self, statuses: &[BuildStatus]) -> StoreResult<Vec<Build>> {
        self.inner.builds_with_status(statuses).await
    }

    async fn get_worker(&self, id: Uuid) -> StoreResult<Option<Worker>> {
        self.inner.get_worker(id).await
    }

    async fn put_worker(&self, worker: Worker) -> StoreResult<()> {
        self.inner.put_worker(worker).await
    }

    async fn all_workers(&self) -> StoreResult<Vec<Worker>> {
        self.inner.all_workers().await
    }

    async fn compare_and_swap_status(
        &self,
        build_id: Uuid,
        expected: BuildStatus,
        new: BuildStatus,
        fields: BuildFields,
    ) -> StoreResult<bool> {
        if expected == BuildStatus::Assigned
            && new != BuildStatus::Building
            && self.armed.swap(false, Ordering::SeqCst)
        {
            let heartbeat = BuildFields {
                last_heartbeat_at: Some(Utc::now()),
                ..Default::default()
            };
            self.inner
                .compare_and_swap_status(
                    build_id,
                    BuildStatus::Assigned,
                    BuildStatus::Building,
                    heartbeat,
                )
                .await?;
        }
        self.inner
            .compare_and_swap_status(build_id, expected, new, fields)
            .await
    }
}

#[tokio::test]
async fn test_complete_survives_racing_own_heartbeat() {
    let inner = Arc::new(MemoryStore::new());
    let worker = seed_worker(&inner, "w1", vec![Platform::Ios]).await;
    let store = Arc::new(HeartbeatRacingStore {
        inner: inner.clone(),
        armed: AtomicBool::new(false),
    });
    let queue = JobQueue::new(store.clone());

    queue
        .enqueue(pending_build(Platform::Ios, Utc::now()))
        .await
        .unwrap();
    let claimed = queue.claim_next(&worker, Utc::now()).await.unwrap().unwrap();
    assert_eq!(claimed.status, BuildStatus::Assigned);

    // The worker's in-flight heartbeat moves the build to Building after
    // the completion read its status but before its swap lands.
    store.armed.store(true, Ordering::SeqCst);
    queue
        .complete(claimed.id, worker.id, &BuildOutcome::Succeeded, None, Utc::now())
        .await
        .expect("owner's completion must survive its own racing heartbeat");

    let build = inner.get_build(claimed.id).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Completed);
    let worker = inner.get_worker(worker.id).await.unwrap().unwrap();
    assert_eq!(worker.builds_completed, 1);
}

#[tokio::test]
async fn test_abandon_survives_racing_own_heartbeat() {
    let inner = Arc::new(MemoryStore::new());
    let worker = seed_worker(&inner, "w1", vec![Platform::Ios]).await;
    let store = Arc::new(HeartbeatRacingStore {
        inner: inner.clone(),
        armed: AtomicBool::new(false),
    });
    let queue = JobQueue::new(store.clone());

    queue
        .enqueue(pending_build(Platform::Ios, Utc::now()))
        .await
        .unwrap();
    let claimed = queue.claim_next(&worker, Utc::now()).await.unwrap().unwrap();

    store.armed.store(true, Ordering::SeqCst);
    queue
        .abandon(claimed.id, worker.id, "missing signing certificate", Utc::now())
        .await
        .expect("owner's abandon must survive its own racing heartbeat");

    let build = inner.get_build(claimed.id).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Pending);
    assert!(build.worker_id.is_none());
    assert_eq!(queue.pending_count(), 1);
}

#[tokio::test]
async fn test_heartbeat_moves_assigned_to_building() {
    let (store, queue) = new_queue();
    let worker = seed_worker(&store, "w1", vec![Platform::Ios]).await;

    queue
        .enqueue(pending_build(Platform::Ios, Utc::now()))
        .await
        .unwrap();
    let claimed = queue.claim_next(&worker, Utc::now()).await.unwrap().unwrap();
    assert_eq!(claimed.status, BuildStatus::Assigned);

    let hb_at = Utc::now();
    queue
        .record_heartbeat(claimed.id, worker.id, hb_at)
        .await
        .unwrap();

    let build = store.get_build(claimed.id).await.unwrap().unwrap();
    assert_eq!(build.status, BuildStatus::Building);
    assert_eq!(build.last_heartbeat_at, Some(hb_at));
}

#[tokio::test]
async fn test_heartbeat_from_non_owner_rejected() {
    let (store, queue) = new_queue();
    let owner = seed_worker(&store, "owner", vec![Platform::Ios]).await;
    let stale = seed_worker(&store, "stale", vec![Platform::Ios]).await;

    queue
        .enqueue(pending_build(Platform::Ios, Utc::now()))
        .await
        .unwrap();
    let claimed = queue.claim_next(&owner, Utc::now()).await.unwrap().unwrap();

    let err = queue
        .record_heartbeat(claimed.id, stale.id, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotOwner { .. }));
}

#[tokio::test]
async fn test_heartbeat_on_terminal_build_rejected() {
    let (store, queue) = new_queue();
    let worker = seed_worker(&store, "w1", vec![Platform::Ios]).await;

    queue
        .enqueue(pending_build(Platform::Ios, Utc::now()))
        .await
        .unwrap();
    let claimed = queue.claim_next(&worker, Utc::now()).await.unwrap().unwrap();
    queue
        .complete(claimed.id, worker.id, &BuildOutcome::Succeeded, None, Utc::now())
        .await
        .unwrap();

    let err = queue
        .record_heartbeat(claimed.id, worker.id, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::BuildTerminal(_)));
}
