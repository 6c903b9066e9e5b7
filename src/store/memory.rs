use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::build::{Build, BuildStatus, Worker};
use crate::store::{BlobKind, BlobStore, BuildFields, BuildStore};

#[derive(Default)]
struct Tables {
    builds: HashMap<Uuid, Build>,
    workers: HashMap<Uuid, Worker>,
    blobs: HashMap<(Uuid, BlobKind), Bytes>,
}

/// In-memory reference store. All tables live behind one mutex, which makes
/// the compare-and-swap (and its piggy-backed worker patch) atomic by
/// construction.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn get_build(&self, id: Uuid) -> Result<Option<Build>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.builds.get(&id).cloned())
    }

    async fn put_build(&self, build: Build) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        tables.builds.insert(build.id, build);
        Ok(())
    }

    async fn builds_with_status(&self, statuses: &[BuildStatus]) -> Result<Vec<Build>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .builds
            .values()
            .filter(|b| statuses.contains(&b.status))
            .cloned()
            .collect())
    }

    async fn get_worker(&self, id: Uuid) -> Result<Option<Worker>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.workers.get(&id).cloned())
    }

    async fn put_worker(&self, worker: Worker) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        tables.workers.insert(worker.id, worker);
        Ok(())
    }

    async fn all_workers(&self) -> Result<Vec<Worker>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.workers.values().cloned().collect())
    }

    async fn compare_and_swap_status(
        &self,
        build_id: Uuid,
        expected: BuildStatus,
        new: BuildStatus,
        fields: BuildFields,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().unwrap();

        match tables.builds.get(&build_id) {
            Some(build) if build.status == expected => {}
            _ => return Ok(false),
        }

        if let Some(ref patch) = fields.worker {
            // Both records mutate under the same lock; the swap and the
            // worker patch commit together or not at all.
            match tables.workers.get_mut(&patch.worker_id) {
                Some(worker) => patch.apply(worker),
                None => return Ok(false),
            }
        }

        let build = tables
            .builds
            .get_mut(&build_id)
            .expect("checked above while holding the lock");
        build.status = new;
        fields.apply(build);
        Ok(true)
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn put_blob(&self, build_id: Uuid, kind: BlobKind, data: Bytes) -> Result<String> {
        let mut tables = self.tables.lock().unwrap();
        tables.blobs.insert((build_id, kind), data);
        Ok(format!("mem://{}/{}", build_id, kind))
    }

    async fn get_blob(&self, build_id: Uuid, kind: BlobKind) -> Result<Option<Bytes>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.blobs.get(&(build_id, kind)).cloned())
    }
}
