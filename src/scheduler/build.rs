use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Ios => write!(f, "ios"),
            Platform::Android => write!(f, "android"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Assigned,
    Building,
    Completed,
    Failed,
}

impl BuildStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildStatus::Completed | BuildStatus::Failed)
    }

    /// Whether a build currently has (and must have) an owning worker.
    pub fn is_active(self) -> bool {
        matches!(self, BuildStatus::Assigned | BuildStatus::Building)
    }

    /// The single legality check for build status transitions. Every
    /// mutation path goes through this; there is no other place where a
    /// transition is decided.
    pub fn can_transition(from: BuildStatus, to: BuildStatus) -> bool {
        use BuildStatus::*;
        matches!(
            (from, to),
            (Pending, Assigned)
                | (Pending, Failed) // submitter cancel before any claim
                | (Assigned, Building)
                | (Assigned, Pending) // voluntary abandon
                | (Assigned, Completed)
                | (Assigned, Failed)
                | (Building, Pending) // voluntary abandon
                | (Building, Completed)
                | (Building, Failed)
        )
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildStatus::Pending => write!(f, "pending"),
            BuildStatus::Assigned => write!(f, "assigned"),
            BuildStatus::Building => write!(f, "building"),
            BuildStatus::Completed => write!(f, "completed"),
            BuildStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One compilation job, from submission to terminal outcome.
///
/// Invariant: `worker_id.is_some()` exactly when the status is active
/// (`Assigned`/`Building`). `started_at` reflects the most recent
/// successful claim; after an abandon it is kept for audit but the next
/// claim overwrites it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,
    pub platform: Platform,
    pub status: BuildStatus,
    pub worker_id: Option<Uuid>,
    pub source_ref: Option<String>,
    pub certs_ref: Option<String>,
    pub result_ref: Option<String>,
    /// Capability token granting the submitter status/log/result access to
    /// this build only.
    pub access_token: String,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Build {
    pub fn new(platform: Platform, access_token: String, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            platform,
            status: BuildStatus::Pending,
            worker_id: None,
            source_ref: None,
            certs_ref: None,
            result_ref: None,
            access_token,
            submitted_at,
            started_at: None,
            completed_at: None,
            last_heartbeat_at: None,
            error_message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_owned_by(&self, worker_id: Uuid) -> bool {
        self.worker_id == Some(worker_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Building,
    Offline,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Building => write!(f, "building"),
            WorkerStatus::Offline => write!(f, "offline"),
        }
    }
}

/// What a worker advertises at registration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub platforms: Vec<Platform>,
    /// Advertised concurrency limit. Claims currently hand out one build
    /// per worker at a time (a poll while one is held returns the held
    /// build), so values above 1 are recorded but not scheduled against.
    pub max_concurrent_builds: u32,
    /// Opaque resource hints (memory, simulator versions, ...). The queue
    /// does not interpret these.
    pub resources: HashMap<String, String>,
}

impl WorkerCapabilities {
    pub fn for_platforms(platforms: Vec<Platform>) -> Self {
        Self {
            platforms,
            max_concurrent_builds: 1,
            resources: HashMap::new(),
        }
    }

    pub fn supports(&self, platform: Platform) -> bool {
        self.platforms.contains(&platform)
    }
}

/// A remote executor that polls for and performs builds.
///
/// Workers are never deleted by normal flows; they drift to `Offline` when
/// their poll cadence lapses and come back to `Idle` on the next
/// registration or poll. `builds_completed`/`builds_failed` are append-only
/// and survive re-registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub name: String,
    pub capabilities: WorkerCapabilities,
    pub status: WorkerStatus,
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub builds_completed: u64,
    pub builds_failed: u64,
    pub last_seen_at: DateTime<Utc>,
    /// Self-reported at registration; compared against the store's own
    /// record to detect capacity drift after a crash/restart.
    pub active_build_count: u32,
}

impl Worker {
    pub fn new(
        name: String,
        capabilities: WorkerCapabilities,
        access_token: String,
        access_token_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            capabilities,
            status: WorkerStatus::Idle,
            access_token,
            access_token_expires_at,
            builds_completed: 0,
            builds_failed: 0,
            last_seen_at: now,
            active_build_count: 0,
        }
    }
}

/// Terminal result a worker reports for a build it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Succeeded,
    Failed { error: String },
}

impl BuildOutcome {
    pub fn terminal_status(&self) -> BuildStatus {
        match self {
            BuildOutcome::Succeeded => BuildStatus::Completed,
            BuildOutcome::Failed { .. } => BuildStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_starts_pending_without_owner() {
        let build = Build::new(Platform::Ios, "tok".to_string(), Utc::now());
        assert_eq!(build.status, BuildStatus::Pending);
        assert!(build.worker_id.is_none());
        assert!(build.started_at.is_none());
        assert!(!build.is_terminal());
    }

    #[test]
    fn terminal_states_accept_no_transition() {
        use BuildStatus::*;
        for from in [Completed, Failed] {
            for to in [Pending, Assigned, Building, Completed, Failed] {
                assert!(!BuildStatus::can_transition(from, to));
            }
        }
    }

    #[test]
    fn claim_and_abandon_transitions() {
        use BuildStatus::*;
        assert!(BuildStatus::can_transition(Pending, Assigned));
        assert!(BuildStatus::can_transition(Assigned, Pending));
        assert!(BuildStatus::can_transition(Building, Pending));
        assert!(!BuildStatus::can_transition(Pending, Building));
        assert!(!BuildStatus::can_transition(Pending, Completed));
    }

    #[test]
    fn capabilities_platform_filter() {
        let caps = WorkerCapabilities::for_platforms(vec![Platform::Ios]);
        assert!(caps.supports(Platform::Ios));
        assert!(!caps.supports(Platform::Android));
    }
}
