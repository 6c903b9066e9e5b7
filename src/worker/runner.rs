use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::orchestrator::JobOffer;
use crate::scheduler::build::BuildOutcome;

/// Result of running one build through the toolchain.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub outcome: BuildOutcome,
    pub artifact: Option<Bytes>,
}

/// The seam to the actual build toolchain. Execution inside a sandboxed
/// environment is an external concern; the orchestration core only needs
/// an outcome and an optional artifact back.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn run(&self, offer: &JobOffer) -> RunOutput;
}

/// Stand-in runner for demos and tests: sleeps for a fixed duration and
/// produces a configurable outcome.
#[derive(Debug, Clone)]
pub struct SimulatedRunner {
    duration: Duration,
    fail_with: Option<String>,
}

impl SimulatedRunner {
    pub fn succeeding(duration: Duration) -> Self {
        Self {
            duration,
            fail_with: None,
        }
    }

    pub fn failing(duration: Duration, error: impl Into<String>) -> Self {
        Self {
            duration,
            fail_with: Some(error.into()),
        }
    }
}

#[async_trait]
impl BuildRunner for SimulatedRunner {
    async fn run(&self, offer: &JobOffer) -> RunOutput {
        tracing::info!(build_id = %offer.build_id, platform = %offer.platform,
            "Running build");
        tokio::time::sleep(self.duration).await;

        match &self.fail_with {
            None => RunOutput {
                outcome: BuildOutcome::Succeeded,
                artifact: Some(Bytes::from(format!("artifact-{}", offer.build_id))),
            },
            Some(error) => RunOutput {
                outcome: BuildOutcome::Failed {
                    error: error.clone(),
                },
                artifact: None,
            },
        }
    }
}
