//! Worker-side machinery: the poll/execute/report loop, the session state
//! machine that owns the worker's credential, and the heartbeat ticker.
//!
//! The loop claims one build at a time, heartbeats while the runner works,
//! and reports the outcome. Session errors never surface to builds; they
//! are recovered by re-registration inside [`session::SessionManager`].

pub mod client;
pub mod heartbeat;
pub mod runner;
pub mod session;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::orchestrator::JobOffer;
use crate::scheduler::build::BuildOutcome;

pub use client::{LocalClient, OrchestratorClient};
pub use heartbeat::HeartbeatSender;
pub use runner::{BuildRunner, SimulatedRunner};
pub use session::{SessionManager, SessionError};

/// Drives one worker: poll for a build, run it with heartbeats, report the
/// outcome, repeat.
pub struct WorkerLoop<C, R> {
    session: Arc<SessionManager<C>>,
    runner: R,
    config: WorkerConfig,
}

impl<C: OrchestratorClient, R: BuildRunner> WorkerLoop<C, R> {
    pub fn new(session: Arc<SessionManager<C>>, runner: R, config: WorkerConfig) -> Self {
        Self {
            session,
            runner,
            config,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(name = %self.config.name, "Worker loop stopping");
                    break;
                }
                _ = interval.tick() => {
                    match self.session.poll_once().await {
                        Ok(Some(offer)) => self.run_build(offer).await,
                        Ok(None) => {}
                        Err(e) => {
                            // Retry budget spent: drop out of the fleet.
                            // Any build we held will hit the heartbeat
                            // monitor's timeout.
                            tracing::error!(name = %self.config.name, error = %e,
                                "Worker session lost, exiting loop");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn run_build(&self, offer: JobOffer) {
        self.session.set_active_builds(1);

        let (hb_tx, mut hb_rx) = mpsc::channel(1);
        let sender = HeartbeatSender::new(self.config.heartbeat_interval);
        let ticker = tokio::spawn(async move { sender.run(hb_tx).await });

        let run = self.runner.run(&offer);
        tokio::pin!(run);

        let output = loop {
            tokio::select! {
                output = &mut run => break Some(output),
                Some(()) = hb_rx.recv() => {
                    if let Err(e) = self.session.heartbeat(offer.build_id).await {
                        // The build was reclaimed (or we lost ownership);
                        // finishing it would be rejected anyway.
                        tracing::warn!(build_id = %offer.build_id, error = %e,
                            "Heartbeat rejected, dropping build");
                        break None;
                    }
                }
            }
        };
        ticker.abort();

        if let Some(output) = output {
            let status = match &output.outcome {
                BuildOutcome::Succeeded => "succeeded",
                BuildOutcome::Failed { .. } => "failed",
            };
            match self
                .session
                .report(offer.build_id, output.outcome, output.artifact)
                .await
            {
                Ok(()) => {
                    tracing::info!(build_id = %offer.build_id, status, "Build result reported")
                }
                Err(e) => tracing::warn!(build_id = %offer.build_id, error = %e,
                    "Result upload rejected"),
            }
        }

        self.session.set_active_builds(0);
    }
}
