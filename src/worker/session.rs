//! Worker-side session management.
//!
//! One state machine owns the worker's credential and identity:
//! `Unregistered -> Registering -> Active -> Reauthenticating -> Active`.
//! The poll loop and any explicit reconnect trigger share it; re-registration
//! is single-flight, and polling is suspended (not retried) while a
//! registration is in flight so a stale response can never clobber a fresh
//! token.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::{BackoffConfig, WorkerConfig};
use crate::error::ApiError;
use crate::orchestrator::JobOffer;
use crate::scheduler::build::{BuildOutcome, WorkerCapabilities};
use crate::worker::client::OrchestratorClient;

/// Exponential backoff with jitter. Registration and poll retries share one
/// growing delay; any successful exchange resets it to the floor.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.base,
            config,
            attempts: 0,
        }
    }

    /// The delay to sleep before the next attempt, or `None` once the
    /// attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }
        self.attempts += 1;
        let delay = self.current;
        self.current = (self.current * 2).min(self.config.cap);
        // Jitter spreads reconnect stampedes after an orchestrator restart.
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        Some(delay.mul_f64(jitter))
    }

    pub fn reset(&mut self) {
        self.current = self.config.base;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// An established session: the identity and credential a worker presents.
#[derive(Debug, Clone)]
pub struct Session {
    pub worker_id: Uuid,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
enum SessionState {
    Unregistered,
    Registering,
    Active(Session),
    Reauthenticating,
}

#[derive(Error, Debug)]
pub enum SessionError {
    /// Terminal: the retry budget is spent. The worker simply drops out of
    /// the fleet; its builds, if any, hit the heartbeat monitor's timeout.
    #[error("Registration retry budget exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Terminal rejection that re-registration cannot fix.
    #[error("Request rejected by orchestrator: {0}")]
    Rejected(String),
}

pub struct SessionManager<C> {
    client: C,
    config: WorkerConfig,
    capabilities: WorkerCapabilities,
    state: Mutex<SessionState>,
    backoff: Mutex<Backoff>,
    /// Single-flight guard: at most one registration in flight; poll paths
    /// block on it rather than racing a doomed token.
    registration: Mutex<()>,
    /// Last identity the server acknowledged; preserved across 401
    /// reconnects, dropped on 404.
    last_worker_id: Mutex<Option<Uuid>>,
    active_builds: AtomicU32,
}

impl<C: OrchestratorClient> SessionManager<C> {
    pub fn new(client: C, config: WorkerConfig, capabilities: WorkerCapabilities) -> Self {
        let backoff = Backoff::new(config.backoff.clone());
        Self {
            client,
            config,
            capabilities,
            state: Mutex::new(SessionState::Unregistered),
            backoff: Mutex::new(backoff),
            registration: Mutex::new(()),
            last_worker_id: Mutex::new(None),
            active_builds: AtomicU32::new(0),
        }
    }

    /// Snapshot of the current session, if any.
    pub async fn session(&self) -> Option<Session> {
        match &*self.state.lock().await {
            SessionState::Active(session) => Some(session.clone()),
            _ => None,
        }
    }

    pub fn set_active_builds(&self, count: u32) {
        self.active_builds.store(count, Ordering::Relaxed);
    }

    /// Register (or return the existing session). Blocks behind any
    /// registration already in flight.
    pub async fn ensure_active(&self) -> Result<Session, SessionError> {
        let _flight = self.registration.lock().await;
        if let Some(session) = self.session().await {
            return Ok(session);
        }
        self.register_locked(true).await
    }

    /// Re-register after the server rejected our credential or identity.
    ///
    /// `stale_token` is the credential that failed: if another flight
    /// already replaced it by the time we hold the guard, the fresh session
    /// is returned without registering again.
    async fn reauthenticate(
        &self,
        preserve_id: bool,
        stale_token: &str,
    ) -> Result<Session, SessionError> {
        let _flight = self.registration.lock().await;

        if let Some(session) = self.session().await {
            if session.token != stale_token {
                return Ok(session);
            }
        }

        {
            let mut state = self.state.lock().await;
            *state = SessionState::Reauthenticating;
        }
        if !preserve_id {
            // 404: the server no longer knows this identity. Keeping the
            // dead id would loop forever.
            *self.last_worker_id.lock().await = None;
        }
        self.register_locked(preserve_id).await
    }

    /// Registration retry loop. Caller must hold the registration guard.
    async fn register_locked(&self, preserve_id: bool) -> Result<Session, SessionError> {
        {
            let mut state = self.state.lock().await;
            if !matches!(*state, SessionState::Reauthenticating) {
                *state = SessionState::Registering;
            }
        }

        let worker_id = if preserve_id {
            *self.last_worker_id.lock().await
        } else {
            None
        };

        loop {
            match self
                .client
                .register(
                    worker_id,
                    &self.config.name,
                    self.capabilities.clone(),
                    self.active_builds.load(Ordering::Relaxed),
                )
                .await
            {
                Ok(registration) => {
                    let session = Session {
                        worker_id: registration.worker_id,
                        token: registration.grant.token,
                        expires_at: registration.grant.expires_at,
                    };
                    *self.last_worker_id.lock().await = Some(session.worker_id);
                    *self.state.lock().await = SessionState::Active(session.clone());
                    self.backoff.lock().await.reset();
                    tracing::info!(worker_id = %session.worker_id, name = %self.config.name,
                        "Worker session established");
                    return Ok(session);
                }
                Err(e) => {
                    let delay = self.backoff.lock().await.next_delay();
                    match delay {
                        Some(delay) => {
                            tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64,
                                "Registration failed, backing off");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            let attempts = self.backoff.lock().await.attempts();
                            *self.state.lock().await = SessionState::Unregistered;
                            return Err(SessionError::RetriesExhausted {
                                attempts,
                                last_error: e.to_string(),
                            });
                        }
                    }
                }
            }
        }
    }

    /// One poll exchange, driving the recovery protocol on session errors:
    /// 401 re-registers preserving the worker id, 404 re-registers with a
    /// fresh identity, transport errors back off. A rotated token returned
    /// by the server is applied before the result is handed back.
    pub async fn poll_once(&self) -> Result<Option<JobOffer>, SessionError> {
        loop {
            let session = self.ensure_active().await?;
            match self.client.poll(session.worker_id, &session.token).await {
                Ok(response) => {
                    self.backoff.lock().await.reset();
                    if let Some(grant) = response.rotated_token {
                        let mut state = self.state.lock().await;
                        if let SessionState::Active(ref mut current) = *state {
                            current.token = grant.token;
                            current.expires_at = grant.expires_at;
                        }
                    }
                    return Ok(response.job);
                }
                Err(ApiError::Unauthorized) => {
                    tracing::warn!(worker_id = %session.worker_id,
                        "Token rejected on poll, reauthenticating with preserved id");
                    self.reauthenticate(true, &session.token).await?;
                }
                Err(ApiError::UnknownWorker) => {
                    tracing::warn!(worker_id = %session.worker_id,
                        "Worker id unknown to server, registering a new identity");
                    self.reauthenticate(false, &session.token).await?;
                }
                Err(ApiError::Rejected(msg)) => return Err(SessionError::Rejected(msg)),
                Err(ApiError::Transport(msg)) => {
                    let delay = self.backoff.lock().await.next_delay();
                    match delay {
                        Some(delay) => {
                            tracing::warn!(error = %msg, delay_ms = delay.as_millis() as u64,
                                "Poll failed, backing off");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            let attempts = self.backoff.lock().await.attempts();
                            return Err(SessionError::RetriesExhausted {
                                attempts,
                                last_error: msg,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Heartbeat for an owned build. A 401 triggers one preserved-id
    /// re-registration and a single retry.
    pub async fn heartbeat(&self, build_id: Uuid) -> Result<(), ApiError> {
        let session = self
            .ensure_active()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        match self
            .client
            .heartbeat(build_id, session.worker_id, &session.token)
            .await
        {
            Err(ApiError::Unauthorized) => {
                let session = self
                    .reauthenticate(true, &session.token)
                    .await
                    .map_err(|e| ApiError::Transport(e.to_string()))?;
                self.client
                    .heartbeat(build_id, session.worker_id, &session.token)
                    .await
            }
            other => other,
        }
    }

    pub async fn report(
        &self,
        build_id: Uuid,
        outcome: BuildOutcome,
        artifact: Option<bytes::Bytes>,
    ) -> Result<(), ApiError> {
        let session = self
            .ensure_active()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        match self
            .client
            .report(
                build_id,
                session.worker_id,
                &session.token,
                outcome.clone(),
                artifact.clone(),
            )
            .await
        {
            Err(ApiError::Unauthorized) => {
                let session = self
                    .reauthenticate(true, &session.token)
                    .await
                    .map_err(|e| ApiError::Transport(e.to_string()))?;
                self.client
                    .report(build_id, session.worker_id, &session.token, outcome, artifact)
                    .await
            }
            other => other,
        }
    }

    pub async fn abandon(&self, build_id: Uuid, reason: &str) -> Result<(), ApiError> {
        let session = self
            .ensure_active()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        self.client
            .abandon(build_id, session.worker_id, &session.token, reason)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff_config(base_ms: u64, cap_ms: u64, max_attempts: u32) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(base_ms),
            cap: Duration::from_millis(cap_ms),
            max_attempts,
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(backoff_config(100, 400, 10));
        let delays: Vec<Duration> = (0..4).map(|_| backoff.next_delay().unwrap()).collect();

        // Jitter is within +/-20% of the nominal delay.
        let nominal = [100u64, 200, 400, 400];
        for (delay, nominal_ms) in delays.iter().zip(nominal) {
            let ms = delay.as_millis() as u64;
            assert!(ms >= nominal_ms * 8 / 10, "delay {} too short", ms);
            assert!(ms <= nominal_ms * 12 / 10 + 1, "delay {} too long", ms);
        }
    }

    #[test]
    fn backoff_reset_returns_to_base() {
        let mut backoff = Backoff::new(backoff_config(100, 10_000, 10));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        let delay = backoff.next_delay().unwrap().as_millis() as u64;
        assert!((80..=121).contains(&delay));
    }

    #[test]
    fn backoff_budget_exhausts() {
        let mut backoff = Backoff::new(backoff_config(1, 10, 3));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempts(), 3);
    }
}
