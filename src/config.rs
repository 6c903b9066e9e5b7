use std::time::Duration;

/// Timing knobs for the orchestrator's liveness and session machinery.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often the heartbeat monitor sweeps active builds.
    pub sweep_interval: Duration,
    /// A freshly claimed build is exempt from the silence check for this
    /// long; the worker has not had time to send its first heartbeat yet.
    pub grace_period: Duration,
    /// Heartbeat silence beyond this marks the build failed and frees the
    /// worker.
    pub heartbeat_timeout: Duration,
    /// Lifetime of a worker access token.
    pub token_ttl: Duration,
    /// When a polling worker's token has less than this remaining, a
    /// rotated token rides back on the poll response.
    pub token_refresh_window: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            grace_period: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(120),
            token_ttl: Duration::from_secs(90),
            token_refresh_window: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff bounds shared by worker registration and poll
/// retries. One growing delay, reset to `base` on any successful exchange.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    /// Give up after this many consecutive failures; the session surfaces
    /// a terminal error and the worker drops out of the fleet.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

/// Worker-side loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: String,
    /// Delay between "no job available" poll responses.
    pub poll_interval: Duration,
    /// Cadence of heartbeats while a build is running.
    pub heartbeat_interval: Duration,
    pub backoff: BackoffConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}
