use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use buildfleet::config::{OrchestratorConfig, WorkerConfig};
use buildfleet::orchestrator::Orchestrator;
use buildfleet::scheduler::build::{Platform, WorkerCapabilities};
use buildfleet::scheduler::HeartbeatMonitor;
use buildfleet::shutdown::install_shutdown_handler;
use buildfleet::store::MemoryStore;
use buildfleet::worker::{LocalClient, SessionManager, SimulatedRunner, WorkerLoop};

#[derive(Parser, Debug)]
#[command(name = "buildfleet")]
#[command(version)]
#[command(about = "Single-node build orchestration engine")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the orchestrator with an in-memory store and in-process demo
    /// workers
    Serve(ServeArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Number of in-process demo workers to spawn
    #[arg(long, default_value = "2")]
    workers: usize,

    /// Seed this many demo builds at startup (platforms alternate)
    #[arg(long, default_value = "0")]
    seed_builds: usize,

    /// Heartbeat monitor sweep interval, seconds
    #[arg(long, default_value = "60")]
    sweep_interval_secs: u64,

    /// Grace period before a fresh claim is eligible for the silence check,
    /// seconds
    #[arg(long, default_value = "30")]
    grace_secs: u64,

    /// Heartbeat silence after which a build is reclaimed, seconds
    #[arg(long, default_value = "120")]
    heartbeat_timeout_secs: u64,

    /// Worker access token lifetime, seconds
    #[arg(long, default_value = "90")]
    token_ttl_secs: u64,

    /// How long the demo runner pretends each build takes, milliseconds
    #[arg(long, default_value = "3000")]
    build_duration_ms: u64,
}

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = OrchestratorConfig {
        sweep_interval: Duration::from_secs(args.sweep_interval_secs),
        grace_period: Duration::from_secs(args.grace_secs),
        heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout_secs),
        token_ttl: Duration::from_secs(args.token_ttl_secs),
        ..Default::default()
    };

    tracing::info!(
        workers = args.workers,
        seed_builds = args.seed_builds,
        sweep_interval_secs = args.sweep_interval_secs,
        heartbeat_timeout_secs = args.heartbeat_timeout_secs,
        "Starting buildfleet orchestrator"
    );

    let store = Arc::new(MemoryStore::new());
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        store.clone(),
        config.clone(),
    ));
    orchestrator.restore().await?;

    let cancel = install_shutdown_handler();

    // Heartbeat monitor
    let monitor = HeartbeatMonitor::new(orchestrator.queue(), config);
    let monitor_cancel = cancel.clone();
    tokio::spawn(async move {
        monitor.run(monitor_cancel).await;
    });

    // In-process demo workers
    for i in 0..args.workers {
        let worker_config = WorkerConfig::named(format!("demo-worker-{}", i + 1));
        let capabilities =
            WorkerCapabilities::for_platforms(vec![Platform::Ios, Platform::Android]);
        let session = Arc::new(SessionManager::new(
            LocalClient::new(orchestrator.clone()),
            worker_config.clone(),
            capabilities,
        ));
        let runner = SimulatedRunner::succeeding(Duration::from_millis(args.build_duration_ms));
        let worker = WorkerLoop::new(session, runner, worker_config);
        let worker_cancel = cancel.clone();
        tokio::spawn(async move {
            worker.run(worker_cancel).await;
        });
    }

    for i in 0..args.seed_builds {
        let platform = if i % 2 == 0 {
            Platform::Ios
        } else {
            Platform::Android
        };
        let receipt = orchestrator
            .submit(platform, Bytes::from(format!("demo-source-{}", i)), None)
            .await?;
        tracing::info!(build_id = %receipt.build_id, platform = %platform, "Seeded demo build");
    }

    cancel.cancelled().await;
    tracing::info!("Orchestrator stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_serve(serve_args).await?,
    }

    Ok(())
}
