mod api;
pub mod aggregator;
pub mod dispatcher;
pub mod feed;
pub mod launcher;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod ticker;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use crate::api::config::{load_config, BenchConfig};
use crate::launcher::{CommandLauncher, NoopLauncher, WorkerLauncher};
use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "bench-admin", about = "Broker benchmark control plane")]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:3000")]
    listen: String,

    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "brokerbench.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!(listen = %args.listen, config = %args.config, "brokerbench control plane starting");

    let config = if std::path::Path::new(&args.config).exists() {
        match load_config(&args.config) {
            Ok(config) => {
                info!(path = %args.config, "Loaded configuration from disk");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %args.config,
                    error = %e,
                    "Failed to load config file (starting with defaults)"
                );
                BenchConfig::default()
            }
        }
    } else {
        info!(path = %args.config, "No config file found, using defaults");
        BenchConfig::default()
    };

    let launcher: Arc<dyn WorkerLauncher> = if config.launcher.is_dry_run() {
        info!("No launcher commands configured, running in dry-run mode");
        Arc::new(NoopLauncher)
    } else {
        let l = &config.launcher;
        Arc::new(CommandLauncher::new(
            l.start_command.clone(),
            l.stop_command.clone(),
            Duration::from_secs(l.timeout_secs),
            l.control_url.clone(),
        ))
    };

    info!(
        window_ms = config.aggregation.window_ms,
        policy = ?config.scheduler.launch_failure_policy,
        grace_secs = ?config.scheduler.completion_grace_secs,
        "Scheduler configured"
    );

    let state = AppState::new(config, launcher);

    // Spawn background ticks
    tokio::spawn(ticker::run_publisher(state.clone()));
    tokio::spawn(ticker::run_scheduler_tick(state.clone()));

    let app = api::build_router(state);

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(addr = %args.listen, "Control plane listening");

    axum::serve(listener, app).await?;

    Ok(())
}
