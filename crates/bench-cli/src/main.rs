mod watch;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use bench_protocol::experiment::BrokerKind;

#[derive(Parser, Debug)]
#[command(name = "brokerbench", about = "Broker benchmark control CLI")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Control plane URL
    #[arg(
        short,
        long,
        env = "BROKERBENCH_URL",
        default_value = "http://localhost:3000",
        global = true
    )]
    url: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show control plane status
    Status,
    /// List experiments
    List,
    /// Register an experiment
    Add {
        /// kafka or rabbitmq
        broker: BrokerKind,
        /// Number of producer workers
        producers: u32,
        /// Planned duration in seconds
        duration_secs: u64,
        /// Number of consumer workers
        #[arg(long, default_value_t = 1)]
        consumers: u32,
        #[arg(long)]
        name: Option<String>,
        /// Experiment id (assigned by the control plane if omitted)
        #[arg(long)]
        id: Option<String>,
    },
    /// Delete an experiment
    Delete { id: String },
    /// Append an experiment to the run queue
    Queue { id: String },
    /// Remove a queued experiment
    Dequeue { id: String },
    /// Stop the running experiment
    Stop { id: String },
    /// Worker signal: workers are up and producing
    Started { id: String },
    /// Worker signal: the run finished
    Finished { id: String },
    /// Follow the live feed and write a CSV per completed run
    Watch {
        /// Directory for CSV artifacts
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        /// Width of the live display window
        #[arg(long, default_value_t = 60)]
        span_secs: u64,
        /// Exit after the first completed run
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let client = reqwest::Client::new();
    let base = args.url.trim_end_matches('/').to_string();

    match args.command {
        Commands::Status => {
            let resp: Value = client
                .get(format!("{}/api/status", base))
                .send().await?
                .json().await?;
            println!("brokerbench Status");
            println!("══════════════════════════════");
            println!("  Version:      {}", resp["version"].as_str().unwrap_or("?"));
            println!("  Uptime:       {}s", resp["uptime_seconds"]);
            println!("  Experiments:  {}", resp["experiments"]);
            if resp["running"].is_null() {
                println!("  Running:      -");
            } else {
                let running = &resp["running"];
                println!(
                    "  Running:      {} (run {}, {}s left)",
                    running["experiment_id"].as_str().unwrap_or("?"),
                    running["run"],
                    running["remaining_secs"]
                );
            }
            println!("  Queue:        {}", join_ids(&resp["queue"]));
            println!("  Policy:       {}", resp["launch_failure_policy"].as_str().unwrap_or("?"));
            println!("  Messages:     {}", resp["total_messages"]);
            println!("  Observers:    {}", resp["ws_clients"]);
        }
        Commands::List => {
            let resp: Value = client
                .get(format!("{}/api/experiments", base))
                .send().await?
                .json().await?;
            println!("Experiments");
            println!("══════════════════════════════");
            if let Some(experiments) = resp["experiments"].as_array() {
                if experiments.is_empty() {
                    println!("  No experiments registered");
                }
                for e in experiments {
                    println!(
                        "  {:<12} {:<12} {:<9} p={} c={} {}s  {}",
                        e["id"].as_str().unwrap_or("?"),
                        e["status"].as_str().unwrap_or("?"),
                        e["broker"].as_str().unwrap_or("?"),
                        e["producers"],
                        e["consumers"],
                        e["duration_secs"],
                        e["name"].as_str().unwrap_or(""),
                    );
                }
            }
        }
        Commands::Add { broker, producers, duration_secs, consumers, name, id } => {
            let body = json!({
                "id": id,
                "name": name,
                "broker": broker,
                "producers": producers,
                "consumers": consumers,
                "duration_secs": duration_secs,
            });
            let resp = client.post(format!("{}/api/experiments", base)).json(&body).send().await?;
            print_outcome(resp).await?;
        }
        Commands::Delete { id } => {
            let resp = client.delete(format!("{}/api/experiments/{}", base, id)).send().await?;
            print_outcome(resp).await?;
        }
        Commands::Queue { id } => {
            let resp = client.post(format!("{}/api/experiments/{}/queue", base, id)).send().await?;
            print_outcome(resp).await?;
        }
        Commands::Dequeue { id } => {
            let resp = client.delete(format!("{}/api/experiments/{}/queue", base, id)).send().await?;
            print_outcome(resp).await?;
        }
        Commands::Stop { id } => {
            let resp = client.post(format!("{}/api/experiments/{}/stop", base, id)).send().await?;
            print_outcome(resp).await?;
        }
        Commands::Started { id } => {
            let resp = client
                .post(format!("{}/api/workers/started", base))
                .json(&json!({ "experiment_id": id }))
                .send().await?;
            print_outcome(resp).await?;
        }
        Commands::Finished { id } => {
            let resp = client
                .post(format!("{}/api/workers/finished", base))
                .json(&json!({ "experiment_id": id }))
                .send().await?;
            print_outcome(resp).await?;
        }
        Commands::Watch { out_dir, span_secs, once } => {
            let opts = watch::WatchOptions {
                base_url: base,
                out_dir,
                span_ms: span_secs.saturating_mul(1000),
                once,
            };
            tokio::task::spawn_blocking(move || watch::run(opts)).await??;
        }
    }

    Ok(())
}

/// Print a `{success, message}` control outcome. Error statuses fail the
/// command so scripts can react to them.
async fn print_outcome(resp: reqwest::Response) -> anyhow::Result<()> {
    let status = resp.status();
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    let message = body["message"].as_str().unwrap_or("");

    if !status.is_success() {
        anyhow::bail!("{} {}", status, message);
    }

    if body["success"].as_bool().unwrap_or(false) {
        println!("  ✓ {}", message);
    } else {
        println!("  · {} (no change)", message);
    }
    if let Some(e) = body.get("experiment").filter(|e| !e.is_null()) {
        println!(
            "    {} [{}]",
            e["id"].as_str().unwrap_or("?"),
            e["status"].as_str().unwrap_or("?")
        );
    }
    Ok(())
}

fn join_ids(v: &Value) -> String {
    match v.as_array() {
        Some(ids) if !ids.is_empty() => ids
            .iter()
            .filter_map(|id| id.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        _ => "-".into(),
    }
}
