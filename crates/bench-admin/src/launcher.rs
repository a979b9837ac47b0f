/// Worker launch boundary.
///
/// The control plane never manages broker workers itself. It hands each start
/// or stop intent to a `WorkerLauncher`, which in production runs an operator
/// supplied command (typically a compose/orchestration script) with the run
/// parameters in its environment. The launcher reports success plus captured
/// output; what a failure means for the run is decided by the scheduler's
/// failure policy.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use bench_protocol::experiment::BrokerKind;

/// Parameters of one start or stop intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub experiment_id: String,
    /// Run number the intent belongs to
    pub run: u64,
    pub broker: BrokerKind,
    pub producers: u32,
    pub consumers: u32,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub success: bool,
    pub output: String,
}

impl LaunchOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

pub type LaunchFuture<'a> = Pin<Box<dyn Future<Output = LaunchOutcome> + Send + 'a>>;

pub trait WorkerLauncher: Send + Sync {
    fn start<'a>(&'a self, spec: &'a LaunchSpec) -> LaunchFuture<'a>;
    fn stop<'a>(&'a self, spec: &'a LaunchSpec) -> LaunchFuture<'a>;
}

/// Runs configured commands for start and stop.
pub struct CommandLauncher {
    start_command: Vec<String>,
    stop_command: Vec<String>,
    timeout: Duration,
    control_url: String,
}

impl CommandLauncher {
    pub fn new(
        start_command: Vec<String>,
        stop_command: Vec<String>,
        timeout: Duration,
        control_url: String,
    ) -> Self {
        Self {
            start_command,
            stop_command,
            timeout,
            control_url,
        }
    }

    fn command(&self, argv: &[String], spec: &LaunchSpec, phase: &str) -> Option<Command> {
        let (program, args) = argv.split_first()?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("BENCH_PHASE", phase)
            .env("BENCH_EXPERIMENT_ID", &spec.experiment_id)
            .env("BENCH_RUN", spec.run.to_string())
            .env("BENCH_BROKER", spec.broker.as_str())
            .env("BENCH_PRODUCERS", spec.producers.to_string())
            .env("BENCH_CONSUMERS", spec.consumers.to_string())
            .env("BENCH_DURATION_SECS", spec.duration_secs.to_string())
            .env("BENCH_CONTROL_URL", &self.control_url)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        Some(cmd)
    }

    async fn run(&self, argv: &[String], spec: &LaunchSpec, phase: &str) -> LaunchOutcome {
        let Some(mut cmd) = self.command(argv, spec, phase) else {
            return LaunchOutcome::failed(format!("no {phase} command configured"));
        };

        debug!(experiment = %spec.experiment_id, run = spec.run, phase, program = %argv[0], "running launcher command");

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.trim().is_empty() {
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                    text.push_str(&stderr);
                }
                // Tools that report errors on stderr but exit 0 still count as success here
                if output.status.success() {
                    LaunchOutcome::ok(text)
                } else {
                    LaunchOutcome::failed(format!("exit status {}: {}", output.status, text.trim()))
                }
            }
            Ok(Err(e)) => LaunchOutcome::failed(format!("failed to spawn {}: {e}", argv[0])),
            Err(_) => LaunchOutcome::failed(format!(
                "{phase} command timed out after {}s",
                self.timeout.as_secs()
            )),
        }
    }
}

impl WorkerLauncher for CommandLauncher {
    fn start<'a>(&'a self, spec: &'a LaunchSpec) -> LaunchFuture<'a> {
        Box::pin(self.run(&self.start_command, spec, "start"))
    }

    fn stop<'a>(&'a self, spec: &'a LaunchSpec) -> LaunchFuture<'a> {
        Box::pin(self.run(&self.stop_command, spec, "stop"))
    }
}

/// Dry-run launcher used when no commands are configured.
pub struct NoopLauncher;

impl WorkerLauncher for NoopLauncher {
    fn start<'a>(&'a self, spec: &'a LaunchSpec) -> LaunchFuture<'a> {
        Box::pin(async move {
            info!(
                experiment = %spec.experiment_id,
                broker = %spec.broker,
                producers = spec.producers,
                consumers = spec.consumers,
                duration_secs = spec.duration_secs,
                "dry run: would start workers"
            );
            LaunchOutcome::ok("dry run")
        })
    }

    fn stop<'a>(&'a self, spec: &'a LaunchSpec) -> LaunchFuture<'a> {
        Box::pin(async move {
            info!(experiment = %spec.experiment_id, broker = %spec.broker, "dry run: would stop workers");
            LaunchOutcome::ok("dry run")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            experiment_id: "e1".into(),
            run: 3,
            broker: BrokerKind::RabbitMq,
            producers: 5,
            consumers: 2,
            duration_secs: 60,
        }
    }

    fn launcher(start: &[&str]) -> CommandLauncher {
        CommandLauncher::new(
            start.iter().map(|s| s.to_string()).collect(),
            Vec::new(),
            Duration::from_secs(5),
            "http://localhost:3000".into(),
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_receives_run_parameters() {
        let l = launcher(&["sh", "-c", "echo $BENCH_BROKER $BENCH_PRODUCERS $BENCH_CONSUMERS $BENCH_RUN"]);
        let outcome = l.start(&spec()).await;
        assert!(outcome.success);
        assert_eq!(outcome.output.trim(), "rabbitmq 5 2 3");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let l = launcher(&["sh", "-c", "echo boom >&2; exit 3"]);
        let outcome = l.start(&spec()).await;
        assert!(!outcome.success);
        assert!(outcome.output.contains("boom"));
    }

    #[tokio::test]
    async fn test_missing_command_is_failure() {
        let l = launcher(&["sh"]);
        let outcome = l.stop(&spec()).await;
        assert!(!outcome.success);
        assert!(outcome.output.contains("no stop command"));
    }

    #[tokio::test]
    async fn test_spawn_error_is_failure() {
        let l = launcher(&["/definitely/not/a/program"]);
        assert!(!l.start(&spec()).await.success);
    }
}
