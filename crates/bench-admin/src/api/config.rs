use std::time::Duration;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use bench_protocol::{DEFAULT_PUBLISH_INTERVAL_MS, DEFAULT_STATUS_INTERVAL_MS, DEFAULT_WINDOW_MS};

use crate::scheduler::LaunchFailurePolicy;
use crate::state::AppState;

/// Top-level TOML configuration file structure.
/// Every section is optional and falls back to its defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Bucket width
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_WINDOW_MS,
        }
    }
}

fn default_window_ms() -> u64 {
    DEFAULT_WINDOW_MS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Snapshot drain and publish period
    #[serde(default = "default_publish_interval_ms")]
    pub publish_interval_ms: u64,
    /// Per-observer version poll period
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            publish_interval_ms: DEFAULT_PUBLISH_INTERVAL_MS,
            status_interval_ms: DEFAULT_STATUS_INTERVAL_MS,
        }
    }
}

fn default_publish_interval_ms() -> u64 {
    DEFAULT_PUBLISH_INTERVAL_MS
}

fn default_status_interval_ms() -> u64 {
    DEFAULT_STATUS_INTERVAL_MS
}

impl FeedConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms.max(1))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub launch_failure_policy: LaunchFailurePolicy,
    /// Complete runs this long past their planned duration; unset disables
    #[serde(default)]
    pub completion_grace_secs: Option<u64>,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            launch_failure_policy: LaunchFailurePolicy::default(),
            completion_grace_secs: None,
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

fn default_tick_interval_ms() -> u64 {
    1000
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// argv of the worker start command; empty means dry run
    #[serde(default)]
    pub start_command: Vec<String>,
    #[serde(default)]
    pub stop_command: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Control-plane URL handed to workers
    #[serde(default = "default_control_url")]
    pub control_url: String,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            start_command: Vec::new(),
            stop_command: Vec::new(),
            timeout_secs: default_timeout_secs(),
            control_url: default_control_url(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_control_url() -> String {
    format!("http://localhost:{}", bench_protocol::DEFAULT_ADMIN_PORT)
}

impl LauncherConfig {
    pub fn is_dry_run(&self) -> bool {
        self.start_command.is_empty() && self.stop_command.is_empty()
    }
}

/// Load a BenchConfig from a TOML file on disk.
/// Returns the parsed config, or an error if the file cannot be read or parsed.
pub fn load_config(path: &str) -> anyhow::Result<BenchConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: BenchConfig = toml::from_str(&contents)?;
    Ok(config)
}

/// GET /api/config: the configuration the control plane is running with.
pub async fn get_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "config": state.inner.config }))
}
