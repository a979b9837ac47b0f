/// Experiment records and control API message types.
///
/// An experiment describes one benchmark run against a broker: which broker,
/// how many producer/consumer workers, and for how long. Its `status` is owned
/// by the control-plane scheduler.

use serde::{Deserialize, Serialize};

use crate::error::BenchError;

/// Broker under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Kafka,
    #[serde(alias = "rabbit")]
    RabbitMq,
}

impl BrokerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerKind::Kafka => "kafka",
            BrokerKind::RabbitMq => "rabbitmq",
        }
    }

    /// Display name used in artifact file names.
    pub fn display_name(&self) -> &'static str {
        match self {
            BrokerKind::Kafka => "Kafka",
            BrokerKind::RabbitMq => "RabbitMQ",
        }
    }
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BrokerKind {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kafka" => Ok(BrokerKind::Kafka),
            "rabbitmq" | "rabbit" => Ok(BrokerKind::RabbitMq),
            other => Err(BenchError::InvalidRequest(format!("unknown broker '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    NotStarted,
    InQueue,
    Starting,
    InProgress,
    Stopping,
    Completed,
}

impl ExperimentStatus {
    /// Whether this status occupies the running slot.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ExperimentStatus::Starting | ExperimentStatus::InProgress | ExperimentStatus::Stopping
        )
    }

    /// Whether an experiment in this status may be enqueued for a fresh run.
    pub fn can_enqueue(&self) -> bool {
        matches!(self, ExperimentStatus::NotStarted | ExperimentStatus::Completed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExperimentStatus::NotStarted => "Not started",
            ExperimentStatus::InQueue => "In queue",
            ExperimentStatus::Starting => "Starting",
            ExperimentStatus::InProgress => "In progress",
            ExperimentStatus::Stopping => "Stopping",
            ExperimentStatus::Completed => "Completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub broker: BrokerKind,
    pub producers: u32,
    pub consumers: u32,
    pub duration_secs: u64,
    pub status: ExperimentStatus,
}

/// Registration request for a new experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExperiment {
    /// Caller-chosen id; the store assigns one when absent
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub broker: BrokerKind,
    pub producers: u32,
    #[serde(default = "default_consumers")]
    pub consumers: u32,
    pub duration_secs: u64,
}

fn default_consumers() -> u32 {
    1
}

impl NewExperiment {
    /// Reject registrations that could never run.
    pub fn validate(&self) -> Result<(), BenchError> {
        if let Some(id) = &self.id {
            if id.trim().is_empty() {
                return Err(BenchError::InvalidRequest("id must not be empty".into()));
            }
        }
        if self.producers == 0 {
            return Err(BenchError::InvalidRequest("producers must be at least 1".into()));
        }
        if self.consumers == 0 {
            return Err(BenchError::InvalidRequest("consumers must be at least 1".into()));
        }
        if self.duration_secs == 0 {
            return Err(BenchError::InvalidRequest("duration_secs must be at least 1".into()));
        }
        Ok(())
    }
}

/// Result of a mutating control call. `success: false` is a no-op, not a
/// failure that needs retrying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlOutcome {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment: Option<Experiment>,
}

impl ControlOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            experiment: None,
        }
    }

    pub fn noop(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            experiment: None,
        }
    }

    pub fn with_experiment(mut self, experiment: Experiment) -> Self {
        self.experiment = Some(experiment);
        self
    }
}

/// Body of the worker "started" / "finished" signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSignal {
    pub experiment_id: String,
}

/// Queue order and running slot, as reported by `/api/queue`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueState {
    pub running: Option<String>,
    pub queue: Vec<String>,
}
