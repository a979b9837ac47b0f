/// Events pushed to dashboards over the change subscription.
///
/// Serialized as JSON text frames tagged by `type`:
///   experiments: full experiment list after any status/registry change
///   countdown  : remaining seconds of a run that just started
///   completed  : the experiment whose run just completed normally
///   aggregates : every bucket accumulated since the previous publish

use serde::{Deserialize, Serialize};

use crate::experiment::Experiment;
use crate::metrics::Snapshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    Experiments { experiments: Vec<Experiment> },
    Countdown { experiment_id: String, remaining_secs: u64 },
    Completed { experiment: Experiment },
    Aggregates { snapshot: Snapshot },
}

impl FeedEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            FeedEvent::Experiments { .. } => "experiments",
            FeedEvent::Countdown { .. } => "countdown",
            FeedEvent::Completed { .. } => "completed",
            FeedEvent::Aggregates { .. } => "aggregates",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_wire_format() {
        let ev = FeedEvent::Countdown {
            experiment_id: "e1".into(),
            remaining_secs: 60,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "countdown");
        assert_eq!(json["remaining_secs"], 60);
        assert_eq!(ev.kind(), "countdown");

        let parsed: FeedEvent =
            serde_json::from_str(r#"{"type":"aggregates","snapshot":{"stations":{}}}"#).unwrap();
        assert!(matches!(parsed, FeedEvent::Aggregates { ref snapshot } if snapshot.is_empty()));
    }
}
