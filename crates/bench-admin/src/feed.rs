/// Change feed for dashboards.
///
/// Three monotonic counters record that something happened:
///   experiments: any registry or status change
///   start      : a run reached IN_PROGRESS (countdown should start)
///   completion : a run completed normally
///
/// Each observer keeps a `FeedCursor` with the counter values it last saw and
/// polls on its own status tick; a mismatch produces the matching event and
/// advances the cursor. New cursors start at the current values, so a
/// reconnecting dashboard does not replay old countdowns or completions.
///
/// Aggregates travel separately: an independent publish tick drains the
/// aggregator and broadcasts one serialized snapshot to every observer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use bench_protocol::feed::FeedEvent;

use crate::aggregator::MetricAggregator;
use crate::scheduler::Scheduler;

/// Broadcast capacity for serialized aggregate snapshots
const AGGREGATES_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Default)]
pub struct FeedVersions {
    experiments: AtomicU64,
    start: AtomicU64,
    completion: AtomicU64,
}

impl FeedVersions {
    pub fn bump_experiments(&self) {
        self.experiments.fetch_add(1, Ordering::AcqRel);
    }

    pub fn bump_start(&self) {
        self.start.fetch_add(1, Ordering::AcqRel);
    }

    pub fn bump_completion(&self) {
        self.completion.fetch_add(1, Ordering::AcqRel);
    }

    pub fn current(&self) -> FeedCursor {
        FeedCursor {
            experiments: self.experiments.load(Ordering::Acquire),
            start: self.start.load(Ordering::Acquire),
            completion: self.completion.load(Ordering::Acquire),
        }
    }
}

/// Counter values an observer has already seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedCursor {
    pub experiments: u64,
    pub start: u64,
    pub completion: u64,
}

pub struct ChangeFeed {
    versions: Arc<FeedVersions>,
    scheduler: Arc<Scheduler>,
    aggregator: Arc<MetricAggregator>,
    aggregates_tx: broadcast::Sender<String>,
}

impl ChangeFeed {
    pub fn new(
        versions: Arc<FeedVersions>,
        scheduler: Arc<Scheduler>,
        aggregator: Arc<MetricAggregator>,
    ) -> Self {
        Self {
            versions,
            scheduler,
            aggregator,
            aggregates_tx: broadcast::channel(AGGREGATES_CHANNEL_CAPACITY).0,
        }
    }

    pub fn versions(&self) -> FeedCursor {
        self.versions.current()
    }

    /// Register an observer: a cursor at the current versions plus a
    /// receiver for aggregate snapshots.
    pub fn subscribe(&self) -> (FeedCursor, broadcast::Receiver<String>) {
        (self.versions.current(), self.aggregates_tx.subscribe())
    }

    /// Full experiment list, sent to observers when they connect.
    pub fn experiments_event(&self) -> FeedEvent {
        FeedEvent::Experiments {
            experiments: self.scheduler.list(),
        }
    }

    /// Compare `cursor` against the counters and emit what changed.
    pub fn poll(&self, cursor: &mut FeedCursor, now_ms: u64) -> Vec<FeedEvent> {
        let current = self.versions.current();
        let mut events = Vec::new();

        if cursor.experiments != current.experiments {
            events.push(self.experiments_event());
        }

        // Completions go first: a countdown resets the client dataset, and any
        // completion seen here finished before the run now in progress
        if cursor.completion != current.completion {
            let completed = self.scheduler.completed_between(cursor.completion, current.completion);
            let missed = current.completion.saturating_sub(cursor.completion) as usize;
            if completed.len() < missed {
                warn!(missed = missed - completed.len(), "completions fell out of history before delivery");
            }
            events.extend(completed.into_iter().map(|experiment| FeedEvent::Completed { experiment }));
        }

        if cursor.start != current.start {
            match self.scheduler.countdown(now_ms) {
                Some((experiment_id, remaining_secs)) => events.push(FeedEvent::Countdown {
                    experiment_id,
                    remaining_secs,
                }),
                None => debug!("start signal changed but no run is in progress"),
            }
        }

        *cursor = current;
        events
    }

    /// Drain the aggregator and push the snapshot to every observer.
    /// Returns the published event; empty snapshots are not published.
    pub fn publish_snapshot(&self) -> Option<FeedEvent> {
        let snapshot = self.aggregator.drain_snapshot();
        if snapshot.is_empty() {
            return None;
        }

        let messages = snapshot.message_count();
        let event = FeedEvent::Aggregates { snapshot };
        match serde_json::to_string(&event) {
            Ok(text) => {
                // No receivers is fine: nobody is watching, the data is dropped
                let receivers = self.aggregates_tx.send(text).unwrap_or(0);
                debug!(messages, receivers, "published aggregate snapshot");
            }
            Err(e) => warn!(error = %e, "failed to serialize aggregate snapshot"),
        }
        Some(event)
    }

    pub fn observer_count(&self) -> usize {
        self.aggregates_tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_protocol::experiment::{BrokerKind, NewExperiment};
    use bench_protocol::metrics::{Concentrations, MetricMessage};
    use crate::scheduler::{Intent, LaunchFailurePolicy};

    fn feed() -> (ChangeFeed, Arc<Scheduler>, Arc<MetricAggregator>) {
        let versions = Arc::new(FeedVersions::default());
        let scheduler = Arc::new(Scheduler::new(versions.clone(), LaunchFailurePolicy::Soft, None));
        let aggregator = Arc::new(MetricAggregator::new(1000));
        let feed = ChangeFeed::new(versions, scheduler.clone(), aggregator.clone());
        (feed, scheduler, aggregator)
    }

    fn add_and_start(s: &Scheduler, id: &str, now_ms: u64) {
        s.add(NewExperiment {
            id: Some(id.into()),
            name: None,
            broker: BrokerKind::Kafka,
            producers: 1,
            consumers: 1,
            duration_secs: 60,
        })
        .unwrap();
        s.enqueue(id).unwrap();
        s.start_ack(id, now_ms).unwrap();
    }

    #[test]
    fn test_new_observer_has_nothing_to_replay() {
        let (feed, scheduler, _) = feed();
        add_and_start(&scheduler, "e1", 0);

        let (mut cursor, _rx) = feed.subscribe();
        assert!(feed.poll(&mut cursor, 0).is_empty());
    }

    #[test]
    fn test_countdown_emitted_once_per_observer() {
        let (feed, scheduler, _) = feed();
        let (mut a, _rx_a) = feed.subscribe();
        let (mut b, _rx_b) = feed.subscribe();

        add_and_start(&scheduler, "e1", 5_000);

        for cursor in [&mut a, &mut b] {
            let events = feed.poll(cursor, 5_000);
            let countdowns: Vec<_> = events
                .iter()
                .filter_map(|e| match e {
                    FeedEvent::Countdown { remaining_secs, .. } => Some(*remaining_secs),
                    _ => None,
                })
                .collect();
            assert_eq!(countdowns, vec![60]);
            assert!(events.iter().any(|e| matches!(e, FeedEvent::Experiments { .. })));

            assert!(feed.poll(cursor, 6_000).is_empty());
        }
    }

    #[test]
    fn test_completion_event_carries_experiment() {
        let (feed, scheduler, _) = feed();
        add_and_start(&scheduler, "e1", 0);
        let (mut cursor, _rx) = feed.subscribe();

        let spec = match scheduler.complete("e1").unwrap().intents.as_slice() {
            [Intent::Stop(spec)] => spec.clone(),
            other => panic!("unexpected {other:?}"),
        };
        scheduler.stop_ack("e1", spec.run).unwrap();

        let events = feed.poll(&mut cursor, 1_000);
        let completed: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                FeedEvent::Completed { experiment } => Some(experiment.id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(completed, vec!["e1".to_string()]);
    }

    fn kinds(events: &[FeedEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.kind()).collect()
    }

    fn finish(s: &Scheduler, id: &str) {
        let spec = match s.complete(id).unwrap().intents.as_slice() {
            [Intent::Stop(spec)] => spec.clone(),
            other => panic!("unexpected {other:?}"),
        };
        s.stop_ack(id, spec.run).unwrap();
    }

    #[test]
    fn test_completion_precedes_next_countdown() {
        let (feed, scheduler, _) = feed();
        add_and_start(&scheduler, "e1", 0);
        scheduler
            .add(NewExperiment {
                id: Some("e2".into()),
                name: None,
                broker: BrokerKind::Kafka,
                producers: 1,
                consumers: 1,
                duration_secs: 30,
            })
            .unwrap();
        scheduler.enqueue("e2").unwrap();
        let (mut cursor, _rx) = feed.subscribe();

        // e1 finishes, e2 takes the slot and starts, all before the next poll
        finish(&scheduler, "e1");
        scheduler.start_ack("e2", 1_000).unwrap();

        let events = feed.poll(&mut cursor, 1_000);
        assert_eq!(kinds(&events), vec!["experiments", "completed", "countdown"]);

        // The client exports e1 before resetting for e2
        let mut ds = bench_protocol::dataset::ClientDataset::new();
        ds.handle(&FeedEvent::Aggregates {
            snapshot: {
                let agg = MetricAggregator::new(1000);
                agg.record(
                    &MetricMessage {
                        station_id: "a".into(),
                        timestamp_ms: 500,
                        coordinates: None,
                        concentrations: Concentrations::default(),
                    },
                    600,
                );
                agg.drain_snapshot()
            },
        });
        let mut exported = None;
        for event in &events {
            if let FeedEvent::Completed { experiment } = event {
                exported = Some((experiment.id.clone(), ds.is_empty()));
            }
            ds.handle(event);
        }
        assert_eq!(exported, Some(("e1".to_string(), false)));
        assert!(ds.is_empty());
    }

    #[test]
    fn test_every_completion_between_polls_is_delivered() {
        let (feed, scheduler, _) = feed();
        let (mut cursor, _rx) = feed.subscribe();
        for id in ["e1", "e2"] {
            add_and_start(&scheduler, id, 0);
            finish(&scheduler, id);
        }

        let events = feed.poll(&mut cursor, 0);
        let completed: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                FeedEvent::Completed { experiment } => Some(experiment.id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(completed, vec!["e1", "e2"]);
        assert!(feed.poll(&mut cursor, 0).is_empty());
    }

    #[tokio::test]
    async fn test_publish_drains_and_broadcasts() {
        let (feed, _, aggregator) = feed();
        let (_, mut rx) = feed.subscribe();

        assert!(feed.publish_snapshot().is_none());

        aggregator.record(
            &MetricMessage {
                station_id: "a".into(),
                timestamp_ms: 1_500,
                coordinates: None,
                concentrations: Concentrations::default(),
            },
            1_510,
        );
        let event = feed.publish_snapshot().unwrap();
        assert!(matches!(event, FeedEvent::Aggregates { ref snapshot } if snapshot.message_count() == 1));

        let text = rx.recv().await.unwrap();
        let received: FeedEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(received, event);

        // Table is empty again after the publish
        assert!(feed.publish_snapshot().is_none());
    }
}
