/// Experiment lifecycle state machine.
///
/// Owns the experiment store, the FIFO queue and the single running slot
/// behind one mutex, so every event (API call, worker signal, launcher
/// outcome, tick) applies completely before the next one is observed.
///
/// ```text
///   NOT_STARTED/COMPLETED --enqueue--> IN_QUEUE --slot free--> STARTING
///   STARTING --start-ack--> IN_PROGRESS
///   IN_PROGRESS --stop-request--> STOPPING(forced) --stop-ack--> NOT_STARTED
///   IN_PROGRESS --completion--> STOPPING(normal) --stop-ack--> COMPLETED
///   IN_QUEUE --dequeue--> NOT_STARTED
/// ```
///
/// Transitions never wait on the launcher. They return `Intent`s which the
/// dispatcher runs in the background; launcher outcomes come back through
/// `start_outcome` / `stop_outcome`. Every intent carries the run number it
/// was issued for, and any signal that no longer matches the slot is stale.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use bench_protocol::error::BenchError;
use bench_protocol::experiment::{
    ControlOutcome, Experiment, ExperimentStatus, NewExperiment, QueueState,
};

use crate::feed::FeedVersions;
use crate::launcher::{LaunchOutcome, LaunchSpec};
use crate::store::ExperimentStore;

/// Completed runs kept for observers that poll less often than runs finish
const COMPLETION_HISTORY: usize = 16;

/// What a failed start/stop command means for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchFailurePolicy {
    /// Log and carry on as if the command succeeded.
    #[default]
    Soft,
    /// A failed start aborts the run; a failed stop keeps it STOPPING.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// Operator stop, resolves to NOT_STARTED
    Forced,
    /// Workers finished, resolves to COMPLETED
    Normal,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Start(LaunchSpec),
    Stop(LaunchSpec),
}

/// Outcome of a control call plus the intents it produced.
#[derive(Debug, Clone)]
pub struct Transition {
    pub outcome: ControlOutcome,
    pub intents: Vec<Intent>,
}

impl Transition {
    fn new(outcome: ControlOutcome, intents: Vec<Intent>) -> Self {
        Self { outcome, intents }
    }
}

#[derive(Debug, Clone)]
pub struct RunningSlot {
    pub experiment_id: String,
    pub run: u64,
    /// Set by start-ack
    pub started_at_ms: Option<u64>,
    /// Stop requested while still STARTING
    pub pending_stop: bool,
    pub stop_kind: Option<StopKind>,
}

#[derive(Debug, Default)]
struct SchedulerState {
    store: ExperimentStore,
    queue: VecDeque<String>,
    slot: Option<RunningSlot>,
    runs: u64,
    /// Completed runs tagged with the completion counter value they produced
    completions: VecDeque<(u64, Experiment)>,
    completion_seq: u64,
}

pub struct Scheduler {
    state: Mutex<SchedulerState>,
    versions: Arc<FeedVersions>,
    policy: LaunchFailurePolicy,
    /// Deadline watchdog grace; None disables it
    completion_grace_ms: Option<u64>,
}

impl Scheduler {
    pub fn new(
        versions: Arc<FeedVersions>,
        policy: LaunchFailurePolicy,
        completion_grace_secs: Option<u64>,
    ) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            versions,
            policy,
            completion_grace_ms: completion_grace_secs.map(|s| s.saturating_mul(1000)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn policy(&self) -> LaunchFailurePolicy {
        self.policy
    }

    // ── Registry ──

    pub fn add(&self, new: NewExperiment) -> Result<Experiment, BenchError> {
        let experiment = self.lock().store.add(new)?;
        info!(experiment = %experiment.id, name = %experiment.name, broker = %experiment.broker, "experiment registered");
        self.versions.bump_experiments();
        Ok(experiment)
    }

    pub fn remove(&self, id: &str) -> Result<Experiment, BenchError> {
        let removed = {
            let mut st = self.lock();
            let removed = st.store.remove(id)?;
            st.queue.retain(|q| q != id);
            removed
        };
        info!(experiment = %id, "experiment deleted");
        self.versions.bump_experiments();
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Result<Experiment, BenchError> {
        self.lock().store.get(id).cloned()
    }

    pub fn list(&self) -> Vec<Experiment> {
        self.lock().store.list()
    }

    pub fn queue_state(&self) -> QueueState {
        let st = self.lock();
        QueueState {
            running: st.slot.as_ref().map(|s| s.experiment_id.clone()),
            queue: st.queue.iter().cloned().collect(),
        }
    }

    pub fn running(&self) -> Option<RunningSlot> {
        self.lock().slot.clone()
    }

    pub fn last_completed(&self) -> Option<Experiment> {
        self.lock().completions.back().map(|(_, e)| e.clone())
    }

    /// Runs completed after counter value `seen`, up to and including `upto`,
    /// oldest first. Older completions beyond the history are gone.
    pub fn completed_between(&self, seen: u64, upto: u64) -> Vec<Experiment> {
        self.lock()
            .completions
            .iter()
            .filter(|(seq, _)| *seq > seen && *seq <= upto)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Remaining seconds of the IN_PROGRESS run, if any.
    pub fn countdown(&self, now_ms: u64) -> Option<(String, u64)> {
        let st = self.lock();
        let slot = st.slot.as_ref()?;
        let started = slot.started_at_ms?;
        let experiment = st.store.get(&slot.experiment_id).ok()?;
        if experiment.status != ExperimentStatus::InProgress {
            return None;
        }
        let end_ms = started.saturating_add(experiment.duration_secs.saturating_mul(1000));
        let remaining = end_ms.saturating_sub(now_ms).div_ceil(1000);
        Some((slot.experiment_id.clone(), remaining))
    }

    // ── Operator transitions ──

    pub fn enqueue(&self, id: &str) -> Result<Transition, BenchError> {
        let mut st = self.lock();
        let status = st.store.get(id)?.status;

        if st.slot.as_ref().is_some_and(|s| s.experiment_id == id) {
            return Ok(Transition::new(
                ControlOutcome::noop(format!("experiment {id} is already running")),
                Vec::new(),
            ));
        }
        if st.queue.iter().any(|q| q == id) {
            return Ok(Transition::new(
                ControlOutcome::noop(format!("experiment {id} is already queued")),
                Vec::new(),
            ));
        }
        if !status.can_enqueue() {
            return Ok(Transition::new(
                ControlOutcome::noop(format!("experiment {id} cannot be queued while {}", status.label().to_lowercase())),
                Vec::new(),
            ));
        }

        st.store.set_status(id, ExperimentStatus::InQueue)?;
        st.queue.push_back(id.to_string());
        info!(experiment = %id, position = st.queue.len(), "experiment queued");

        let intents = advance_queue(&mut st);
        let experiment = st.store.get(id)?.clone();
        drop(st);

        self.versions.bump_experiments();
        Ok(Transition::new(
            ControlOutcome::ok(format!("experiment {id} queued")).with_experiment(experiment),
            intents,
        ))
    }

    pub fn dequeue(&self, id: &str) -> Result<ControlOutcome, BenchError> {
        let mut st = self.lock();
        st.store.get(id)?;
        let Some(pos) = st.queue.iter().position(|q| q == id) else {
            return Err(BenchError::invalid_state(format!("experiment {id} is not queued")));
        };

        st.queue.remove(pos);
        st.store.set_status(id, ExperimentStatus::NotStarted)?;
        let experiment = st.store.get(id)?.clone();
        drop(st);

        info!(experiment = %id, "experiment removed from queue");
        self.versions.bump_experiments();
        Ok(ControlOutcome::ok(format!("experiment {id} removed from queue")).with_experiment(experiment))
    }

    /// Manual stop of the running experiment.
    pub fn stop(&self, id: &str) -> Result<Transition, BenchError> {
        let mut st = self.lock();
        st.store.get(id)?;

        let slot = match st.slot.as_ref() {
            None => return Err(BenchError::invalid_state("no experiment is running")),
            Some(slot) if slot.experiment_id != id => {
                return Err(BenchError::invalid_state(format!(
                    "experiment {id} is not the running experiment ({})",
                    slot.experiment_id
                )))
            }
            Some(slot) => slot,
        };
        let run = slot.run;
        let status = st.store.get(id)?.status;

        match status {
            ExperimentStatus::Starting => {
                if let Some(slot) = st.slot.as_mut() {
                    slot.pending_stop = true;
                }
                info!(experiment = %id, run, "stop deferred until workers report started");
                Ok(Transition::new(
                    ControlOutcome::ok(format!("experiment {id} will stop once its workers have started")),
                    Vec::new(),
                ))
            }
            ExperimentStatus::InProgress => {
                let intent = begin_stop(&mut st, StopKind::Forced)?;
                let experiment = st.store.get(id)?.clone();
                drop(st);
                self.versions.bump_experiments();
                Ok(Transition::new(
                    ControlOutcome::ok(format!("stopping experiment {id}")).with_experiment(experiment),
                    vec![intent],
                ))
            }
            ExperimentStatus::Stopping => {
                // Re-issue the stop command for a run stuck in STOPPING
                let experiment = st.store.get(id)?.clone();
                let intent = Intent::Stop(launch_spec(&experiment, run));
                warn!(experiment = %id, run, "re-issuing stop intent");
                Ok(Transition::new(
                    ControlOutcome::ok(format!("experiment {id} is already stopping, stop re-issued")),
                    vec![intent],
                ))
            }
            other => Err(BenchError::invalid_state(format!(
                "experiment {id} cannot be stopped while {}",
                other.label().to_lowercase()
            ))),
        }
    }

    // ── Worker and launcher signals ──

    /// Workers report they are connected and producing.
    pub fn start_ack(&self, id: &str, now_ms: u64) -> Result<Transition, BenchError> {
        let mut st = self.lock();
        let run = current_run(&st, id, ExperimentStatus::Starting, "start-ack")?;

        st.store.set_status(id, ExperimentStatus::InProgress)?;
        let pending_stop = match st.slot.as_mut() {
            Some(slot) => {
                slot.started_at_ms = Some(now_ms);
                slot.pending_stop
            }
            None => false,
        };
        info!(experiment = %id, run, "experiment in progress");

        if pending_stop {
            let intent = begin_stop(&mut st, StopKind::Forced)?;
            drop(st);
            info!(experiment = %id, run, "applying deferred stop");
            self.versions.bump_experiments();
            return Ok(Transition::new(
                ControlOutcome::ok(format!("experiment {id} started and is being stopped as requested")),
                vec![intent],
            ));
        }

        drop(st);
        self.versions.bump_experiments();
        self.versions.bump_start();
        Ok(Transition::new(ControlOutcome::ok(format!("experiment {id} in progress")), Vec::new()))
    }

    /// Workers report the run finished.
    pub fn complete(&self, id: &str) -> Result<Transition, BenchError> {
        let mut st = self.lock();
        let run = current_run(&st, id, ExperimentStatus::InProgress, "completion")?;

        let intent = begin_stop(&mut st, StopKind::Normal)?;
        drop(st);
        info!(experiment = %id, run, "experiment finished, stopping workers");
        self.versions.bump_experiments();
        Ok(Transition::new(
            ControlOutcome::ok(format!("experiment {id} finished")),
            vec![intent],
        ))
    }

    /// Result of a start intent.
    pub fn start_outcome(&self, spec: &LaunchSpec, outcome: &LaunchOutcome) -> Vec<Intent> {
        if outcome.success {
            return Vec::new();
        }

        match self.policy {
            LaunchFailurePolicy::Soft => {
                warn!(experiment = %spec.experiment_id, run = spec.run, output = %outcome.output, "start command reported failure, continuing");
                Vec::new()
            }
            LaunchFailurePolicy::Strict => {
                let mut st = self.lock();
                let still_starting = st.slot.as_ref().is_some_and(|s| s.experiment_id == spec.experiment_id && s.run == spec.run)
                    && st.store.get(&spec.experiment_id).map(|e| e.status) == Ok(ExperimentStatus::Starting);
                if !still_starting {
                    warn!(experiment = %spec.experiment_id, run = spec.run, "start failure for a run that is no longer starting, ignored");
                    return Vec::new();
                }

                error!(experiment = %spec.experiment_id, run = spec.run, output = %outcome.output, "start command failed, aborting run");
                st.slot = None;
                if st.store.set_status(&spec.experiment_id, ExperimentStatus::NotStarted).is_err() {
                    warn!(experiment = %spec.experiment_id, "aborted experiment vanished from store");
                }
                let intents = advance_queue(&mut st);
                drop(st);
                self.versions.bump_experiments();
                intents
            }
        }
    }

    /// Result of a stop intent. A successful stop is the stop-ack.
    pub fn stop_outcome(&self, spec: &LaunchSpec, outcome: &LaunchOutcome) -> Vec<Intent> {
        if !outcome.success {
            match self.policy {
                LaunchFailurePolicy::Soft => {
                    warn!(experiment = %spec.experiment_id, run = spec.run, output = %outcome.output, "stop command reported failure, continuing");
                }
                LaunchFailurePolicy::Strict => {
                    error!(experiment = %spec.experiment_id, run = spec.run, output = %outcome.output, "stop command failed, run stays stopping");
                    return Vec::new();
                }
            }
        }

        match self.stop_ack(&spec.experiment_id, spec.run) {
            Ok(intents) => intents,
            Err(e) => {
                warn!(error = %e, "discarding stop-ack");
                Vec::new()
            }
        }
    }

    /// Workers for `run` are gone: free the slot and advance the queue.
    pub fn stop_ack(&self, id: &str, run: u64) -> Result<Vec<Intent>, BenchError> {
        let mut st = self.lock();
        let current = current_run(&st, id, ExperimentStatus::Stopping, "stop-ack")?;
        if current != run {
            return Err(BenchError::stale(id, format!("stop-ack for run {run}, current run is {current}")));
        }

        let kind = st.slot.as_ref().and_then(|s| s.stop_kind).unwrap_or(StopKind::Forced);
        st.slot = None;

        let completed = match kind {
            StopKind::Forced => {
                st.store.set_status(id, ExperimentStatus::NotStarted)?;
                info!(experiment = %id, run, "experiment stopped");
                false
            }
            StopKind::Normal => {
                st.store.set_status(id, ExperimentStatus::Completed)?;
                let experiment = st.store.get(id)?.clone();
                st.completion_seq += 1;
                let seq = st.completion_seq;
                st.completions.push_back((seq, experiment));
                if st.completions.len() > COMPLETION_HISTORY {
                    st.completions.pop_front();
                }
                info!(experiment = %id, run, "experiment completed");
                true
            }
        };

        let intents = advance_queue(&mut st);
        drop(st);

        self.versions.bump_experiments();
        if completed {
            self.versions.bump_completion();
        }
        Ok(intents)
    }

    /// Periodic housekeeping: fire completion for runs past their planned
    /// duration plus the grace period.
    pub fn tick(&self, now_ms: u64) -> Vec<Intent> {
        let Some(grace_ms) = self.completion_grace_ms else {
            return Vec::new();
        };

        let overdue = {
            let st = self.lock();
            st.slot.as_ref().and_then(|slot| {
                let started = slot.started_at_ms?;
                let experiment = st.store.get(&slot.experiment_id).ok()?;
                let deadline = started
                    .saturating_add(experiment.duration_secs.saturating_mul(1000))
                    .saturating_add(grace_ms);
                (experiment.status == ExperimentStatus::InProgress && now_ms >= deadline)
                    .then(|| slot.experiment_id.clone())
            })
        };

        match overdue {
            Some(id) => {
                warn!(experiment = %id, "no completion reported within grace period, completing");
                self.complete(&id).map(|t| t.intents).unwrap_or_default()
            }
            None => Vec::new(),
        }
    }
}

/// The slot's run number if `id` holds the slot in `expected` status.
fn current_run(
    st: &SchedulerState,
    id: &str,
    expected: ExperimentStatus,
    signal: &str,
) -> Result<u64, BenchError> {
    let status = st.store.get(id)?.status;
    let slot = match st.slot.as_ref() {
        Some(slot) if slot.experiment_id == id => slot,
        Some(slot) => {
            let err = BenchError::stale(id, format!("{signal} while {} holds the running slot", slot.experiment_id));
            warn!(error = %err, "stale signal discarded");
            return Err(err);
        }
        None => {
            let err = BenchError::stale(id, format!("{signal} while nothing is running"));
            warn!(error = %err, "stale signal discarded");
            return Err(err);
        }
    };
    if status != expected {
        let err = BenchError::stale(id, format!("{signal} while {}", status.label().to_lowercase()));
        warn!(error = %err, "stale signal discarded");
        return Err(err);
    }
    Ok(slot.run)
}

/// Move the running experiment to STOPPING and build its stop intent.
fn begin_stop(st: &mut SchedulerState, kind: StopKind) -> Result<Intent, BenchError> {
    let (id, run) = match st.slot.as_mut() {
        Some(slot) => {
            slot.stop_kind = Some(kind);
            slot.pending_stop = false;
            (slot.experiment_id.clone(), slot.run)
        }
        None => return Err(BenchError::invalid_state("no experiment is running")),
    };
    st.store.set_status(&id, ExperimentStatus::Stopping)?;
    let experiment = st.store.get(&id)?;
    Ok(Intent::Stop(launch_spec(experiment, run)))
}

/// Start queued experiments until the slot is taken or the queue is empty.
fn advance_queue(st: &mut SchedulerState) -> Vec<Intent> {
    let mut intents = Vec::new();
    while st.slot.is_none() {
        let Some(id) = st.queue.pop_front() else {
            break;
        };
        let experiment = match st.store.get(&id) {
            Ok(e) => e.clone(),
            Err(_) => continue,
        };

        st.runs += 1;
        let run = st.runs;
        if st.store.set_status(&id, ExperimentStatus::Starting).is_err() {
            continue;
        }
        st.slot = Some(RunningSlot {
            experiment_id: id.clone(),
            run,
            started_at_ms: None,
            pending_stop: false,
            stop_kind: None,
        });
        info!(experiment = %id, run, broker = %experiment.broker, "starting experiment");
        intents.push(Intent::Start(launch_spec(&experiment, run)));
    }
    intents
}

fn launch_spec(experiment: &Experiment, run: u64) -> LaunchSpec {
    LaunchSpec {
        experiment_id: experiment.id.clone(),
        run,
        broker: experiment.broker,
        producers: experiment.producers,
        consumers: experiment.consumers,
        duration_secs: experiment.duration_secs,
    }
}
