/// In-memory registry of experiment records.
///
/// The store is a passive repository: it checks existence and id uniqueness,
/// and refuses to delete an experiment holding the running slot. Whether a
/// status change is legal is decided by the scheduler.

use bench_protocol::error::BenchError;
use bench_protocol::experiment::{Experiment, ExperimentStatus, NewExperiment};

#[derive(Debug, Default)]
pub struct ExperimentStore {
    /// Registration order
    experiments: Vec<Experiment>,
    next_id: u64,
}

impl ExperimentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, new: NewExperiment) -> Result<Experiment, BenchError> {
        new.validate()?;

        let id = match new.id {
            Some(id) => {
                if self.contains(&id) {
                    return Err(BenchError::DuplicateId(id));
                }
                id
            }
            None => self.fresh_id(),
        };

        let name = new
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("Experiment {}", self.experiments.len() + 1));

        let experiment = Experiment {
            id,
            name,
            broker: new.broker,
            producers: new.producers,
            consumers: new.consumers,
            duration_secs: new.duration_secs,
            status: ExperimentStatus::NotStarted,
        };
        self.experiments.push(experiment.clone());
        Ok(experiment)
    }

    pub fn remove(&mut self, id: &str) -> Result<Experiment, BenchError> {
        let idx = self
            .experiments
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| BenchError::NotFound(id.to_string()))?;

        let status = self.experiments[idx].status;
        if status.is_running() {
            return Err(BenchError::invalid_state(format!(
                "experiment {id} cannot be deleted while {}",
                status.label().to_lowercase()
            )));
        }
        Ok(self.experiments.remove(idx))
    }

    pub fn get(&self, id: &str) -> Result<&Experiment, BenchError> {
        self.experiments
            .iter()
            .find(|e| e.id == id)
            .ok_or_else(|| BenchError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.experiments.iter().any(|e| e.id == id)
    }

    pub fn list(&self) -> Vec<Experiment> {
        self.experiments.clone()
    }

    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    pub fn set_status(&mut self, id: &str, status: ExperimentStatus) -> Result<(), BenchError> {
        let experiment = self
            .experiments
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| BenchError::NotFound(id.to_string()))?;
        experiment.status = status;
        Ok(())
    }

    /// Ids currently holding a running-slot status.
    pub fn running_ids(&self) -> Vec<String> {
        self.experiments
            .iter()
            .filter(|e| e.status.is_running())
            .map(|e| e.id.clone())
            .collect()
    }

    fn fresh_id(&mut self) -> String {
        loop {
            self.next_id += 1;
            let id = format!("exp-{}", self.next_id);
            if !self.contains(&id) {
                return id;
            }
        }
    }
}
