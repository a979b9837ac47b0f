/// Runs scheduler intents against the worker launcher.
///
/// Each intent becomes a detached tokio task. When the launcher returns, the
/// outcome is handed back to the scheduler, and whatever intents that produces
/// (a stop-ack advancing the queue, a strict start failure) are dispatched in
/// turn. Nothing here holds the scheduler lock across an await.

use std::sync::Arc;

use tracing::{debug, info};

use crate::launcher::WorkerLauncher;
use crate::scheduler::{Intent, Scheduler};

#[derive(Clone)]
pub struct Dispatcher {
    scheduler: Arc<Scheduler>,
    launcher: Arc<dyn WorkerLauncher>,
}

impl Dispatcher {
    pub fn new(scheduler: Arc<Scheduler>, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self { scheduler, launcher }
    }

    pub fn dispatch(&self, intents: Vec<Intent>) {
        for intent in intents {
            let this = self.clone();
            tokio::spawn(async move { this.run(intent).await });
        }
    }

    async fn run(&self, intent: Intent) {
        let follow_up = match intent {
            Intent::Start(spec) => {
                debug!(experiment = %spec.experiment_id, run = spec.run, "dispatching start");
                let outcome = self.launcher.start(&spec).await;
                if outcome.success {
                    info!(experiment = %spec.experiment_id, run = spec.run, "start command finished");
                }
                self.scheduler.start_outcome(&spec, &outcome)
            }
            Intent::Stop(spec) => {
                debug!(experiment = %spec.experiment_id, run = spec.run, "dispatching stop");
                let outcome = self.launcher.stop(&spec).await;
                if outcome.success {
                    info!(experiment = %spec.experiment_id, run = spec.run, "stop command finished");
                }
                self.scheduler.stop_outcome(&spec, &outcome)
            }
        };

        if !follow_up.is_empty() {
            self.dispatch(follow_up);
        }
    }
}
