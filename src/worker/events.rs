use serde_json::Value;
use tokio::sync::broadcast;

use super::stats::{StatsSnapshot, WorkerState};

/// Hooks a [`WorkerCore`](super::WorkerCore) calls as it runs.
///
/// All methods default to no-ops so observers implement only what they use.
/// They are called from the worker loop and must not block.
pub trait WorkerObserver: Send + Sync {
    fn on_status(&self, _state: WorkerState) {}

    fn on_job_started(&self, _job_id: &str) {}

    fn on_job_completed(&self, _job_id: &str, _result: &Value) {}

    fn on_job_failed(&self, _job_id: &str, _message: &str) {}

    fn on_error(&self, _message: &str) {}
}

pub struct NoopObserver;

impl WorkerObserver for NoopObserver {}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Status(WorkerState),
    JobStarted(String),
    JobCompleted { job_id: String, result: Value },
    JobFailed { job_id: String, message: String },
    Error(String),
    Stats(StatsSnapshot),
}

/// Republishes observer calls as [`WorkerEvent`]s on a broadcast channel.
pub struct BroadcastObserver {
    events: broadcast::Sender<WorkerEvent>,
}

impl BroadcastObserver {
    pub fn new(events: broadcast::Sender<WorkerEvent>) -> Self {
        Self { events }
    }

    fn publish(&self, event: WorkerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl WorkerObserver for BroadcastObserver {
    fn on_status(&self, state: WorkerState) {
        self.publish(WorkerEvent::Status(state));
    }

    fn on_job_started(&self, job_id: &str) {
        self.publish(WorkerEvent::JobStarted(job_id.to_string()));
    }

    fn on_job_completed(&self, job_id: &str, result: &Value) {
        self.publish(WorkerEvent::JobCompleted {
            job_id: job_id.to_string(),
            result: result.clone(),
        });
    }

    fn on_job_failed(&self, job_id: &str, message: &str) {
        self.publish(WorkerEvent::JobFailed {
            job_id: job_id.to_string(),
            message: message.to_string(),
        });
    }

    fn on_error(&self, message: &str) {
        self.publish(WorkerEvent::Error(message.to_string()));
    }
}
