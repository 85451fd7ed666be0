use crate::models::{Job, ProgressEvent};
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::info;

/// In-process fan-out of stage transitions. Slow subscribers lose the oldest
/// events rather than blocking workers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, job: &Job, message: impl Into<String>) {
        let event = ProgressEvent {
            job_id: job.id.clone(),
            batch_id: job.batch_id.clone(),
            stage: job.stage,
            message: message.into(),
            at: Utc::now(),
        };
        info!(
            target = "crosslist.events",
            job_id = %event.job_id,
            batch_id = %event.batch_id,
            stage = %event.stage,
            message = %event.message,
            "progress"
        );
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}
