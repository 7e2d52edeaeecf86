use serde::Serialize;
use std::sync::mpsc::{Receiver, Sender, channel};

use super::core::{JobId, JobStatus, Outcome, ProgressSnapshot};

/// Notification about one job, delivered to every subscriber
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Progress(ProgressSnapshot),
    LogLine(String),
    StatusChanged(JobStatus),
    /// Sent exactly once per job, after its final status change
    Completed(Outcome),
}

impl JobEvent {
    pub fn new(job_id: JobId, kind: EventKind) -> Self {
        Self { job_id, kind }
    }
}

/// Fan-out of job events to any number of channel subscribers.
/// Owned by the scheduler thread, so no locking is involved.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Vec<Sender<JobEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> Receiver<JobEvent> {
        let (tx, rx) = channel();
        self.subscribers.push(tx);
        rx
    }

    /// Deliver to every live subscriber; subscribers whose receiver was dropped are forgotten
    pub fn publish(&mut self, event: JobEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
