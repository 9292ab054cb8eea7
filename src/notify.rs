use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::job::{JobId, JobState};
use crate::model::Ms;

const CHANNEL_CAPACITY: usize = 256;

/// A job changed state.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub id: JobId,
    pub name: String,
    pub kind: &'static str,
    pub state: JobState,
    pub at: Ms,
}

/// Broadcast hub for job lifecycle events, queue-wide and per job.
pub struct NotifyHub {
    all: broadcast::Sender<JobEvent>,
    channels: DashMap<JobId, broadcast::Sender<JobEvent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            channels: DashMap::new(),
        }
    }

    /// Every event of every job.
    pub fn subscribe_all(&self) -> broadcast::Receiver<JobEvent> {
        self.all.subscribe()
    }

    /// Events of one job. Creates the channel if needed.
    pub fn subscribe(&self, id: JobId) -> broadcast::Receiver<JobEvent> {
        let sender = self
            .channels
            .entry(id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send an event. No-op if nobody is listening.
    pub fn send(&self, event: &JobEvent) {
        let _ = self.all.send(event.clone());
        if let Some(sender) = self.channels.get(&event.id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a job's channel once the job leaves the queue.
    pub fn remove(&self, id: &JobId) {
        self.channels.remove(id);
    }
}
