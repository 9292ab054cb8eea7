use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::JobId;
use crate::model::Ms;

/// The durable record of one finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHistory {
    pub id: JobId,
    pub name: String,
    pub kind: String,
    /// `None` when the job never started (an upstream failed).
    pub start: Option<Ms>,
    pub end: Ms,
    /// The final progress message, or the error.
    pub status: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    Io(String),
}

impl std::fmt::Display for HistoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryError::Io(e) => write!(f, "job history I/O error: {e}"),
        }
    }
}

impl std::error::Error for HistoryError {}

impl From<std::io::Error> for HistoryError {
    fn from(e: std::io::Error) -> Self {
        HistoryError::Io(e.to_string())
    }
}

/// Where finished jobs are recorded.
pub trait JobHistorySink: Send + Sync {
    fn record(&self, entry: &JobHistory) -> Result<(), HistoryError>;
}

/// Keeps history in memory. Used when no data directory is wanted, and by tests.
#[derive(Default)]
pub struct MemoryHistory {
    entries: Mutex<Vec<JobHistory>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<JobHistory> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl JobHistorySink for MemoryHistory {
    fn record(&self, entry: &JobHistory) -> Result<(), HistoryError> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        Ok(())
    }
}
