use std::sync::Mutex;

use serde::Serialize;
use tracing::debug;

/// Receives percent-complete updates from a running job or strategy.
pub trait ProgressSink: Send + Sync {
    fn set_progress(&self, percent: u8, message: &str);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub percent: u8,
    pub message: String,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            percent: 0,
            message: "Waiting".into(),
        }
    }
}

/// The progress of one queued job. Percentages never go backwards.
#[derive(Debug)]
pub struct ProgressReporter {
    name: String,
    state: Mutex<Progress>,
}

impl ProgressReporter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(Progress::default()),
        }
    }

    pub fn snapshot(&self) -> Progress {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ProgressSink for ProgressReporter {
    fn set_progress(&self, percent: u8, message: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.percent = percent.min(100).max(state.percent);
        state.message = message.to_string();
        debug!(job = %self.name, "{}% : {}", state.percent, message);
    }
}

/// Maps a nested 0-100 progress range onto `[from, to]` of the outer sink.
pub struct ScaledProgress<'a> {
    inner: &'a dyn ProgressSink,
    from: u8,
    to: u8,
}

impl<'a> ScaledProgress<'a> {
    pub fn new(inner: &'a dyn ProgressSink, from: u8, to: u8) -> Self {
        debug_assert!(from <= to && to <= 100);
        Self { inner, from, to }
    }
}

impl ProgressSink for ScaledProgress<'_> {
    fn set_progress(&self, percent: u8, message: &str) {
        let span = u32::from(self.to - self.from);
        let scaled = u32::from(self.from) + span * u32::from(percent.min(100)) / 100;
        self.inner.set_progress(scaled as u8, message);
    }
}

/// Discards all updates.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn set_progress(&self, _percent: u8, _message: &str) {}
}

/// Percentage of `done` out of `total` mapped onto `[from, to]`.
pub fn fraction(done: usize, total: usize, from: u8, to: u8) -> u8 {
    if total == 0 {
        return to;
    }
    let span = (to - from) as usize;
    from + (span * done.min(total) / total) as u8
}
