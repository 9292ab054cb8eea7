//! Units of pipeline work and the dependency-aware queue that runs them.

pub mod acquire;
pub mod associate;
pub mod chain;
pub mod clump;
pub mod history;
pub mod progress;
pub mod queue;
pub mod queued;
pub mod reconcile;


use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::model::{DateRange, Ms, SourceId, StreamId};
use crate::repository::{Repositories, StoreError};
use crate::strategy::acquire::AcquireError;
use crate::strategy::{ConfigError, MethodError, MethodRegistry};

pub use progress::{ProgressReporter, ProgressSink};
pub use queue::JobQueue;
pub use queued::QueuedJob;

/// Stable handle of a job within one queue. Ids grow with submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Lifecycle of a queued job. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Initializing,
    Waiting,
    Running,
    Success,
    Failure,
}

impl JobState {
    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Success | JobState::Failure)
    }

    fn rank(self) -> u8 {
        match self {
            JobState::Initializing => 0,
            JobState::Waiting => 1,
            JobState::Running => 2,
            JobState::Success | JobState::Failure => 3,
        }
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_become(self, next: JobState) -> bool {
        !self.is_finished() && next.rank() > self.rank()
    }

    pub fn label(self) -> &'static str {
        match self {
            JobState::Initializing => "initializing",
            JobState::Waiting => "waiting",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Failure => "failure",
        }
    }
}

/// Where acquired data comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireInput {
    /// A scheduled fetch, by name.
    Fetch(String),
    /// A manually uploaded file.
    Upload(PathBuf),
}

/// What a job touches. Equivalence and conflicts are decided from scopes alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobScope {
    Acquire {
        source: SourceId,
        fetch_time: Ms,
        input: AcquireInput,
    },
    Clump {
        source: SourceId,
        range: DateRange,
    },
    Associate {
        source: SourceId,
        range: DateRange,
    },
    Reconcile {
        stream: StreamId,
        /// Sources the stream weights.
        sources: BTreeSet<SourceId>,
        range: DateRange,
    },
    /// Never equivalent to or in conflict with anything.
    Opaque,
}

impl JobScope {
    /// Metric and history label.
    pub fn kind(&self) -> &'static str {
        match self {
            JobScope::Acquire { .. } => "acquire",
            JobScope::Clump { .. } => "clump",
            JobScope::Associate { .. } => "associate",
            JobScope::Reconcile { .. } => "reconcile",
            JobScope::Opaque => "opaque",
        }
    }

    /// `self` (an existing job) already covers the work of `other`.
    pub fn is_equivalent_to(&self, other: &JobScope) -> bool {
        use JobScope::*;
        match (self, other) {
            (
                Acquire {
                    source,
                    fetch_time,
                    input,
                },
                Acquire {
                    source: s,
                    fetch_time: t,
                    input: i,
                },
            ) => source == s && fetch_time == t && input == i,
            (Clump { source, range }, Clump { source: s, range: r })
            | (Associate { source, range }, Associate { source: s, range: r }) => {
                source == s && range.contains_range(r)
            }
            (Reconcile { stream, range, .. }, Reconcile { stream: s, range: r, .. }) => {
                stream == s && range.contains_range(r)
            }
            _ => false,
        }
    }

    /// `self` and `other` may touch the same entities and must not run at once.
    pub fn is_conflicting_with(&self, other: &JobScope) -> bool {
        use JobScope::*;
        match (self, other) {
            (Clump { source, range }, Clump { source: s, range: r })
            | (Associate { source, range }, Associate { source: s, range: r }) => {
                source == s && range.overlaps(r)
            }
            (Reconcile { stream, range, .. }, Reconcile { stream: s, range: r, .. }) => {
                stream == s && range.overlaps(r)
            }
            (Associate { source, range }, Reconcile { sources, range: r, .. })
            | (Reconcile { sources, range: r, .. }, Associate { source, range }) => {
                sources.contains(source) && range.overlaps(r)
            }
            _ => false,
        }
    }
}

// ── Errors ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum JobError {
    Config(ConfigError),
    Store(StoreError),
    Method(MethodError),
    Acquire(AcquireError),
    /// The job panicked while executing.
    Panicked(String),
    UpstreamFailed(JobId),
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::Config(e) => write!(f, "configuration error: {e}"),
            JobError::Store(e) => write!(f, "{e}"),
            JobError::Method(e) => write!(f, "{e}"),
            JobError::Acquire(e) => write!(f, "acquisition failed: {e}"),
            JobError::Panicked(msg) => write!(f, "job panicked: {msg}"),
            JobError::UpstreamFailed(id) => write!(f, "upstream job {id} failed"),
        }
    }
}

impl std::error::Error for JobError {}

impl From<ConfigError> for JobError {
    fn from(e: ConfigError) -> Self {
        JobError::Config(e)
    }
}

impl From<StoreError> for JobError {
    fn from(e: StoreError) -> Self {
        JobError::Store(e)
    }
}

impl From<MethodError> for JobError {
    fn from(e: MethodError) -> Self {
        JobError::Method(e)
    }
}

impl From<AcquireError> for JobError {
    fn from(e: AcquireError) -> Self {
        JobError::Acquire(e)
    }
}

// ── Job contract ────────────────────────────────────────────────

/// Everything a job may use, injected once at start-up.
#[derive(Clone)]
pub struct Services {
    pub repos: Repositories,
    pub methods: Arc<MethodRegistry>,
    pub config: Arc<Config>,
}

/// What an executing job sees: its own id, the services, the queue (for scheduling
/// downstream work) and its progress sink.
pub struct JobContext<'a> {
    pub id: JobId,
    pub services: &'a Services,
    pub queue: &'a JobQueue,
    pub progress: &'a dyn ProgressSink,
}

/// A unit of work. `execute` runs synchronously on a blocking worker thread.
pub trait Job: Send + Sync {
    fn scope(&self) -> JobScope;

    fn execute(&self, ctx: &JobContext<'_>) -> Result<(), JobError>;

    fn is_equivalent_to(&self, other: &dyn Job) -> bool {
        self.scope().is_equivalent_to(&other.scope())
    }

    fn is_conflicting_with(&self, other: &dyn Job) -> bool {
        self.scope().is_conflicting_with(&other.scope())
    }
}

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}
