use std::sync::{Mutex, MutexGuard, TryLockError};

use serde::Serialize;

use super::progress::{Progress, ProgressReporter};
use super::{Job, JobId, JobScope, JobState, now_ms};
use crate::model::Ms;

/// Mutable bookkeeping of a queued job, guarded by the job's lock.
#[derive(Debug)]
pub(crate) struct JobRecord {
    pub state: JobState,
    pub submitted: Ms,
    pub started: Option<Ms>,
    pub completed: Option<Ms>,
    /// Jobs that must succeed before this one runs.
    pub upstream: Vec<JobId>,
    /// Jobs waiting on this one.
    pub downstream: Vec<JobId>,
    pub status: Option<String>,
}

/// A job as tracked by the queue.
pub struct QueuedJob {
    id: JobId,
    name: String,
    job: Box<dyn Job>,
    scope: JobScope,
    progress: ProgressReporter,
    record: Mutex<JobRecord>,
    /// Held by the worker for the whole execution, and briefly by the queue when it folds an
    /// equivalent job into this one.
    claim: Mutex<()>,
}

/// Point-in-time view of a queued job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub kind: &'static str,
    pub state: JobState,
    pub progress: Progress,
    pub submitted: Ms,
    pub started: Option<Ms>,
    pub completed: Option<Ms>,
    /// Running time so far, or total running time once finished.
    pub elapsed_ms: Option<Ms>,
}

impl QueuedJob {
    pub(crate) fn new(id: JobId, name: String, job: Box<dyn Job>) -> Self {
        let scope = job.scope();
        Self {
            id,
            progress: ProgressReporter::new(name.clone()),
            name,
            job,
            scope,
            record: Mutex::new(JobRecord {
                state: JobState::Initializing,
                submitted: now_ms(),
                started: None,
                completed: None,
                upstream: Vec::new(),
                downstream: Vec::new(),
                status: None,
            }),
            claim: Mutex::new(()),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn job(&self) -> &dyn Job {
        self.job.as_ref()
    }

    pub fn scope(&self) -> &JobScope {
        &self.scope
    }

    pub fn reporter(&self) -> &ProgressReporter {
        &self.progress
    }

    pub fn progress(&self) -> Progress {
        self.progress.snapshot()
    }

    pub fn state(&self) -> JobState {
        self.lock().state
    }

    pub fn upstream(&self) -> Vec<JobId> {
        self.lock().upstream.clone()
    }

    pub fn downstream(&self) -> Vec<JobId> {
        self.lock().downstream.clone()
    }

    /// Final status message once finished.
    pub fn status(&self) -> Option<String> {
        self.lock().status.clone()
    }

    pub fn info(&self) -> JobInfo {
        let record = self.lock();
        let elapsed_ms = record
            .started
            .map(|start| record.completed.unwrap_or_else(now_ms) - start);
        JobInfo {
            id: self.id,
            name: self.name.clone(),
            kind: self.scope.kind(),
            state: record.state,
            progress: self.progress.snapshot(),
            submitted: record.submitted,
            started: record.started,
            completed: record.completed,
            elapsed_ms,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, JobRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn claim(&self) -> MutexGuard<'_, ()> {
        self.claim.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `None` when a worker or another enqueue holds the job.
    pub(crate) fn try_claim(&self) -> Option<MutexGuard<'_, ()>> {
        match self.claim.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

impl std::fmt::Debug for QueuedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedJob")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("scope", &self.scope)
            .finish()
    }
}
