use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::history::{JobHistory, JobHistorySink};
use super::progress::ProgressSink;
use super::queued::{JobInfo, JobRecord, QueuedJob};
use super::{Job, JobContext, JobError, JobId, JobState, Services, now_ms};
use crate::model::Ms;
use crate::notify::{JobEvent, NotifyHub};
use crate::observability::{JOB_CONFLICTS_TOTAL, JOB_DURATION_SECONDS, JOBS_RUNNING, JOBS_TOTAL, status_label};

const IDLE_POLL: Duration = Duration::from_millis(25);

/// Outcome of linking a job to an upstream job.
enum Link {
    Added,
    /// The upstream had already finished successfully; no edge was needed.
    Succeeded,
    Failed,
}

struct Inner {
    services: Services,
    jobs: DashMap<JobId, Arc<QueuedJob>>,
    next_id: AtomicU64,
    workers: Arc<Semaphore>,
    /// Jobs currently executing. Its lock also serialises the conflict check at job start.
    running: Mutex<Vec<Arc<QueuedJob>>>,
    runtime: Handle,
    history: Arc<dyn JobHistorySink>,
    notify: Arc<NotifyHub>,
}

/// Dependency-aware job queue over a bounded pool of blocking workers.
///
/// A job is submitted to the pool exactly when it is Waiting and its last upstream job has
/// succeeded. A failed upstream fails its downstream jobs without running them. Before a job
/// executes it is checked against running jobs; a conflicting running job becomes a new
/// upstream and the attempt is dropped.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    /// Must be called from within a Tokio runtime, which the workers are spawned on.
    pub fn new(services: Services, history: Arc<dyn JobHistorySink>, notify: Arc<NotifyHub>) -> Self {
        let workers = services.config.workers.max(1);
        Self {
            inner: Arc::new(Inner {
                services,
                jobs: DashMap::new(),
                next_id: AtomicU64::new(1),
                workers: Arc::new(Semaphore::new(workers)),
                running: Mutex::new(Vec::new()),
                runtime: Handle::current(),
                history,
                notify,
            }),
        }
    }

    pub fn services(&self) -> &Services {
        &self.inner.services
    }

    pub fn notify(&self) -> &NotifyHub {
        &self.inner.notify
    }

    // ── Submission ───────────────────────────────────────────

    /// Track `job` and run it once every upstream job has succeeded.
    pub fn enqueue(&self, job: impl Job + 'static, name: impl Into<String>, upstream: &[JobId]) -> Arc<QueuedJob> {
        self.enqueue_boxed(Box::new(job), name.into(), upstream.to_vec())
    }

    /// Like `enqueue`, unless a tracked job already covers `job`. A Waiting equivalent job takes
    /// over the upstream edges and is returned. Running equivalent jobs become extra upstreams of
    /// the new job.
    pub fn enqueue_if_none_equivalent(
        &self,
        job: impl Job + 'static,
        name: impl Into<String>,
        upstream: &[JobId],
    ) -> Arc<QueuedJob> {
        let job: Box<dyn Job> = Box::new(job);
        let name = name.into();
        let mut upstream = upstream.to_vec();
        for existing in self.queued_jobs() {
            if !existing.job().is_equivalent_to(job.as_ref()) {
                continue;
            }
            match existing.state() {
                JobState::Waiting => {
                    let Some(_claim) = existing.try_claim() else { continue };
                    if existing.state() != JobState::Waiting {
                        continue;
                    }
                    debug!("ignoring new job {name}: equivalent to existing job {}", existing.name());
                    for &up in &upstream {
                        self.add_upstream(existing.id(), up);
                    }
                    return existing.clone();
                }
                JobState::Running => {
                    debug!("equivalent job {} is running; it becomes upstream of {name}", existing.name());
                    upstream.push(existing.id());
                }
                _ => {}
            }
        }
        self.enqueue_boxed(job, name, upstream)
    }

    fn enqueue_boxed(&self, job: Box<dyn Job>, name: String, upstream: Vec<JobId>) -> Arc<QueuedJob> {
        let id = JobId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let queued = Arc::new(QueuedJob::new(id, name, job));
        self.inner.jobs.insert(id, queued.clone());
        for up in upstream {
            self.add_upstream(id, up);
        }
        let (waiting, ready) = {
            let mut record = queued.lock();
            if record.state == JobState::Initializing {
                record.state = JobState::Waiting;
            }
            let waiting = record.state == JobState::Waiting;
            (waiting, waiting && record.upstream.is_empty())
        };
        if waiting {
            self.emit(&queued, JobState::Waiting);
        }
        if ready {
            self.submit(queued.clone());
        } else {
            debug!("job {} is not yet ready to run", queued.name());
        }
        queued
    }

    /// Make `upstream` a dependency of `job`. Returns whether an edge was added: an upstream
    /// that already succeeded needs none, and one that already failed fails `job` at once.
    pub fn add_upstream(&self, job: JobId, upstream: JobId) -> bool {
        let (Some(queued), Some(up)) = (self.get(job), self.get(upstream)) else {
            debug!("cannot link {job} to {upstream}: not tracked");
            return false;
        };
        match link(&queued, &up) {
            Link::Added => true,
            Link::Succeeded => false,
            Link::Failed => {
                if let Some(next) = self.fail_by_upstream(&queued, upstream) {
                    self.propagate(job, false, next);
                }
                false
            }
        }
    }

    fn submit(&self, queued: Arc<QueuedJob>) {
        debug!("submitting job {} to the worker pool", queued.name());
        let queue = self.clone();
        let workers = self.inner.workers.clone();
        self.inner.runtime.spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            let name = queued.name().to_string();
            if let Err(e) = tokio::task::spawn_blocking(move || queue.run(queued)).await {
                error!("worker for job {name} did not complete: {e}");
            }
        });
    }

    // ── Execution ────────────────────────────────────────────

    fn run(&self, queued: Arc<QueuedJob>) {
        let _claim = queued.claim();
        {
            let record = queued.lock();
            if record.state != JobState::Waiting || !record.upstream.is_empty() {
                debug!("job {} is not ready to run; dropping this attempt", queued.name());
                return;
            }
        }
        if !self.start(&queued) {
            return;
        }
        self.emit(&queued, JobState::Running);
        gauge!(JOBS_RUNNING).increment(1.0);
        info!("starting job {}", queued.name());

        let ctx = JobContext {
            id: queued.id(),
            services: &self.inner.services,
            queue: self,
            progress: queued.reporter(),
        };
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| queued.job().execute(&ctx)))
            .unwrap_or_else(|panic| Err(JobError::Panicked(panic_message(panic.as_ref()))));
        gauge!(JOBS_RUNNING).decrement(1.0);
        histogram!(JOB_DURATION_SECONDS, "kind" => queued.scope().kind()).record(started.elapsed().as_secs_f64());
        self.complete(&queued, result);
    }

    /// Conflict check and the move to Running, under the running-set lock. Returns false when a
    /// conflicting job is running; it has become an upstream of `queued`.
    fn start(&self, queued: &Arc<QueuedJob>) -> bool {
        let mut running = lock(&self.inner.running);
        loop {
            let conflict = running
                .iter()
                .find(|other| other.job().is_conflicting_with(queued.job()))
                .cloned();
            let Some(other) = conflict else { break };
            match link(queued, &other) {
                Link::Added => {
                    debug!("job {} waits for conflicting job {}", queued.name(), other.name());
                    counter!(JOB_CONFLICTS_TOTAL).increment(1);
                    return false;
                }
                // Finished while still listed; it no longer blocks.
                Link::Succeeded | Link::Failed => running.retain(|r| r.id() != other.id()),
            }
        }
        running.push(queued.clone());
        let mut record = queued.lock();
        record.state = JobState::Running;
        record.started = Some(now_ms());
        true
    }

    fn complete(&self, queued: &Arc<QueuedJob>, result: Result<(), JobError>) {
        let (state, status) = match &result {
            Ok(()) => (JobState::Success, queued.progress().message),
            Err(e) => {
                warn!("job {} failed: {e}", queued.name());
                (JobState::Failure, format!("Exception while executing job: {e}"))
            }
        };
        queued.reporter().set_progress(100, &status);
        lock(&self.inner.running).retain(|r| r.id() != queued.id());

        let downstream = {
            let mut record = queued.lock();
            record.state = state;
            record.completed = Some(now_ms());
            record.status = Some(status);
            std::mem::take(&mut record.downstream)
        };
        info!("job {} finished: {}", queued.name(), state.label());
        self.finished(queued);
        self.propagate(queued.id(), state == JobState::Success, downstream);
    }

    /// Walk the downstream jobs of a finished job: submit those that became ready, fail the
    /// rest transitively when it failed.
    fn propagate(&self, finished: JobId, success: bool, downstream: Vec<JobId>) {
        let mut pending = vec![(finished, success, downstream)];
        while let Some((up, success, downstream)) = pending.pop() {
            for id in downstream {
                let Some(job) = self.get(id) else { continue };
                if success {
                    let ready = {
                        let mut record = job.lock();
                        record.upstream.retain(|u| *u != up);
                        record.state == JobState::Waiting && record.upstream.is_empty()
                    };
                    if ready {
                        self.submit(job);
                    }
                } else if let Some(next) = self.fail_by_upstream(&job, up) {
                    pending.push((id, false, next));
                }
            }
        }
    }

    /// Mark a not-yet-running job failed because `upstream` failed. Returns its downstream jobs,
    /// or `None` if it was already past the point of failing this way.
    fn fail_by_upstream(&self, job: &Arc<QueuedJob>, upstream: JobId) -> Option<Vec<JobId>> {
        let status = JobError::UpstreamFailed(upstream).to_string();
        let downstream = {
            let mut record = job.lock();
            record.upstream.retain(|u| *u != upstream);
            if !matches!(record.state, JobState::Initializing | JobState::Waiting) {
                return None;
            }
            record.state = JobState::Failure;
            record.completed = Some(now_ms());
            record.status = Some(status.clone());
            std::mem::take(&mut record.downstream)
        };
        job.reporter().set_progress(100, &status);
        warn!("job {} failed: {status}", job.name());
        self.finished(job);
        Some(downstream)
    }

    /// History, notification and metrics for a job that just finished.
    fn finished(&self, job: &QueuedJob) {
        let (state, entry) = {
            let record = job.lock();
            let entry = JobHistory {
                id: job.id(),
                name: job.name().to_string(),
                kind: job.scope().kind().to_string(),
                start: record.started,
                end: record.completed.unwrap_or_else(now_ms),
                status: record.status.clone().unwrap_or_default(),
                success: record.state == JobState::Success,
            };
            (record.state, entry)
        };
        if let Err(e) = self.inner.history.record(&entry) {
            error!("failed to record history of job {}: {e}", job.name());
        }
        counter!(JOBS_TOTAL, "kind" => job.scope().kind(), "status" => status_label(entry.success)).increment(1);
        self.emit(job, state);
    }

    fn emit(&self, job: &QueuedJob, state: JobState) {
        self.inner.notify.send(&JobEvent {
            id: job.id(),
            name: job.name().to_string(),
            kind: job.scope().kind(),
            state,
            at: now_ms(),
        });
    }

    // ── Inspection ───────────────────────────────────────────

    pub fn get(&self, id: JobId) -> Option<Arc<QueuedJob>> {
        self.inner.jobs.get(&id).map(|e| e.value().clone())
    }

    /// Every tracked job, in submission order.
    pub fn queued_jobs(&self) -> Vec<Arc<QueuedJob>> {
        let mut jobs: Vec<Arc<QueuedJob>> = self.inner.jobs.iter().map(|e| e.value().clone()).collect();
        jobs.sort_by_key(|j| j.id());
        jobs
    }

    pub fn jobs_info(&self) -> Vec<JobInfo> {
        self.queued_jobs().iter().map(|j| j.info()).collect()
    }

    /// Tracked jobs that have not finished.
    pub fn active_count(&self) -> usize {
        self.inner
            .jobs
            .iter()
            .filter(|e| !e.value().state().is_finished())
            .count()
    }

    /// Resolves once every tracked job has finished.
    pub async fn wait_idle(&self) {
        while self.active_count() > 0 {
            tokio::time::sleep(IDLE_POLL).await;
        }
    }

    /// Drop finished jobs completed more than `retention` ago. Returns how many went.
    pub fn sweep_finished(&self, retention: Duration) -> usize {
        let cutoff: Ms = now_ms() - retention.as_millis() as Ms;
        let expired: Vec<JobId> = self
            .inner
            .jobs
            .iter()
            .filter(|e| {
                let record = e.value().lock();
                record.state.is_finished() && record.completed.is_some_and(|t| t <= cutoff)
            })
            .map(|e| *e.key())
            .collect();
        for id in &expired {
            self.inner.jobs.remove(id);
            self.inner.notify.remove(id);
        }
        expired.len()
    }
}

/// Add the `queued` <- `upstream` edge unless `upstream` has already finished. Both records are
/// locked in id order.
fn link(queued: &QueuedJob, upstream: &QueuedJob) -> Link {
    if queued.id() == upstream.id() {
        return Link::Succeeded;
    }
    let (mut job, mut up) = lock_pair(queued, upstream);
    match up.state {
        JobState::Success => return Link::Succeeded,
        JobState::Failure => return Link::Failed,
        _ => {}
    }
    if !job.upstream.contains(&upstream.id()) {
        job.upstream.push(upstream.id());
        up.downstream.push(queued.id());
    }
    Link::Added
}

fn lock_pair<'a>(a: &'a QueuedJob, b: &'a QueuedJob) -> (MutexGuard<'a, JobRecord>, MutexGuard<'a, JobRecord>) {
    if a.id() < b.id() {
        let first = a.lock();
        (first, b.lock())
    } else {
        let second = b.lock();
        (a.lock(), second)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
