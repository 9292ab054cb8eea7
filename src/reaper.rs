use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::Config;
use crate::job::{JobQueue, now_ms};
use crate::model::Ms;
use crate::wal::HistoryLog;

/// Background task that periodically drops finished jobs from the queue and compacts the job
/// history log.
pub async fn run_reaper(queue: JobQueue, history: Option<Arc<HistoryLog>>, config: Arc<Config>) {
    let mut interval = tokio::time::interval(config.sweep_interval);
    loop {
        interval.tick().await;
        sweep_once(&queue, history.as_deref(), config.job_retention, config.history_retention);
    }
}

/// One sweep. Returns how many jobs left the queue.
pub fn sweep_once(
    queue: &JobQueue,
    history: Option<&HistoryLog>,
    job_retention: Duration,
    history_retention: Duration,
) -> usize {
    let swept = queue.sweep_finished(job_retention);
    if swept > 0 {
        info!("swept {swept} finished jobs");
    }
    if let Some(history) = history.filter(|h| h.needs_compaction()) {
        let cutoff: Ms = now_ms() - history_retention.as_millis() as Ms;
        match history.compact_before(cutoff) {
            Ok(dropped) => debug!("history compaction dropped {dropped} records"),
            Err(e) => error!("job history compaction failed: {e}"),
        }
    }
    swept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::history::{JobHistorySink, MemoryHistory};
    use crate::job::{Job, JobContext, JobError, JobScope, JobState, Services};
    use crate::notify::NotifyHub;
    use crate::repository::Repositories;
    use crate::store::InMemoryStore;
    use crate::strategy::MethodRegistry;

    struct Noop;

    impl Job for Noop {
        fn scope(&self) -> JobScope {
            JobScope::Opaque
        }

        fn execute(&self, ctx: &JobContext<'_>) -> Result<(), JobError> {
            ctx.progress.set_progress(100, "done");
            Ok(())
        }
    }

    fn queue() -> JobQueue {
        let services = Services {
            repos: Repositories::in_memory(Arc::new(InMemoryStore::new())),
            methods: Arc::new(MethodRegistry::with_builtins()),
            config: Arc::new(Config::default()),
        };
        let history: Arc<dyn JobHistorySink> = Arc::new(MemoryHistory::new());
        JobQueue::new(services, history, Arc::new(NotifyHub::new()))
    }

    #[tokio::test]
    async fn reaper_sweeps_finished_jobs() {
        let queue = queue();
        let job = queue.enqueue(Noop, "noop", &[]);
        queue.wait_idle().await;
        assert_eq!(job.state(), JobState::Success);

        // Retained for an hour: still tracked.
        assert_eq!(sweep_once(&queue, None, Duration::from_secs(3600), Duration::ZERO), 0);
        assert_eq!(queue.jobs_info().len(), 1);

        assert_eq!(sweep_once(&queue, None, Duration::ZERO, Duration::ZERO), 1);
        assert!(queue.jobs_info().is_empty());
        assert!(queue.get(job.id()).is_none());
    }

    #[tokio::test]
    async fn reaper_compacts_history() {
        let path = std::env::temp_dir().join(format!("emberline_reaper_{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let log = HistoryLog::open(&path, 1).unwrap();
        log.record(&crate::job::history::JobHistory {
            id: crate::job::JobId(1),
            name: "old".into(),
            kind: "clump".into(),
            start: None,
            end: 0,
            status: "done".into(),
            success: true,
        })
        .unwrap();

        let queue = queue();
        sweep_once(&queue, Some(&log), Duration::ZERO, Duration::from_secs(60));
        assert!(log.entries().unwrap().is_empty());
        let _ = std::fs::remove_file(&path);
    }
}
