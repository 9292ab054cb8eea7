use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use emberline::config::Config;
use emberline::job::chain::schedule_upload;
use emberline::job::history::JobHistorySink;
use emberline::job::{JobQueue, Services, now_ms};
use emberline::model::SourceId;
use emberline::notify::NotifyHub;
use emberline::reaper::run_reaper;
use emberline::repository::{Catalog, Repositories};
use emberline::store::{CatalogFile, InMemoryStore};
use emberline::strategy::MethodRegistry;
use emberline::wal::HistoryLog;

/// `source=path` pairs naming files to ingest.
fn uploads(args: impl Iterator<Item = String>) -> Result<Vec<(SourceId, PathBuf)>, String> {
    args.map(|arg| match arg.split_once('=') {
        Some((source, path)) if !source.is_empty() && !path.is_empty() => {
            Ok((SourceId::from(source), PathBuf::from(path)))
        }
        _ => Err(format!("expected <source>=<path>, got {arg:?}")),
    })
    .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Arc::new(Config::from_env());
    emberline::observability::init(config.metrics_port);
    let uploads = uploads(std::env::args().skip(1))?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let catalog = match &config.catalog {
        Some(path) => CatalogFile::load(path)?,
        None => {
            warn!("EMBERLINE_CATALOG not set, starting with an empty catalog");
            CatalogFile::default()
        }
    };
    let store = Arc::new(InMemoryStore::with_catalog(catalog));
    let methods = Arc::new(MethodRegistry::with_builtins());

    // Misconfigured methods are fatal at start-up, not when the first job runs.
    for source in store.sources()? {
        methods.validate_source(&source)?;
    }
    for stream in store.streams()? {
        methods.validate_stream(&stream)?;
    }

    let history_path = config.data_dir.join("history.log");
    let history = Arc::new(HistoryLog::open(&history_path, config.history_compact_threshold)?);
    let services = Services {
        repos: Repositories::in_memory(store.clone()),
        methods,
        config: config.clone(),
    };
    let sink: Arc<dyn JobHistorySink> = history.clone();
    let queue = JobQueue::new(services, sink, Arc::new(NotifyHub::new()));
    tokio::spawn(run_reaper(queue.clone(), Some(history), config.clone()));

    info!("emberline started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  workers: {}", config.workers);
    info!("  history: {}", history_path.display());
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let now = now_ms();
    for (source, path) in uploads {
        match schedule_upload(&queue, &source, path, now, true) {
            Ok(job) => info!("queued {}", job.name()),
            Err(e) => error!("cannot ingest for {source}: {e}"),
        }
    }

    // Graceful shutdown: stop waiting on SIGTERM/ctrl-c, running jobs are not interrupted
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };

    tokio::select! {
        _ = queue.wait_idle() => info!("all jobs finished"),
        _ = shutdown => warn!("shutdown signal received, {} jobs still active", queue.active_count()),
    }

    for job in queue.jobs_info() {
        info!(
            "{} [{}] {}% {} ({} ms)",
            job.name,
            job.state.label(),
            job.progress.percent,
            job.progress.message,
            job.elapsed_ms.unwrap_or(0)
        );
    }

    info!("emberline stopped");
    Ok(())
}
