use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;
use ulid::Ulid;

use emberline::config::Config;
use emberline::job::chain::schedule_upload;
use emberline::job::history::JobHistorySink;
use emberline::job::{JobQueue, JobState, Services};
use emberline::model::{SourceId, StreamId};
use emberline::notify::NotifyHub;
use emberline::repository::Repositories;
use emberline::store::{CatalogFile, InMemoryStore};
use emberline::strategy::MethodRegistry;
use emberline::wal::HistoryLog;

// ── Test infrastructure ──────────────────────────────────────

struct Pipeline {
    dir: PathBuf,
    store: Arc<InMemoryStore>,
    queue: JobQueue,
    history: Arc<HistoryLog>,
}

fn modis(backward_days: u32) -> serde_json::Value {
    json!({
        "id": "modis",
        "name": "MODIS",
        "attributes": {
            "clumpRadius": "50",
            "numForwardDays": "0",
            "numBackwardDays": backward_days.to_string(),
            "sizeThreshold": "10000000",
            "smallFireDistance": "1000",
            "largeFireDistance": "5000",
            "fireType": "WF"
        }
    })
}

fn start(source: serde_json::Value) -> Pipeline {
    let dir = std::env::temp_dir().join(format!("emberline_pipeline_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();

    let catalog = json!({
        "sources": [source],
        "streams": [{
            "id": "national",
            "name": "National",
            "autoReconcile": true,
            "weightings": { "modis": {} }
        }]
    });
    let catalog_path = dir.join("catalog.json");
    std::fs::write(&catalog_path, catalog.to_string()).unwrap();
    let store = Arc::new(InMemoryStore::with_catalog(CatalogFile::load(&catalog_path).unwrap()));

    let history = Arc::new(HistoryLog::open(&dir.join("history.log"), 1000).unwrap());
    let services = Services {
        repos: Repositories::in_memory(store.clone()),
        methods: Arc::new(MethodRegistry::with_builtins()),
        config: Arc::new(Config::default()),
    };
    let sink: Arc<dyn JobHistorySink> = history.clone();
    let queue = JobQueue::new(services, sink, Arc::new(NotifyHub::new()));
    Pipeline {
        dir,
        store,
        queue,
        history,
    }
}

fn write_detections(dir: &Path, name: &str, points: &[(f64, f64, &str)]) -> PathBuf {
    let lines: Vec<String> = points
        .iter()
        .map(|(x, y, start)| json!({ "x": x, "y": y, "start": start }).to_string())
        .collect();
    let path = dir.join(name);
    std::fs::write(&path, lines.join("\n")).unwrap();
    path
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn upload_runs_clump_associate_and_reconcile() {
    let p = start(modis(1));
    let mut events = p.queue.notify().subscribe_all();
    let file = write_detections(
        &p.dir,
        "modis.jsonl",
        &[
            // Overlapping 50 m buffers: one clump.
            (0.0, 0.0, "2024-07-01T12:00:00Z"),
            (60.0, 0.0, "2024-07-01T12:05:00Z"),
            (120.0, 0.0, "2024-07-01T12:10:00Z"),
            // 10 km apart: three clumps.
            (50_000.0, 0.0, "2024-07-02T13:00:00Z"),
            (60_000.0, 0.0, "2024-07-02T13:00:00Z"),
            (70_000.0, 0.0, "2024-07-02T13:00:00Z"),
        ],
    );

    let upload = schedule_upload(&p.queue, &SourceId::from("modis"), file, 0, true).unwrap();
    p.queue.wait_idle().await;

    assert_eq!(upload.state(), JobState::Success);
    let jobs = p.queue.jobs_info();
    let kinds: Vec<&str> = jobs.iter().map(|j| j.kind).collect();
    assert_eq!(kinds, vec!["acquire", "clump", "associate", "clump", "associate", "reconcile"]);
    assert!(jobs.iter().all(|j| j.state == JobState::Success));
    assert_eq!(jobs[1].name, "Clump MODIS for 2024-07-01");
    assert_eq!(jobs[5].name, "Reconcile National between 2024-07-01 and 2024-07-02");

    assert_eq!(p.store.raw_data_count(), 6);
    assert_eq!(p.store.clump_count(), 4);
    let fires = p.store.fires_of(&SourceId::from("modis"));
    assert_eq!(fires.len(), 4);
    assert!(fires.iter().all(|f| f.fire_type == "WF" && f.display_name == "Unknown Fire"));
    assert_eq!(p.store.events_of(&StreamId::from("national")).len(), 4);

    let history = p.history.entries().unwrap();
    assert_eq!(history.len(), 6);
    assert!(history.iter().all(|h| h.success));
    assert_eq!(history.iter().filter(|h| h.kind == "associate").count(), 2);

    let mut upload_states = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) if event.id == upload.id() => upload_states.push(event.state),
            Ok(_) => {}
            Err(TryRecvError::Empty) => break,
            Err(e) => panic!("unexpected receive error: {e}"),
        }
    }
    assert_eq!(upload_states, vec![JobState::Waiting, JobState::Running, JobState::Success]);
}

#[tokio::test]
async fn upload_without_reconciliation_stops_at_association() {
    let p = start(modis(1));
    let file = write_detections(&p.dir, "modis.jsonl", &[(0.0, 0.0, "2024-07-01T12:00:00Z")]);
    schedule_upload(&p.queue, &SourceId::from("modis"), file, 0, false).unwrap();
    p.queue.wait_idle().await;

    let kinds: Vec<&str> = p.queue.jobs_info().iter().map(|j| j.kind).collect();
    assert_eq!(kinds, vec!["acquire", "clump", "associate"]);
    assert!(p.store.events_of(&StreamId::from("national")).is_empty());
}

async fn fires_after(days: &[&str]) -> usize {
    let p = start(modis(2));
    let points: Vec<(f64, f64, &str)> = days.iter().map(|d| (0.0, 0.0, *d)).collect();
    let file = write_detections(&p.dir, "window.jsonl", &points);
    schedule_upload(&p.queue, &SourceId::from("modis"), file, 0, false).unwrap();
    p.queue.wait_idle().await;
    p.store.fires_of(&SourceId::from("modis")).len()
}

#[tokio::test]
async fn association_window_decides_new_fires() {
    // Two days back from 2024-01-03 reaches the fire ending 2024-01-01; from 2024-01-05 it does not.
    assert_eq!(fires_after(&["2024-01-01", "2024-01-03"]).await, 1);
    assert_eq!(fires_after(&["2024-01-01", "2024-01-05"]).await, 2);
}

#[tokio::test]
async fn malformed_upload_fails_without_downstream_jobs() {
    let p = start(modis(1));
    let path = p.dir.join("broken.jsonl");
    std::fs::write(&path, "{\"x\": 0, \"y\": 0, \"start\": \"yesterday\"}").unwrap();

    let upload = schedule_upload(&p.queue, &SourceId::from("modis"), path, 0, true).unwrap();
    p.queue.wait_idle().await;

    assert_eq!(upload.state(), JobState::Failure);
    assert_eq!(p.queue.jobs_info().len(), 1);
    assert_eq!(p.store.raw_data_count(), 0);
    let history = p.history.entries().unwrap();
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
    assert!(history[0].status.starts_with("Exception while executing job"));
}

#[tokio::test]
async fn unknown_source_is_rejected_before_queueing() {
    let p = start(modis(1));
    let file = write_detections(&p.dir, "viirs.jsonl", &[(0.0, 0.0, "2024-07-01")]);
    assert!(schedule_upload(&p.queue, &SourceId::from("viirs"), file, 0, true).is_err());
    assert!(p.queue.jobs_info().is_empty());
}
