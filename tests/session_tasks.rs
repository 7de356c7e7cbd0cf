//! Session tasks driven end to end against the in-memory coordinator and store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use session_worker::config::WorkerConfig;
use session_worker::coordinator::{JsonMap, MemoryRecordClient, SessionRecord, Task};
use session_worker::handlers::{HandlerDeps, build_handler};
use session_worker::transfer::{MemoryStore, StoreOp};
use session_worker::worker::{HandlerPhase, StopFlag, Worker, drive};

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        worker_name: "scope-1".to_string(),
        poll_interval: Duration::from_millis(10),
        handler_interval: Duration::ZERO,
        ..WorkerConfig::default()
    }
}

fn store_section() -> JsonMap {
    json!({
        "irods_host": "store.example.org",
        "irods_user": "worker",
        "irods_pass": "secret",
        "irods_zone": "tempZone",
        "irods_parent_collection": "/tempZone/home/worker/",
        "max_retries": 3,
        "retry_delay_ms": 0
    })
    .as_object()
    .cloned()
    .unwrap()
}

fn session(start: chrono::DateTime<Utc>, extra: serde_json::Value) -> SessionRecord {
    serde_json::from_value(json!({
        "id": 11,
        "name": "run1",
        "start": start.to_rfc3339(),
        "acquisition": {"raw_path": "/nonexistent/raw", "images_pattern": "*.tiff"},
        "extra": extra
    }))
    .unwrap()
}

fn session_task(id: &str, action: &str) -> Task {
    let args: JsonMap = json!({"session_id": 11, "action": action})
        .as_object()
        .cloned()
        .unwrap();
    Task::new(id, "session", args)
}

async fn run_task(records: &Arc<MemoryRecordClient>, store: &MemoryStore, task: Task) -> HandlerPhase {
    let deps = HandlerDeps::new(records.clone(), Arc::new(store.clone()), worker_config());
    let reporter = deps.reporter(&task.id);
    let handler = build_handler(task, &deps).await.unwrap();
    drive(handler, reporter, StopFlag::new(), Duration::ZERO, 10)
        .await
        .state
        .phase
}

#[tokio::test]
async fn archive_records_retrieval_once() {
    let raw = tempfile::tempdir().unwrap();
    std::fs::write(raw.path().join("m1_fractions.tiff"), vec![0u8; 64]).unwrap();
    std::fs::write(raw.path().join("m2_fractions.tiff"), vec![0u8; 64]).unwrap();

    let records = Arc::new(MemoryRecordClient::new());
    records.add_config("irods", store_section());
    records.add_session(session(
        Utc::now(),
        json!({"raw": {"path": raw.path().to_string_lossy()}, "operator": "jane"}),
    ));
    let store = MemoryStore::new("store.example.org");

    let phase = run_task(&records, &store, session_task("a1", "archive")).await;
    assert_eq!(phase, HandlerPhase::Completed);

    let update = records.updates_for("a1").pop().unwrap();
    assert!(update.is_done());
    assert!(update.error_message().is_none());
    assert_eq!(update.get("raw_archived"), Some(&json!(true)));
    assert_eq!(update.get("otf_archived"), Some(&json!(false)));
    assert_eq!(update.get("raw_uploaded"), Some(&json!(2)));

    let stored = records.session(11).unwrap();
    let (linux, windows) = stored.extra.raw.retrieval().unwrap();
    assert!(linux.contains("/tempZone/home/worker/run1_raw"));
    assert!(linux.contains("ticket-1"));
    assert!(windows.contains("ticket-1"));
    assert_eq!(stored.extra.other["operator"], json!("jane"));
    assert_eq!(store.tickets().len(), 1);

    // archiving again uploads nothing and keeps the first ticket
    let phase = run_task(&records, &store, session_task("a2", "copy_to_irods")).await;
    assert_eq!(phase, HandlerPhase::Completed);

    let update = records.updates_for("a2").pop().unwrap();
    assert_eq!(update.get("raw_uploaded"), Some(&json!(0)));
    assert_eq!(store.tickets().len(), 1);
    assert_eq!(store.calls(StoreOp::IssueTicket), 1);
    let again = records.session(11).unwrap();
    assert_eq!(again.extra.raw.retrieval().unwrap().0, linux);
}

#[tokio::test]
async fn archive_reports_failed_sections() {
    let records = Arc::new(MemoryRecordClient::new());
    records.add_config("irods", store_section());
    records.add_session(session(
        Utc::now(),
        json!({"raw": {"path": "/no/such/raw/dir"}}),
    ));
    let store = MemoryStore::new("store.example.org");

    let phase = run_task(&records, &store, session_task("a3", "archive")).await;
    assert_eq!(phase, HandlerPhase::Completed);

    let update = records.updates_for("a3").pop().unwrap();
    assert!(update.is_done());
    assert_eq!(update.get("raw_archived"), Some(&json!(false)));
    assert!(update.error_message().unwrap().contains("/no/such/raw/dir"));
}

#[tokio::test]
async fn monitor_past_horizon_finishes() {
    let records = Arc::new(MemoryRecordClient::new());
    records.add_session(session(Utc::now() - chrono::Duration::days(4), json!({})));
    let store = MemoryStore::new("store.example.org");

    let phase = run_task(&records, &store, session_task("m1", "monitor")).await;

    assert_eq!(phase, HandlerPhase::Completed);
    let updates = records.updates_for("m1");
    assert_eq!(updates.len(), 1);
    assert!(updates[0].is_done());
    assert_eq!(updates[0].get("movies"), Some(&json!(0)));
}

#[tokio::test]
async fn monitor_within_horizon_repeats_until_budget() {
    let records = Arc::new(MemoryRecordClient::new());
    records.add_session(session(Utc::now(), json!({})));
    let store = MemoryStore::new("store.example.org");

    let phase = run_task(&records, &store, session_task("m2", "monitor")).await;

    assert_eq!(phase, HandlerPhase::Stopped);
    let updates = records.updates_for("m2");
    assert_eq!(updates.len(), 10);
    assert_eq!(updates[9].get("count"), Some(&json!(10)));
    assert!(!records.is_done("m2"));
}

#[tokio::test]
async fn worker_reports_unknown_action_and_does_not_retry() {
    let records = Arc::new(MemoryRecordClient::new());
    records.add_session(session(Utc::now(), json!({})));
    records.push_task(session_task("t1", "bogus"));
    let deps = HandlerDeps::new(
        records.clone(),
        Arc::new(MemoryStore::new("store.example.org")),
        worker_config(),
    );
    let worker = Arc::new(Worker::new(deps));
    let shutdown = worker.shutdown_handle();

    let running = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.stop();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();

    let updates = records.updates_for("t1");
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].error_message(), Some("Unknown action bogus"));
    assert!(updates[0].is_done());
}
