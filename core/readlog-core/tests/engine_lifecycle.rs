//! Integration tests for the page lifecycle against real storage backends.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use readlog_core::{
    ActivityState, Clock, JsonFileStore, KeyValueStore, ManualClock, MemoryStore, ReadlogEngine,
    ScriptedApiClient, StorageConfig, TrackerConfig, UserSession,
};
use serde_json::json;
use tempfile::tempdir;

fn start_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 1, 20, 9, 0, 0).unwrap(),
    ))
}

fn engine_with(backend: Arc<dyn KeyValueStore>, clock: Arc<ManualClock>) -> ReadlogEngine {
    ReadlogEngine::new(
        TrackerConfig::default(),
        backend,
        Arc::new(ScriptedApiClient::new()),
        clock,
    )
}

#[test]
fn test_reading_time_survives_restart() {
    let temp = tempdir().unwrap();
    let storage = StorageConfig::with_root(temp.path().to_path_buf());
    storage.ensure_dirs().unwrap();
    let clock = start_clock();

    {
        let backend = Arc::new(JsonFileStore::open(&storage.store_file()).unwrap());
        let engine = engine_with(backend, clock.clone());
        engine.login(UserSession::new("alice", None));
        engine.tracker().start();

        clock.advance(Duration::seconds(45));
        engine.on_activity();
        clock.advance(Duration::seconds(45));
        assert_eq!(engine.tick().accrued_minutes, Some(1.5));

        let report = engine.destroy();
        assert!(report.is_clean());
    }

    let backend = Arc::new(JsonFileStore::open(&storage.store_file()).unwrap());
    let engine = engine_with(backend, clock);
    let migration = engine.login(UserSession::new("alice", None));
    assert!(migration.already_migrated);

    let summary = engine.summary();
    assert_eq!(summary.day, "2024-01-20");
    assert_eq!(summary.today_minutes, 1.5);
    assert_eq!(summary.tracked_days, 1);
}

#[test]
fn test_corrupt_store_file_starts_empty() {
    let temp = tempdir().unwrap();
    let storage = StorageConfig::with_root(temp.path().to_path_buf());
    storage.ensure_dirs().unwrap();
    std::fs::write(storage.store_file(), "{not json").unwrap();

    let backend = Arc::new(JsonFileStore::open(&storage.store_file()).unwrap());
    let engine = engine_with(backend, start_clock());
    engine.login(UserSession::new("alice", None));
    assert_eq!(engine.summary().tracked_days, 0);
}

#[test]
fn test_legacy_flat_ledger_is_adopted_on_login() {
    let backend = Arc::new(MemoryStore::new());
    backend
        .set(
            "readlog.reading_time",
            json!({"2024-01-18": 12.5, "2024-01-19": 3.0}),
        )
        .unwrap();
    let engine = engine_with(backend.clone(), start_clock());

    let report = engine.login(UserSession::new("alice", None));
    assert_eq!(report.adopted_legacy_keys, 1);
    assert!(report.ledger_upgraded);

    let summary = engine.summary();
    assert_eq!(summary.tracked_days, 2);
    assert_eq!(summary.month_minutes, 15.5);
    assert!(backend.get("readlog.reading_time_alice").unwrap().is_some());

    engine.logout();
    let again = engine.login(UserSession::new("alice", None));
    assert!(again.already_migrated);
}

#[test]
fn test_newer_ledger_is_never_overwritten() {
    let backend = Arc::new(MemoryStore::new());
    let stored = json!({
        "version": 3,
        "dailyData": {"2024-01-01": 500, "2024-01-02": 400}
    });
    backend
        .set("readlog.reading_time_alice", stored.clone())
        .unwrap();
    let clock = start_clock();
    let engine = engine_with(backend.clone(), clock.clone());

    let report = engine.login(UserSession::new("alice", None));
    assert!(!report.ledger_upgraded);
    engine.tracker().start();
    clock.advance(Duration::seconds(60));
    engine.on_hide();
    engine.destroy();

    assert_eq!(
        backend.get("readlog.reading_time_alice").unwrap(),
        Some(stored)
    );
}

#[test]
fn test_idle_stretch_is_not_credited() {
    let clock = start_clock();
    let engine = engine_with(Arc::new(MemoryStore::new()), clock.clone());
    engine.login(UserSession::new("alice", None));
    engine.tracker().start();

    clock.advance(Duration::seconds(30));
    assert_eq!(engine.tick().accrued_minutes, Some(0.5));

    // Five quiet minutes: only the part inside the idle threshold counts.
    clock.advance(Duration::seconds(300));
    assert_eq!(engine.summary().state, ActivityState::Idle);
    assert_eq!(engine.tick().accrued_minutes, Some(0.5));

    engine.on_activity();
    assert_eq!(engine.summary().state, ActivityState::Active);
    clock.advance(Duration::seconds(30));
    assert_eq!(engine.tick().accrued_minutes, Some(0.5));

    engine.on_hide();
    assert_eq!(engine.summary().today_minutes, 1.5);
}

#[test]
fn test_next_deadline_tracks_earliest_timer() {
    let clock = start_clock();
    let engine = engine_with(Arc::new(MemoryStore::new()), clock.clone());
    engine.login(UserSession::new("alice", None));
    engine.tracker().start();

    let accrual_due = clock.now() + Duration::seconds(30);
    assert_eq!(engine.next_deadline(), Some(accrual_due));

    clock.advance(Duration::seconds(30));
    engine.tick();
    // The accrual write is buffered and due one debounce window later.
    assert_eq!(
        engine.next_deadline(),
        Some(clock.now() + Duration::seconds(1))
    );
}
