//! Tests for the session sweep and its background task.
//!
//! Uses tokio's paused time for the sweep interval and the harness
//! `ManualClock` for session expiry.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use state_service::store::KeyValueStore;
use state_test_utils::{user_claims, TestHarness};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Write a record the store will never evict, last refreshed at `at`.
async fn plant_stale_record(harness: &TestHarness, session_key: &str, user_id: &str) {
    let at = harness.now() - chrono::Duration::hours(10);
    let record = serde_json::json!({
        "user_id": user_id,
        "created_at": at,
        "last_refresh": at,
        "lifetime_seconds": 3600,
    });
    harness
        .memory
        .set(&format!("session:{session_key}"), &record.to_string(), None)
        .await
        .unwrap();
    harness
        .memory
        .set_add(&format!("session-index:{user_id}"), session_key)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_sweep_removes_orphans_and_stale_records() {
    let harness = TestHarness::new();
    let sessions = harness.state.sessions();

    let (live, _) = sessions.issue(user_claims("alice")).await.unwrap();
    harness
        .memory
        .set_add("session-index:alice", "evicted-key")
        .await
        .unwrap();
    plant_stale_record(&harness, "stale-key", "bob").await;
    harness
        .memory
        .set("session:garbage", "not json", None)
        .await
        .unwrap();
    harness
        .memory
        .set_add("session-index:carol", "garbage")
        .await
        .unwrap();

    let report = sessions.sweep_expired().await.unwrap();
    assert!(!report.skipped);
    assert_eq!(report.indexes_scanned, 3);
    assert_eq!(report.sessions_checked, 4);
    assert_eq!(report.orphans_removed, 1);
    assert_eq!(report.expired_removed, 2);
    assert_eq!(report.errors, 0);

    assert!(sessions.validate(&live).await.is_valid());
    assert!(!harness.memory.exists("session:stale-key").await.unwrap());
    assert!(!harness.memory.exists("session:garbage").await.unwrap());
    assert_eq!(
        harness.memory.set_members("session-index:alice").await.unwrap(),
        vec![live]
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_sweeps_are_single_flight() {
    let harness = TestHarness::new();
    plant_stale_record(&harness, "stale-key", "bob").await;
    harness.store_faults().set_delay(Duration::from_millis(50));

    let sessions = harness.state.sessions();
    let (first, second) = tokio::join!(sessions.sweep_expired(), sessions.sweep_expired());
    let (first, second) = (first.unwrap(), second.unwrap());

    assert!(!first.skipped);
    assert_eq!(first.expired_removed, 1);
    assert!(second.skipped);
    assert_eq!(second.removed(), 0);

    // The flag is released once the first sweep finishes
    let third = sessions.sweep_expired().await.unwrap();
    assert!(!third.skipped);
}

#[tokio::test]
async fn test_sweep_scan_failure_is_an_error() {
    let harness = TestHarness::new();
    harness.store_faults().fail_operation("scan_prefix");

    assert!(harness.state.sessions().sweep_expired().await.is_err());

    harness.store_faults().heal();
    assert!(harness.state.sessions().sweep_expired().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_runs_on_interval() {
    let harness = TestHarness::with_vars(&[("STATE_SESSION_SWEEP_INTERVAL_SECONDS", "10")]);
    plant_stale_record(&harness, "first", "bob").await;

    let token = CancellationToken::new();
    let sweeper = harness.state.start_sweeper(&token);

    // First tick fires immediately
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!harness.memory.exists("session:first").await.unwrap());

    plant_stale_record(&harness, "second", "bob").await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(harness.memory.exists("session:second").await.unwrap());

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!harness.memory.exists("session:second").await.unwrap());

    sweeper.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_survives_a_failed_tick() {
    let harness = TestHarness::with_vars(&[("STATE_SESSION_SWEEP_INTERVAL_SECONDS", "10")]);
    plant_stale_record(&harness, "stale", "bob").await;
    harness.store_faults().fail_operation("scan_prefix");

    let token = CancellationToken::new();
    let sweeper = harness.state.start_sweeper(&token);

    // First tick fails
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(harness.memory.exists("session:stale").await.unwrap());
    assert!(!sweeper.is_finished());

    // The next tick reconciles
    harness.store_faults().heal();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!harness.memory.exists("session:stale").await.unwrap());
    assert!(harness
        .memory
        .set_members("session-index:bob")
        .await
        .unwrap()
        .is_empty());

    sweeper.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_stops_on_parent_cancellation() {
    let harness = TestHarness::with_vars(&[("STATE_SESSION_SWEEP_INTERVAL_SECONDS", "10")]);

    let token = CancellationToken::new();
    let sweeper = harness.state.start_sweeper(&token);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!sweeper.is_finished());

    token.cancel();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(sweeper.is_finished());

    // Stopping an already finished sweeper is fine
    sweeper.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_stop_leaves_parent_running() {
    let harness = TestHarness::with_vars(&[("STATE_SESSION_SWEEP_INTERVAL_SECONDS", "10")]);

    let token = CancellationToken::new();
    let sweeper = harness.state.start_sweeper(&token);
    sweeper.stop().await;

    assert!(!token.is_cancelled());
}
