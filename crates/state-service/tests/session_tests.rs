//! Session lifecycle tests over the in-memory store and manual clock.
//!
//! Covers sliding expiry across many lifetimes, the absolute ceiling,
//! single refresh per threshold crossing, and delete/refresh races.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use state_service::session::{InvalidReason, SessionStatus};
use state_service::store::KeyValueStore;
use state_test_utils::{user_claims, TestHarness};
use std::time::Duration;

// ============================================================================
// Sliding expiry
// ============================================================================

#[tokio::test]
async fn test_active_session_survives_many_lifetimes() {
    // L = 600s, refresh after 60s idle
    let harness = TestHarness::with_vars(&[
        ("STATE_SESSION_TTL_SECONDS", "600"),
        ("STATE_SESSION_REFRESH_THRESHOLD_SECONDS", "60"),
        ("STATE_SESSION_ABSOLUTE_MAX_SECONDS", "0"),
    ]);
    let sessions = harness.state.sessions();
    let (key, _) = sessions.issue(user_claims("alice")).await.unwrap();

    // Ten requests, each 500s apart: 5000s total, more than 8 lifetimes
    for _ in 0..10 {
        harness.advance_secs(500);
        let status = harness.state.authenticate_request(&key).await;
        assert!(status.is_valid(), "session should slide while in use");
    }

    let record = sessions.validate(&key).await.into_record().unwrap();
    assert_eq!(record.last_refresh, harness.now());
}

#[tokio::test]
async fn test_idle_session_expires_after_lifetime() {
    let harness = TestHarness::with_vars(&[
        ("STATE_SESSION_TTL_SECONDS", "600"),
        ("STATE_SESSION_REFRESH_THRESHOLD_SECONDS", "60"),
    ]);
    let (key, _) = harness
        .state
        .sessions()
        .issue(user_claims("alice"))
        .await
        .unwrap();

    harness.advance_secs(599);
    assert!(harness.state.sessions().validate(&key).await.is_valid());

    // validate alone does not slide the lifetime
    harness.advance_secs(1);
    assert!(!harness.state.authenticate_request(&key).await.is_valid());
}

#[tokio::test]
async fn test_absolute_ceiling_ends_active_session() {
    let harness = TestHarness::with_vars(&[
        ("STATE_SESSION_TTL_SECONDS", "600"),
        ("STATE_SESSION_REFRESH_THRESHOLD_SECONDS", "60"),
        ("STATE_SESSION_ABSOLUTE_MAX_SECONDS", "1000"),
    ]);
    let (key, _) = harness
        .state
        .sessions()
        .issue(user_claims("alice"))
        .await
        .unwrap();

    harness.advance_secs(500);
    assert!(harness.state.authenticate_request(&key).await.is_valid());

    // Refresh at 900s cannot extend the stored TTL past the 1000s ceiling
    harness.advance_secs(400);
    assert!(harness.state.authenticate_request(&key).await.is_valid());
    assert_eq!(
        harness.memory.ttl(&format!("session:{key}")),
        Some(Duration::from_secs(100))
    );

    harness.advance_secs(100);
    assert!(!harness.state.authenticate_request(&key).await.is_valid());
}

// ============================================================================
// Refresh
// ============================================================================

#[tokio::test]
async fn test_refresh_happens_once_per_threshold_crossing() {
    let harness = TestHarness::with_vars(&[
        ("STATE_SESSION_TTL_SECONDS", "600"),
        ("STATE_SESSION_REFRESH_THRESHOLD_SECONDS", "60"),
    ]);
    let (key, issued) = harness
        .state
        .sessions()
        .issue(user_claims("alice"))
        .await
        .unwrap();

    // Inside the threshold: no write
    harness.advance_secs(30);
    let record = harness
        .state
        .authenticate_request(&key)
        .await
        .into_record()
        .unwrap();
    assert_eq!(record.last_refresh, issued.last_refresh);

    // Past the threshold: exactly one refresh
    harness.advance_secs(31);
    let refreshed = harness
        .state
        .authenticate_request(&key)
        .await
        .into_record()
        .unwrap();
    assert_eq!(refreshed.last_refresh, harness.now());

    let writes_before = harness.store_faults().calls();
    harness.advance_secs(1);
    let again = harness
        .state
        .authenticate_request(&key)
        .await
        .into_record()
        .unwrap();
    assert_eq!(again.last_refresh, refreshed.last_refresh);
    // One read, no write
    assert_eq!(harness.store_faults().calls(), writes_before + 1);
}

#[tokio::test]
async fn test_refresh_after_delete_does_not_resurrect() {
    let harness = TestHarness::new();
    let sessions = harness.state.sessions();
    let (key, _) = sessions.issue(user_claims("alice")).await.unwrap();

    assert!(harness.state.logout(&key).await.unwrap());
    assert!(!sessions.refresh(&key).await.unwrap());
    assert!(!harness
        .memory
        .exists(&format!("session:{key}"))
        .await
        .unwrap());
}

// ============================================================================
// Delete
// ============================================================================

#[tokio::test]
async fn test_validate_missing_and_deleted_keys() {
    let harness = TestHarness::new();
    let sessions = harness.state.sessions();

    assert_eq!(
        sessions.validate("never-issued").await,
        SessionStatus::Invalid(InvalidReason::Missing)
    );

    let (key, _) = sessions.issue(user_claims("alice")).await.unwrap();
    assert!(sessions.delete(&key).await.unwrap());
    assert_eq!(
        sessions.validate(&key).await,
        SessionStatus::Invalid(InvalidReason::Missing)
    );

    // Idempotent
    assert!(!sessions.delete(&key).await.unwrap());
}

#[tokio::test]
async fn test_delete_user_sessions_removes_every_device() {
    let harness = TestHarness::new();
    let sessions = harness.state.sessions();
    let (laptop, _) = sessions.issue(user_claims("alice")).await.unwrap();
    let (phone, _) = sessions.issue(user_claims("alice")).await.unwrap();
    let (other, _) = sessions.issue(user_claims("bob")).await.unwrap();

    assert_eq!(sessions.delete_user_sessions("alice").await.unwrap(), 2);
    assert!(!sessions.validate(&laptop).await.is_valid());
    assert!(!sessions.validate(&phone).await.is_valid());
    assert!(sessions.validate(&other).await.is_valid());
}

#[tokio::test]
async fn test_claims_round_trip_through_store() {
    let harness = TestHarness::new();
    let (key, _) = harness
        .state
        .sessions()
        .issue(user_claims("alice"))
        .await
        .unwrap();

    let record = harness
        .state
        .sessions()
        .validate(&key)
        .await
        .into_record()
        .unwrap();
    assert_eq!(record.email.as_deref(), Some("alice@example.com"));
    assert_eq!(record.claims["role"], "member");
}
