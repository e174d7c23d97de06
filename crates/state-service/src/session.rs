//! Session manager.
//!
//! Sessions are JSON records under `session:{key}` with a store TTL equal to
//! the sliding lifetime. Expiry is also checked against the record's own
//! timestamps so a record the store has not evicted yet is still rejected.
//!
//! Each user has a `session-index:{user_id}` set of issued keys. The index is
//! best-effort: writes to it never fail the session operation, and
//! [`SessionManager::sweep_expired`] reconciles it with the records.

use crate::clock::{add_saturating, to_chrono, SharedClock};
use crate::config::{FailurePolicy, SessionSettings};
use crate::errors::StateError;
use crate::observability::metrics;
use crate::store::StoreAdapter;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Key prefix for session records.
pub const SESSION_PREFIX: &str = "session:";

/// Key prefix for per-user session indexes.
pub const SESSION_INDEX_PREFIX: &str = "session-index:";

/// Random bytes in a generated session key.
const SESSION_KEY_BYTES: usize = 32;

/// Generate a fresh session key (32 random bytes, URL-safe base64).
#[must_use]
pub fn generate_session_key() -> String {
    let mut bytes = [0u8; SESSION_KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Short prefix of a session key, safe to put in logs.
#[must_use]
pub fn key_fingerprint(session_key: &str) -> String {
    session_key.chars().take(6).collect()
}

fn record_key(session_key: &str) -> String {
    format!("{SESSION_PREFIX}{session_key}")
}

fn index_key(user_id: &str) -> String {
    format!("{SESSION_INDEX_PREFIX}{user_id}")
}

/// Identity attached to a new session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub user_id: String,
    pub email: Option<String>,
    /// Additional application claims.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SessionClaims {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            extra: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_claim(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }
}

/// Stored session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_refresh: DateTime<Utc>,
    /// Sliding lifetime applied on every write.
    pub lifetime_seconds: u64,
    #[serde(default)]
    pub claims: serde_json::Map<String, serde_json::Value>,
}

impl SessionRecord {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_seconds)
    }

    /// End of the sliding lifetime.
    pub fn idle_deadline(&self) -> DateTime<Utc> {
        add_saturating(self.last_refresh, self.lifetime())
    }

    fn decode(raw: &str) -> Option<Self> {
        let record: Self = serde_json::from_str(raw).ok()?;
        if record.user_id.trim().is_empty() {
            return None;
        }
        Some(record)
    }
}

/// Why a session was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    Missing,
    Malformed,
    Expired,
    StoreUnavailable,
}

impl InvalidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidReason::Missing => "missing",
            InvalidReason::Malformed => "malformed",
            InvalidReason::Expired => "expired",
            InvalidReason::StoreUnavailable => "store_unavailable",
        }
    }
}

/// Result of validating a session key.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    Valid(SessionRecord),
    Invalid(InvalidReason),
}

impl SessionStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, SessionStatus::Valid(_))
    }

    pub fn record(&self) -> Option<&SessionRecord> {
        match self {
            SessionStatus::Valid(record) => Some(record),
            SessionStatus::Invalid(_) => None,
        }
    }

    pub fn into_record(self) -> Option<SessionRecord> {
        match self {
            SessionStatus::Valid(record) => Some(record),
            SessionStatus::Invalid(_) => None,
        }
    }
}

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Another sweep was running; this call did nothing.
    pub skipped: bool,
    pub indexes_scanned: usize,
    pub sessions_checked: usize,
    /// Index entries whose record no longer exists.
    pub orphans_removed: usize,
    /// Expired or malformed records deleted.
    pub expired_removed: usize,
    /// Per-index failures that were logged and skipped.
    pub errors: usize,
}

impl SweepReport {
    pub fn removed(&self) -> usize {
        self.orphans_removed + self.expired_removed
    }
}

enum RefreshOutcome {
    Refreshed(SessionRecord),
    Gone,
    Expired,
}

/// Clears the single-flight flag when a sweep ends, including early returns.
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Session create/validate/refresh/delete over the shared store.
pub struct SessionManager {
    store: StoreAdapter,
    clock: SharedClock,
    settings: SessionSettings,
    sweep_in_progress: AtomicBool,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(store: StoreAdapter, clock: SharedClock, settings: SessionSettings) -> Self {
        Self {
            store,
            clock,
            settings,
            sweep_in_progress: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Whether the record is past its sliding lifetime or absolute ceiling.
    fn is_expired(&self, record: &SessionRecord, now: DateTime<Utc>) -> bool {
        now >= record.idle_deadline() || self.ceiling_reached(record, now)
    }

    fn ceiling_reached(&self, record: &SessionRecord, now: DateTime<Utc>) -> bool {
        self.settings
            .absolute_max
            .is_some_and(|max| now >= add_saturating(record.created_at, max))
    }

    /// Store TTL for a write at `now`: the lifetime, bounded by the time left
    /// before the absolute ceiling.
    fn write_ttl(&self, record: &SessionRecord, now: DateTime<Utc>) -> Duration {
        let lifetime = record.lifetime();
        match self.settings.absolute_max {
            Some(max) => {
                let remaining = (add_saturating(record.created_at, max) - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                lifetime.min(remaining)
            }
            None => lifetime,
        }
    }

    /// Create a session under a caller-chosen key.
    ///
    /// # Errors
    ///
    /// - `StateError::Malformed` if `user_id` is empty
    /// - `StateError::StoreUnavailable` if the record write cannot be confirmed
    #[instrument(skip_all, fields(session = %key_fingerprint(session_key), user_id = %claims.user_id))]
    pub async fn create(
        &self,
        session_key: &str,
        claims: SessionClaims,
        lifetime: Duration,
    ) -> Result<SessionRecord, StateError> {
        if claims.user_id.trim().is_empty() {
            return Err(StateError::Malformed(
                "session user_id must not be empty".to_string(),
            ));
        }

        let now = self.clock.now();
        let record = SessionRecord {
            user_id: claims.user_id,
            email: claims.email,
            created_at: now,
            last_refresh: now,
            lifetime_seconds: lifetime.as_secs().max(1),
            claims: claims.extra,
        };
        let payload = serde_json::to_string(&record)?;
        let ttl = self.write_ttl(&record, now);

        self.store
            .set(&record_key(session_key), &payload, Some(ttl))
            .await?;

        if let Err(e) = self
            .store
            .set_add(&index_key(&record.user_id), session_key)
            .await
        {
            warn!(
                target: "state.session",
                error = %e,
                "Failed to index session, sweep will not track it"
            );
        }

        info!(
            target: "state.session",
            ttl_seconds = ttl.as_secs(),
            "Session created"
        );
        Ok(record)
    }

    /// Create a session under a freshly generated key with the configured lifetime.
    ///
    /// # Errors
    ///
    /// Same as [`SessionManager::create`].
    pub async fn issue(
        &self,
        claims: SessionClaims,
    ) -> Result<(String, SessionRecord), StateError> {
        let session_key = generate_session_key();
        let record = self
            .create(&session_key, claims, self.settings.ttl)
            .await?;
        Ok((session_key, record))
    }

    /// Look up a session. Never fails; every problem maps to an
    /// [`InvalidReason`].
    #[instrument(skip_all, fields(session = %key_fingerprint(session_key)))]
    pub async fn validate(&self, session_key: &str) -> SessionStatus {
        let status = self.validate_inner(session_key).await;
        let outcome = match &status {
            SessionStatus::Valid(_) => "valid",
            SessionStatus::Invalid(reason) => reason.as_str(),
        };
        metrics::record_session_validation(outcome);
        status
    }

    async fn validate_inner(&self, session_key: &str) -> SessionStatus {
        if session_key.is_empty() {
            return SessionStatus::Invalid(InvalidReason::Missing);
        }

        let raw = match self.store.get(&record_key(session_key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return SessionStatus::Invalid(InvalidReason::Missing),
            Err(e) => {
                warn!(
                    target: "state.session",
                    error = %e,
                    "Session lookup failed, treating as invalid"
                );
                return SessionStatus::Invalid(InvalidReason::StoreUnavailable);
            }
        };

        let Some(record) = SessionRecord::decode(&raw) else {
            warn!(target: "state.session", "Stored session record is malformed");
            return SessionStatus::Invalid(InvalidReason::Malformed);
        };

        if self.is_expired(&record, self.clock.now()) {
            debug!(target: "state.session", "Session expired, removing");
            self.remove_best_effort(session_key, &record.user_id).await;
            return SessionStatus::Invalid(InvalidReason::Expired);
        }

        SessionStatus::Valid(record)
    }

    async fn remove_best_effort(&self, session_key: &str, user_id: &str) {
        if let Err(e) = self.store.delete(&record_key(session_key)).await {
            warn!(target: "state.session", error = %e, "Failed to delete expired session");
            return;
        }
        if let Err(e) = self.store.set_remove(&index_key(user_id), session_key).await {
            debug!(target: "state.session", error = %e, "Failed to unindex session");
        }
    }

    async fn refresh_inner(&self, session_key: &str) -> Result<RefreshOutcome, StateError> {
        let key = record_key(session_key);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(RefreshOutcome::Gone);
        };
        let mut record = SessionRecord::decode(&raw)
            .ok_or_else(|| StateError::Malformed("stored session record".to_string()))?;

        let now = self.clock.now();
        if self.is_expired(&record, now) {
            self.remove_best_effort(session_key, &record.user_id).await;
            return Ok(RefreshOutcome::Expired);
        }

        record.last_refresh = now;
        let ttl = self.write_ttl(&record, now);
        let payload = serde_json::to_string(&record)?;

        // SET XX: a session deleted since the read stays deleted
        if !self.store.set_if_exists(&key, &payload, Some(ttl)).await? {
            debug!(target: "state.session", "Session deleted during refresh");
            return Ok(RefreshOutcome::Gone);
        }

        metrics::record_session_refresh();
        debug!(
            target: "state.session",
            ttl_seconds = ttl.as_secs(),
            "Session refreshed"
        );
        Ok(RefreshOutcome::Refreshed(record))
    }

    /// Bump `last_refresh` to now and reset the store TTL.
    ///
    /// Returns `false` if the session is gone or has expired.
    ///
    /// # Errors
    ///
    /// - `StateError::StoreUnavailable` if the store cannot be reached
    /// - `StateError::Malformed` if the stored record cannot be decoded
    #[instrument(skip_all, fields(session = %key_fingerprint(session_key)))]
    pub async fn refresh(&self, session_key: &str) -> Result<bool, StateError> {
        Ok(matches!(
            self.refresh_inner(session_key).await?,
            RefreshOutcome::Refreshed(_)
        ))
    }

    /// Refresh only if the session has been idle for longer than `threshold`.
    ///
    /// # Errors
    ///
    /// Same as [`SessionManager::refresh`].
    pub async fn maybe_refresh(
        &self,
        session_key: &str,
        record: &SessionRecord,
        threshold: Duration,
    ) -> Result<bool, StateError> {
        if self.needs_refresh(record, threshold) {
            self.refresh(session_key).await
        } else {
            Ok(false)
        }
    }

    fn needs_refresh(&self, record: &SessionRecord, threshold: Duration) -> bool {
        self.clock.now() - record.last_refresh > to_chrono(threshold)
    }

    /// Validate, then refresh if past the configured threshold.
    ///
    /// Returns the record as stored after any refresh. A failed refresh write
    /// is resolved by the session [`FailurePolicy`].
    #[instrument(skip_all, fields(session = %key_fingerprint(session_key)))]
    pub async fn validate_and_refresh(&self, session_key: &str) -> SessionStatus {
        let record = match self.validate(session_key).await {
            SessionStatus::Valid(record) => record,
            invalid => return invalid,
        };

        if !self.needs_refresh(&record, self.settings.refresh_threshold) {
            return SessionStatus::Valid(record);
        }

        match self.refresh_inner(session_key).await {
            Ok(RefreshOutcome::Refreshed(updated)) => SessionStatus::Valid(updated),
            Ok(RefreshOutcome::Gone) => SessionStatus::Invalid(InvalidReason::Missing),
            Ok(RefreshOutcome::Expired) => SessionStatus::Invalid(InvalidReason::Expired),
            Err(StateError::Malformed(_)) => SessionStatus::Invalid(InvalidReason::Malformed),
            Err(e) => match self.settings.failure_policy {
                FailurePolicy::FailOpen => {
                    warn!(
                        target: "state.session",
                        error = %e,
                        policy = "fail_open",
                        "Session refresh failed, keeping session valid"
                    );
                    SessionStatus::Valid(record)
                }
                FailurePolicy::FailClosed => {
                    warn!(
                        target: "state.session",
                        error = %e,
                        policy = "fail_closed",
                        "Session refresh failed, rejecting session"
                    );
                    SessionStatus::Invalid(InvalidReason::StoreUnavailable)
                }
            },
        }
    }

    /// Delete a session. Idempotent; returns whether a record existed.
    ///
    /// # Errors
    ///
    /// Returns `StateError::StoreUnavailable` if the delete cannot be confirmed.
    #[instrument(skip_all, fields(session = %key_fingerprint(session_key)))]
    pub async fn delete(&self, session_key: &str) -> Result<bool, StateError> {
        let key = record_key(session_key);
        let owner = match self.store.get(&key).await {
            Ok(Some(raw)) => SessionRecord::decode(&raw).map(|r| r.user_id),
            _ => None,
        };

        let existed = self.store.delete(&key).await?;

        if let Some(user_id) = owner {
            if let Err(e) = self.store.set_remove(&index_key(&user_id), session_key).await {
                debug!(target: "state.session", error = %e, "Failed to unindex session");
            }
        }

        if existed {
            info!(target: "state.session", "Session deleted");
        }
        Ok(existed)
    }

    /// Delete every indexed session of a user. Returns how many existed.
    ///
    /// # Errors
    ///
    /// Returns `StateError::StoreUnavailable` on the first failed store call.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn delete_user_sessions(&self, user_id: &str) -> Result<usize, StateError> {
        let index = index_key(user_id);
        let keys = self.store.set_members(&index).await?;

        let mut deleted = 0;
        for session_key in &keys {
            if self.store.delete(&record_key(session_key)).await? {
                deleted += 1;
            }
        }
        self.store.delete(&index).await?;

        info!(
            target: "state.session",
            deleted = deleted,
            "Deleted all sessions for user"
        );
        Ok(deleted)
    }

    /// Reconcile session indexes with their records.
    ///
    /// Removes index entries whose record is gone and deletes records that
    /// are expired or malformed. Only one sweep runs at a time; a concurrent
    /// call returns a report with `skipped` set.
    ///
    /// # Errors
    ///
    /// Returns `StateError::StoreUnavailable` if the index scan fails.
    /// Failures on individual indexes are counted in [`SweepReport::errors`].
    #[instrument(skip_all, name = "state.session.sweep")]
    pub async fn sweep_expired(&self) -> Result<SweepReport, StateError> {
        if self
            .sweep_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(target: "state.session", "Sweep already running, skipping");
            metrics::record_session_sweep("skipped", 0);
            return Ok(SweepReport {
                skipped: true,
                ..SweepReport::default()
            });
        }
        let _guard = SweepGuard(&self.sweep_in_progress);

        let result = self.sweep_indexes().await;
        match &result {
            Ok(report) => {
                metrics::record_session_sweep("completed", report.removed() as u64);
            }
            Err(_) => metrics::record_session_sweep("failed", 0),
        }
        result
    }

    async fn sweep_indexes(&self) -> Result<SweepReport, StateError> {
        let mut report = SweepReport::default();
        let indexes = self.store.scan_prefix(SESSION_INDEX_PREFIX).await?;

        for index in &indexes {
            report.indexes_scanned += 1;
            if let Err(e) = self.sweep_index(index, &mut report).await {
                report.errors += 1;
                warn!(
                    target: "state.session",
                    error = %e,
                    "Failed to sweep session index, continuing"
                );
            }
        }

        Ok(report)
    }

    async fn sweep_index(&self, index: &str, report: &mut SweepReport) -> Result<(), StateError> {
        let now = self.clock.now();
        for session_key in self.store.set_members(index).await? {
            report.sessions_checked += 1;
            let key = record_key(&session_key);

            let Some(raw) = self.store.get(&key).await? else {
                self.store.set_remove(index, &session_key).await?;
                report.orphans_removed += 1;
                continue;
            };

            let stale = SessionRecord::decode(&raw).map_or(true, |r| self.is_expired(&r, now));
            if stale {
                self.store.delete(&key).await?;
                self.store.set_remove(index, &session_key).await?;
                report.expired_removed += 1;
            }
        }
        Ok(())
    }
}
