//! Orchestrator that bundles the shared-state components for request handlers.
//!
//! Every component shares one [`StoreAdapter`] and one clock. Beyond
//! construction, the orchestrator adds the flows that span components:
//! rate-limited login, logout, per-request session checks, cache
//! invalidation after writes to the durable datastore, and health reporting.

use crate::cache::{chat_history_key, media_history_key, CacheManager};
use crate::clock::SharedClock;
use crate::config::{Config, CookieSettings};
use crate::connections::ConnectionRegistry;
use crate::errors::StateError;
use crate::identity::IdentityProvider;
use crate::rate_limit::{RateLimit, RateLimiter};
use crate::session::{SessionClaims, SessionManager, SessionRecord, SessionStatus};
use crate::store::{KeyValueStore, StoreAdapter};
use crate::task_queue::TaskQueue;
use crate::tasks::SessionSweeper;
use secrecy::SecretString;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Rate-limited action name for login attempts.
pub const LOGIN_ACTION: &str = "login";

/// Message type pushed to realtime clients.
pub type RealtimeMessage = serde_json::Value;

/// A session issued by a successful login.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session_key: String,
    pub record: SessionRecord,
    /// Attributes for the cookie carrying `session_key`.
    pub cookie: CookieSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Snapshot returned by [`Orchestrator::health`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub store_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
    pub connections_active: usize,
    /// `None` when the queue length could not be read.
    pub pending_tasks: Option<u64>,
}

/// Shared-state components plus the flows that span them.
pub struct Orchestrator<M = RealtimeMessage> {
    store: StoreAdapter,
    sessions: Arc<SessionManager>,
    rate_limiter: RateLimiter,
    cache: CacheManager,
    tasks: TaskQueue,
    connections: ConnectionRegistry<M>,
}

impl<M> std::fmt::Debug for Orchestrator<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("sessions", &self.sessions)
            .field("rate_limiter", &self.rate_limiter)
            .field("connections", &self.connections)
            .finish_non_exhaustive()
    }
}

impl<M> Orchestrator<M> {
    /// Build every component over `backend`.
    pub fn new(backend: Arc<dyn KeyValueStore>, clock: SharedClock, config: &Config) -> Self {
        let store = StoreAdapter::new(backend, config.store);
        Self {
            sessions: Arc::new(SessionManager::new(
                store.clone(),
                clock.clone(),
                config.session.clone(),
            )),
            rate_limiter: RateLimiter::new(store.clone(), clock.clone(), config.rate_limit),
            cache: CacheManager::new(store.clone(), config.cache_ttl),
            tasks: TaskQueue::new(store.clone(), clock.clone(), &config.task_queue_name),
            connections: ConnectionRegistry::with_clock(clock),
            store,
        }
    }

    pub fn store(&self) -> &StoreAdapter {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    pub fn connections(&self) -> &ConnectionRegistry<M> {
        &self.connections
    }

    /// Rate-limit by client address, verify credentials, then issue a session.
    ///
    /// # Errors
    ///
    /// - `StateError::RateLimited` if the client exceeded the login limit
    /// - `StateError::Unauthorized` if the credentials were rejected
    /// - `StateError::StoreUnavailable` if the identity provider or the
    ///   session write failed
    #[instrument(skip_all, name = "state.login")]
    pub async fn login(
        &self,
        identity: &dyn IdentityProvider,
        email: &str,
        password: &SecretString,
        client_ip: &str,
    ) -> Result<IssuedSession, StateError> {
        let limit = RateLimit::from(*self.rate_limiter.settings());
        self.rate_limiter
            .enforce(LOGIN_ACTION, client_ip, limit)
            .await?;

        let user_id = identity.authenticate(email, password).await.map_err(|e| {
            warn!(target: "state.session", error = %e, "Login rejected");
            StateError::from(e)
        })?;

        let claims = SessionClaims::new(user_id).with_email(email);
        let (session_key, record) = self.sessions.issue(claims).await?;

        info!(target: "state.session", user_id = %record.user_id, "User logged in");
        Ok(IssuedSession {
            session_key,
            record,
            cookie: self.sessions.settings().cookie.clone(),
        })
    }

    /// End a session. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns `StateError::StoreUnavailable` if the delete cannot be confirmed.
    pub async fn logout(&self, session_key: &str) -> Result<bool, StateError> {
        self.sessions.delete(session_key).await
    }

    /// Per-request session check with sliding refresh.
    pub async fn authenticate_request(&self, session_key: &str) -> SessionStatus {
        self.sessions.validate_and_refresh(session_key).await
    }

    /// Drop the cached chat history after the user's chat log changed.
    ///
    /// # Errors
    ///
    /// Returns `StateError::StoreUnavailable` if the invalidation cannot be
    /// confirmed; stale history may then be served until the entry expires.
    pub async fn record_chat_mutation(&self, user_id: &str) -> Result<(), StateError> {
        self.cache.invalidate(&chat_history_key(user_id)).await
    }

    /// Drop the cached media history after the user's media records changed.
    ///
    /// # Errors
    ///
    /// Same as [`Orchestrator::record_chat_mutation`].
    pub async fn record_media_mutation(&self, user_id: &str) -> Result<(), StateError> {
        self.cache.invalidate(&media_history_key(user_id)).await
    }

    /// Store reachability plus connection and queue gauges. Never fails.
    pub async fn health(&self) -> HealthReport {
        let store = self.store.health_check().await;
        let pending_tasks = if store.healthy {
            self.tasks.pending().await.ok()
        } else {
            None
        };

        HealthReport {
            status: if store.healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            store_latency_ms: u64::try_from(store.latency.as_millis()).unwrap_or(u64::MAX),
            store_error: store.error,
            connections_active: self.connections.len(),
            pending_tasks,
        }
    }

    /// Spawn the session sweep task with the configured interval.
    pub fn start_sweeper(&self, cancel_token: &CancellationToken) -> SessionSweeper {
        SessionSweeper::start(
            Arc::clone(&self.sessions),
            self.sessions.settings().sweep_interval,
            cancel_token,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::IdentityError;
    use crate::store::MemoryStore;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    struct OnePassword;

    #[async_trait::async_trait]
    impl IdentityProvider for OnePassword {
        async fn authenticate(
            &self,
            email: &str,
            password: &SecretString,
        ) -> Result<String, IdentityError> {
            if password.expose_secret() == "correct horse" {
                Ok(format!("id-{email}"))
            } else {
                Err(IdentityError::InvalidCredentials)
            }
        }
    }

    fn orchestrator(extra: &[(&str, &str)]) -> Orchestrator {
        let mut vars = HashMap::from([("REDIS_URL".to_string(), "redis://unused".to_string())]);
        for (k, v) in extra {
            vars.insert((*k).to_string(), (*v).to_string());
        }
        let config = Config::from_vars(&vars).unwrap();
        let clock = ManualClock::starting_now();
        Orchestrator::new(Arc::new(MemoryStore::new(clock.clone())), clock, &config)
    }

    fn password(p: &str) -> SecretString {
        SecretString::from(p.to_string())
    }

    #[tokio::test]
    async fn test_login_issues_session() {
        let state = orchestrator(&[]);
        let issued = state
            .login(&OnePassword, "a@example.com", &password("correct horse"), "10.0.0.1")
            .await
            .unwrap();

        assert_eq!(issued.record.user_id, "id-a@example.com");
        assert_eq!(issued.cookie.name, "session_id");
        assert!(state.authenticate_request(&issued.session_key).await.is_valid());

        assert!(state.logout(&issued.session_key).await.unwrap());
        assert!(!state.authenticate_request(&issued.session_key).await.is_valid());
    }

    #[tokio::test]
    async fn test_login_wrong_password_is_unauthorized() {
        let state = orchestrator(&[]);
        let err = state
            .login(&OnePassword, "a@example.com", &password("nope"), "10.0.0.1")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[tokio::test]
    async fn test_login_is_rate_limited_per_client() {
        let state = orchestrator(&[("STATE_RATE_LIMIT_REQUESTS", "2")]);
        for _ in 0..2 {
            let _ = state
                .login(&OnePassword, "a@example.com", &password("nope"), "10.0.0.1")
                .await;
        }

        let err = state
            .login(&OnePassword, "a@example.com", &password("correct horse"), "10.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::RateLimited { .. }));
        assert!(err.retry_after_seconds().is_some());

        // A different address is unaffected
        assert!(state
            .login(&OnePassword, "a@example.com", &password("correct horse"), "10.0.0.2")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_record_chat_mutation_invalidates_history() {
        let state = orchestrator(&[]);
        state
            .cache()
            .set(&chat_history_key("u1"), &vec!["hi"], None)
            .await;

        state.record_chat_mutation("u1").await.unwrap();
        assert_eq!(
            state.cache().get::<Vec<String>>(&chat_history_key("u1")).await,
            None
        );
    }

    #[tokio::test]
    async fn test_health_reports_gauges() {
        let state = orchestrator(&[]);
        let (handle, _rx) = state.connections().open(1);
        state.connections().register("c1", handle);

        let report = state.health().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.connections_active, 1);
        assert_eq!(report.pending_tasks, Some(0));
        assert!(report.store_error.is_none());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "healthy");
    }
}
