//! Fixed-window rate limiter.
//!
//! Each `(action, client)` pair gets one counter per window at
//! `rate:{action}:{client}:{window_index}`, where
//! `window_index = floor(now_ms / window_ms)`. `%` and `:` are
//! percent-encoded in both parts, so no two pairs share a key. The counter is incremented
//! atomically and expires with the window, so a request is admitted iff the
//! post-increment count is at most the limit.
//!
//! Windows are aligned to the epoch, not to the first request. A client can
//! therefore get up to twice the nominal rate through by bursting at the end
//! of one window and the start of the next.
//!
//! When the store cannot answer, the configured [`FailurePolicy`] decides.

use crate::clock::SharedClock;
use crate::config::{FailurePolicy, RateLimitSettings};
use crate::errors::StateError;
use crate::observability::metrics;
use crate::store::StoreAdapter;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Key prefix for rate-limit counters.
pub const RATE_LIMIT_PREFIX: &str = "rate:";

/// Bytes encoded in key components: the separator and the escape itself.
const KEY_COMPONENT: &AsciiSet = &CONTROLS.add(b'%').add(b':');

/// Requests allowed per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimit {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

impl From<RateLimitSettings> for RateLimit {
    fn from(settings: RateLimitSettings) -> Self {
        Self::new(settings.max_requests, settings.window)
    }
}

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests counted in the current window, including this one.
    /// Zero when the store could not be reached.
    pub count: u64,
    pub limit: u32,
    /// Time until the current window ends.
    pub retry_after: Duration,
    /// The store failed and the failure policy made the decision.
    pub degraded: bool,
}

impl RateLimitDecision {
    /// `retry_after` rounded up to whole seconds, at least 1.
    pub fn retry_after_seconds(&self) -> u64 {
        let millis = u64::try_from(self.retry_after.as_millis()).unwrap_or(u64::MAX);
        millis.div_ceil(1000).max(1)
    }
}

/// Window position of an instant.
struct WindowSlot {
    index: u64,
    remaining: Duration,
}

fn window_slot(now_ms: u64, window: Duration) -> WindowSlot {
    let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1);
    let index = now_ms / window_ms;
    let elapsed = now_ms % window_ms;
    WindowSlot {
        index,
        remaining: Duration::from_millis(window_ms - elapsed),
    }
}

fn counter_key(action: &str, client: &str, index: u64) -> String {
    format!(
        "{RATE_LIMIT_PREFIX}{}:{}:{index}",
        utf8_percent_encode(action, KEY_COMPONENT),
        utf8_percent_encode(client, KEY_COMPONENT)
    )
}

/// Per-client fixed-window throttling.
pub struct RateLimiter {
    store: StoreAdapter,
    clock: SharedClock,
    settings: RateLimitSettings,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(store: StoreAdapter, clock: SharedClock, settings: RateLimitSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    /// Count one request and report whether it is within `max_requests`
    /// for the current `window`.
    pub async fn check(
        &self,
        action: &str,
        client: &str,
        max_requests: u32,
        window: Duration,
    ) -> bool {
        self.evaluate(action, client, RateLimit::new(max_requests, window))
            .await
            .allowed
    }

    /// [`RateLimiter::check`] with the configured default limit.
    pub async fn check_default(&self, action: &str, client: &str) -> bool {
        self.evaluate(action, client, self.settings.into())
            .await
            .allowed
    }

    /// Count one request and return the full decision.
    #[instrument(skip_all, fields(action = %action))]
    pub async fn evaluate(&self, action: &str, client: &str, limit: RateLimit) -> RateLimitDecision {
        let now_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        let slot = window_slot(now_ms, limit.window);
        let key = counter_key(action, client, slot.index);

        let decision = match self.store.incr(&key, Some(limit.window)).await {
            Ok(count) => {
                let count = u64::try_from(count).unwrap_or(0);
                RateLimitDecision {
                    allowed: count <= u64::from(limit.max_requests),
                    count,
                    limit: limit.max_requests,
                    retry_after: slot.remaining,
                    degraded: false,
                }
            }
            Err(e) => {
                let allowed = self.settings.failure_policy == FailurePolicy::FailOpen;
                warn!(
                    target: "state.rate_limit",
                    error = %e,
                    policy = self.settings.failure_policy.as_str(),
                    allowed = allowed,
                    "Rate limit store unavailable, applying failure policy"
                );
                RateLimitDecision {
                    allowed,
                    count: 0,
                    limit: limit.max_requests,
                    retry_after: slot.remaining,
                    degraded: true,
                }
            }
        };

        let outcome = match (decision.allowed, decision.degraded) {
            (true, false) => "allowed",
            (false, false) => "rejected",
            (true, true) => "degraded_allow",
            (false, true) => "degraded_reject",
        };
        metrics::record_rate_limit_decision(action, outcome);

        if !decision.allowed && !decision.degraded {
            debug!(
                target: "state.rate_limit",
                count = decision.count,
                limit = decision.limit,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// Like [`RateLimiter::evaluate`], but a rejection is an error.
    ///
    /// # Errors
    ///
    /// Returns `StateError::RateLimited` with the seconds until the window
    /// ends when the request is not allowed.
    pub async fn enforce(
        &self,
        action: &str,
        client: &str,
        limit: RateLimit,
    ) -> Result<RateLimitDecision, StateError> {
        let decision = self.evaluate(action, client, limit).await;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(StateError::RateLimited {
                action: action.to_string(),
                retry_after_seconds: decision.retry_after_seconds(),
            })
        }
    }
}
