//! Observability for the state service.
//!
//! # Privacy by Default
//!
//! Instrumented functions use `#[instrument(skip_all)]` and allow-list safe
//! fields. Session keys are never logged; log lines carry a short fingerprint
//! instead (see [`crate::session::key_fingerprint`]).
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `state_store_latency_seconds` | Histogram | `operation` | Store call latency per attempt |
//! | `state_store_failures_total` | Counter | `operation`, `kind` | Failed store attempts |
//! | `state_session_validations_total` | Counter | `outcome` | Session validation results |
//! | `state_session_refreshes_total` | Counter | none | Sliding-expiry refreshes |
//! | `state_session_sweep_total` | Counter | `outcome` | Sweep passes |
//! | `state_session_sweep_removed_total` | Counter | none | Entries removed by sweeps |
//! | `state_rate_limit_decisions_total` | Counter | `action`, `outcome` | Rate-limit decisions |
//! | `state_cache_lookups_total` | Counter | `outcome` | Cache hit/miss/error |
//! | `state_tasks_enqueued_total` | Counter | `task_type`, `priority` | Submitted tasks |
//! | `state_connections_active` | Gauge | none | Registered realtime connections |

pub mod metrics;

pub use metrics::init_metrics_recorder;
