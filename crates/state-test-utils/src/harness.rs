//! Test harness wiring an `Orchestrator` over an in-memory store.
//!
//! The backend is a [`FlakyStore`] around a `MemoryStore`, both driven by a
//! shared `ManualClock`. Tests advance time with [`TestHarness::advance`]
//! and inject store faults through [`TestHarness::store_faults`].

use crate::flaky_store::FlakyStore;
use chrono::{DateTime, TimeZone, Utc};
use state_service::clock::{Clock, ManualClock};
use state_service::config::Config;
use state_service::state::Orchestrator;
use state_service::store::MemoryStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Variables every harness config starts from. Retries are kept short so
/// failure-path tests finish quickly.
pub const BASE_VARS: &[(&str, &str)] = &[
    ("REDIS_URL", "redis://unused"),
    ("STATE_STORE_TIMEOUT_MS", "200"),
    ("STATE_STORE_MAX_ATTEMPTS", "2"),
    ("STATE_STORE_RETRY_BASE_DELAY_MS", "1"),
    ("STATE_STORE_RETRY_MAX_DELAY_MS", "2"),
];

/// Default start time. On a minute boundary, so rate limit windows begin
/// exactly at the start of each test.
pub fn default_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

/// Build a `Config` from [`BASE_VARS`] plus `overrides`.
pub fn test_config(overrides: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = BASE_VARS
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    for (k, v) in overrides {
        vars.insert((*k).to_string(), (*v).to_string());
    }
    Config::from_vars(&vars).expect("test config should be valid")
}

/// Orchestrator plus handles on its clock and backend.
pub struct TestHarness {
    pub clock: Arc<ManualClock>,
    /// Direct access to stored data, bypassing faults.
    pub memory: MemoryStore,
    pub config: Config,
    pub state: Orchestrator,
    flaky: FlakyStore,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_vars(&[])
    }

    /// Harness with config overrides, e.g. `("STATE_RATE_LIMIT_REQUESTS", "3")`.
    pub fn with_vars(overrides: &[(&str, &str)]) -> Self {
        Self::starting_at(default_start(), overrides)
    }

    pub fn starting_at(start: DateTime<Utc>, overrides: &[(&str, &str)]) -> Self {
        let clock = ManualClock::new(start);
        let memory = MemoryStore::new(clock.clone());
        let flaky = FlakyStore::new(memory.clone());
        let config = test_config(overrides);
        let state = Orchestrator::new(Arc::new(flaky.clone()), clock.clone(), &config);

        Self {
            clock,
            memory,
            config,
            state,
            flaky,
        }
    }

    /// Fault controls for the orchestrator's backend.
    pub fn store_faults(&self) -> &FlakyStore {
        &self.flaky
    }

    /// Move the shared clock forward.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance(Duration::from_secs(secs));
    }

    /// Current time on the shared clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
