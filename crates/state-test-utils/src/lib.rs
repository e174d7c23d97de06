//! Test utilities for the state service
//!
//! Provides a fault-injecting store, an orchestrator harness on manual time,
//! and identity/data fixtures.
//!
//! # Modules
//!
//! - `flaky_store` - `KeyValueStore` wrapper that fails or stalls on demand
//! - `harness` - `TestHarness` with `ManualClock`, `MemoryStore` and `Orchestrator`
//! - `fixtures` - `StaticIdentityProvider`, claims and payload builders
//!
//! # Usage
//!
//! ```rust,ignore
//! use state_test_utils::*;
//!
//! let harness = TestHarness::with_vars(&[("STATE_RATE_LIMIT_REQUESTS", "3")]);
//! let identity = StaticIdentityProvider::new().with_user("a@example.com", "user-a");
//!
//! let issued = harness
//!     .state
//!     .login(&identity, "a@example.com", &password(TEST_PASSWORD), "10.0.0.1")
//!     .await?;
//!
//! harness.store_faults().set_down(true);
//! assert!(!harness.state.authenticate_request(&issued.session_key).await.is_valid());
//! ```

pub mod fixtures;
pub mod flaky_store;
pub mod harness;

pub use fixtures::*;
pub use flaky_store::*;
pub use harness::*;
