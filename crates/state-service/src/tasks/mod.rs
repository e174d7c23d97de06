//! Background tasks.
//!
//! # Tasks
//!
//! - `session_sweep` - Reconciles session indexes and drops expired sessions

pub mod session_sweep;

pub use session_sweep::{run_session_sweep, SessionSweeper};
