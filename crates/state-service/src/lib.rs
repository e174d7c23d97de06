//! State Service Library
//!
//! Shared-state orchestration layer for a web backend. Request handlers use
//! it for:
//!
//! - Sessions with sliding expiry and an absolute ceiling
//! - Per-client fixed-window rate limiting
//! - A read-through cache with explicit invalidation
//! - A priority-ordered background task queue
//! - A registry of live realtime connections
//!
//! All components share one key-value store (Redis in production) through
//! [`store::StoreAdapter`], which owns timeouts, retries and error
//! translation.
//!
//! # Key Design Decisions
//!
//! - **Degrade, don't crash**: session reads and cache reads turn store
//!   failures into "invalid" or "miss"; writes that callers depend on
//!   (session create, enqueue, invalidate) fail loudly
//! - **Explicit failure policy**: the rate limiter and session refresh each
//!   take a [`config::FailurePolicy`]
//! - **Injectable time**: every expiry decision reads a [`clock::Clock`]
//!
//! # Modules
//!
//! - [`store`] - Backend trait, Redis and in-memory backends, adapter
//! - [`session`] - Session manager
//! - [`rate_limit`] - Rate limiter
//! - [`cache`] - Cache manager
//! - [`task_queue`] - Task queue
//! - [`connections`] - Connection registry
//! - [`tasks`] - Background tasks (session sweep)
//! - [`state`] - Orchestrator used by request handlers

pub mod cache;
pub mod clock;
pub mod config;
pub mod connections;
pub mod errors;
pub mod identity;
pub mod observability;
pub mod rate_limit;
pub mod session;
pub mod state;
pub mod store;
pub mod task_queue;
pub mod tasks;
