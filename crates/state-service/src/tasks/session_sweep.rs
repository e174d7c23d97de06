//! Session sweep background task.
//!
//! Periodically runs [`SessionManager::sweep_expired`] to drop orphaned index
//! entries and expired records the store has not evicted.
//!
//! # Graceful Shutdown
//!
//! The task exits when its cancellation token is triggered. A sweep already
//! in progress runs to completion first; each of its steps is an independent
//! single-key operation, so stopping between steps leaves nothing half done.

use crate::session::SessionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Run the sweep loop until `cancel_token` is cancelled.
#[instrument(skip_all, name = "state.task.session_sweep")]
pub async fn run_session_sweep(
    manager: Arc<SessionManager>,
    sweep_interval: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "state.task.session_sweep",
        interval_seconds = sweep_interval.as_secs(),
        "Starting session sweep task"
    );

    let mut interval = tokio::time::interval(sweep_interval);
    // A slow sweep must not be followed by a burst of catch-up runs
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match manager.sweep_expired().await {
                    Ok(report) if report.skipped => {}
                    Ok(report) => {
                        if report.removed() > 0 || report.errors > 0 {
                            warn!(
                                target: "state.task.session_sweep",
                                orphans_removed = report.orphans_removed,
                                expired_removed = report.expired_removed,
                                errors = report.errors,
                                "Session sweep removed stale entries"
                            );
                        }
                    }
                    Err(e) => {
                        // Log error but continue - store might recover
                        error!(
                            target: "state.task.session_sweep",
                            error = %e,
                            "Session sweep failed"
                        );
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                info!(
                    target: "state.task.session_sweep",
                    "Session sweep task received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(target: "state.task.session_sweep", "Session sweep task stopped");
}

/// Handle to a running sweep task.
#[derive(Debug)]
pub struct SessionSweeper {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl SessionSweeper {
    /// Spawn the sweep loop.
    ///
    /// The task uses a child of `parent_token`, so cancelling the parent
    /// stops it too.
    pub fn start(
        manager: Arc<SessionManager>,
        sweep_interval: Duration,
        parent_token: &CancellationToken,
    ) -> Self {
        let cancel_token = parent_token.child_token();
        let handle = tokio::spawn(run_session_sweep(
            manager,
            sweep_interval,
            cancel_token.clone(),
        ));
        Self {
            cancel_token,
            handle,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn stop(self) {
        self.cancel_token.cancel();
        if let Err(e) = self.handle.await {
            error!(
                target: "state.task.session_sweep",
                error = %e,
                "Session sweep task ended abnormally"
            );
        }
    }
}
