//! Background tasks for the issuer server.
//!
//! Includes:
//! - Sweeping expired QR payloads and auth sessions.

use crate::AppState;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, MissedTickBehavior};

/// Drops expired entries from the QR store and the session store every
/// `interval` until `shutdown` flips to `true` or its sender drops.
pub async fn start_sweeper_task(
    state: Arc<AppState>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    if interval.is_zero() {
        tracing::warn!("ttl sweeper disabled (interval=0)");
        return;
    }
    tracing::info!(interval_secs = interval.as_secs(), "starting ttl sweeper");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let qr = state.claims.qr_store().sweep();
                let sessions = state.sessions.sweep();
                if qr + sessions > 0 {
                    tracing::debug!(qr, sessions, "swept expired entries");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("ttl sweeper stopped");
}
