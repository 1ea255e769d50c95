//! Background purge of expired room tickets.
//!
//! Consumed tickets are deleted on use; this only collects grants that were
//! never redeemed.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::access::AccessDirectory;

/// Spawn the ticket sweeper. Returns a handle for shutdown.
pub fn spawn_ticket_sweeper(directory: Arc<dyn AccessDirectory>, every: Duration) -> JoinHandle<()> {
    info!(interval_secs = every.as_secs(), "ticket sweeper configured");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sweep_once(directory.as_ref()).await;
        }
    })
}

pub(crate) async fn sweep_once(directory: &dyn AccessDirectory) -> u64 {
    match directory.purge_expired_tickets().await {
        Ok(0) => 0,
        Ok(purged) => {
            info!(purged, "expired room tickets purged");
            purged
        }
        Err(e) => {
            warn!(error = %e, "room ticket purge failed");
            0
        }
    }
}

#[cfg(test)]
#[path = "sweeper_test.rs"]
mod tests;
