//! Periodic maintenance: price finished jobs that still carry no cost and
//! drop expired background-job progress entries.

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::infra::app_state::AppState;

/// Runs one pass; returns how many jobs were priced.
pub async fn run_once(state: &AppState) -> usize {
    let pruned = state.controller.registry().prune();
    if pruned > 0 {
        debug!(pruned, "pruned finished progress entries");
    }

    match state.accountant.sweep_unpriced().await {
        Ok(0) => 0,
        Ok(priced) => {
            info!(priced, "cost sweep priced finished scans");
            priced
        }
        Err(err) => {
            warn!("cost sweep failed: {err}");
            0
        }
    }
}

pub fn spawn_maintenance(state: AppState, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            run_once(&state).await;
        }
    })
}
