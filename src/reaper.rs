use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::observability::SESSIONS_ACTIVE;
use crate::session::SessionStore;
use crate::store::Ledger;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Compact once more than `threshold` events were appended since the last compaction.
/// Returns whether a compaction ran.
pub async fn compact_if_needed(ledger: &Ledger, threshold: u64) -> bool {
    let appends = ledger.appends_since_compact().await;
    if appends <= threshold {
        return false;
    }
    match ledger.compact().await {
        Ok(()) => {
            info!(appends, "compacted tenant WAL");
            true
        }
        Err(e) => {
            warn!("compaction failed: {e}");
            false
        }
    }
}

/// Background task that periodically compacts the WAL.
pub async fn run_compactor(ledger: Arc<Ledger>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&ledger, threshold).await;
    }
}

/// Background task that drops expired sessions.
pub async fn run_session_sweeper(tenant: String, sessions: Arc<SessionStore>) {
    let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let removed = sessions.sweep_expired();
        if removed > 0 {
            debug!(tenant = %tenant, removed, remaining = sessions.len(), "swept expired sessions");
        }
        metrics::gauge!(SESSIONS_ACTIVE, "tenant" => tenant.clone()).set(sessions.len() as f64);
    }
}
