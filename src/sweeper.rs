//! Background loop that expires pending applications left unanswered too
//! long.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error};

use crate::config::IntakePolicy;
use crate::intake::engine::SessionEngine;

/// Run the expiry sweep on an interval, forever.
///
/// Each tick is independent: a failed sweep is logged and the loop carries on
/// at the next tick. Spawn this as a background task once at startup.
pub async fn expiry_sweep_loop(engine: Arc<SessionEngine>, policy: IntakePolicy) {
    let period = policy
        .sweep_interval
        .to_std()
        .unwrap_or(std::time::Duration::from_secs(30 * 60));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let cutoff = Utc::now() - policy.pending_timeout;
        match engine.expire_stale(cutoff).await {
            Ok(expired) if expired.is_empty() => {
                debug!("Expiry sweep found nothing to do");
            }
            Ok(expired) => {
                debug!("Expiry sweep expired {} application(s)", expired.len());
            }
            Err(e) => {
                error!("Expiry sweep failed: {}", e);
            }
        }
    }
}
