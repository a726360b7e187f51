//! Periodic health sweep over attached relayers and cluster rows.

use tokio_util::sync::CancellationToken;

use crate::clusters;
use crate::error::ControlError;
use crate::models::{ClusterStatus, now_ms};
use crate::state::AppState;

pub async fn run_health_monitor(state: AppState, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(state.config.sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so a restart does not
    // sweep before sessions had a chance to re-attach.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("health monitor stopped");
                return;
            }
            _ = interval.tick() => {}
        }
        sweep(&state).await;
    }
}

/// One sweep. Idempotent; safe against concurrent attach/detach because
/// every registry mutation goes through handle equality.
pub async fn sweep(state: &AppState) {
    let now = now_ms();
    let stale_ms = state.config.stale_threshold.as_millis() as i64;
    let idle_ms = state.config.idle_timeout.as_millis() as i64;

    for (cluster_id, heartbeat_ms) in state.registry.snapshot() {
        let Some(conn) = state.registry.lookup(cluster_id) else {
            continue; // detached between snapshot and lookup
        };

        let heartbeat_age = now - heartbeat_ms;
        let idle_age = now - conn.activity_ms();

        if is_expired(heartbeat_age, stale_ms) {
            tracing::warn!(
                %cluster_id,
                heartbeat_age_ms = heartbeat_age,
                "heartbeat stale; force-detaching relayer"
            );
            force_detach(state, cluster_id, &conn).await;
        } else if is_expired(idle_age, idle_ms) {
            tracing::warn!(
                %cluster_id,
                idle_age_ms = idle_age,
                "session made no progress; force-detaching relayer"
            );
            force_detach(state, cluster_id, &conn).await;
        }
    }

    // Rows still ACTIVE in storage whose stream vanished without a clean
    // detach (crash, partition) reconcile to INACTIVE after 2x the
    // threshold.
    match clusters::stale_active_clusters(&state.pool, now - 2 * stale_ms).await {
        Ok(ids) => {
            for cluster_id in ids {
                if state.registry.lookup(cluster_id).is_some() {
                    continue;
                }
                tracing::warn!(%cluster_id, "reconciling orphaned ACTIVE cluster to INACTIVE");
                if let Err(e) =
                    clusters::set_status(&state.pool, cluster_id, ClusterStatus::Inactive).await
                {
                    tracing::warn!(?e, %cluster_id, "failed to reconcile cluster status");
                }
            }
        }
        Err(e) => tracing::warn!(?e, "failed to scan for orphaned clusters"),
    }
}

async fn force_detach(
    state: &AppState,
    cluster_id: uuid::Uuid,
    conn: &std::sync::Arc<crate::registry::ClusterConnection>,
) {
    conn.close(ControlError::IdleTimeout);
    let removed = state.registry.unregister(cluster_id, conn);
    if removed && state.registry.lookup(cluster_id).is_none() {
        if let Err(e) = clusters::set_status(&state.pool, cluster_id, ClusterStatus::Inactive).await
        {
            tracing::warn!(?e, %cluster_id, "failed to deactivate stale cluster");
        }
    }
}

/// An age exactly at the threshold is still healthy; strictly past it
/// is not.
fn is_expired(age_ms: i64, threshold_ms: i64) -> bool {
    age_ms > threshold_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_at_threshold_is_healthy() {
        assert!(!is_expired(120_000, 120_000));
        assert!(is_expired(120_001, 120_000));
        assert!(!is_expired(0, 120_000));
        // Clock skew making the age negative never detaches.
        assert!(!is_expired(-5, 120_000));
    }
}
