use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SweeperConfig;
use crate::store::SessionStore;

/// Periodically expires idle sessions and purges old tombstones until
/// `cancel` fires.
pub fn spawn_sweeper(
    store: Arc<SessionStore>,
    config: SweeperConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so startup is quiet.
        ticker.tick().await;

        tracing::debug!(
            interval_secs = config.interval.as_secs(),
            max_idle_secs = config.max_idle.as_secs(),
            "session sweeper started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    store.expire_stale(Utc::now(), config.max_idle).await;
                }
            }
        }

        tracing::debug!("session sweeper stopped");
    })
}
