use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::services::lifecycle::Engine;

/// Intervals and thresholds for the two background janitors.
#[derive(Debug, Clone, Copy)]
pub struct JanitorSettings {
    pub interval: Duration,
    pub purge_older_than_days: i64,
}

/// Periodically warn and auto-fail stale running tasks.
///
/// Each tick runs to completion before the next is scheduled; a failed tick
/// (typically a transient Busy) is logged and retried on the next one.
/// Cancellation finishes the in-flight tick and starts no more.
pub async fn run_stale_janitor(engine: Engine, settings: JanitorSettings, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match engine.stale_tick().await {
                    Ok(outcome) if outcome.warned > 0 || outcome.auto_failed > 0 => {
                        tracing::info!(
                            warned = outcome.warned,
                            auto_failed = outcome.auto_failed,
                            "stale janitor pass"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("stale janitor tick failed: {e}"),
                }
            }
        }
    }
    tracing::debug!("stale janitor stopped");
}

/// Periodically drop terminal tasks older than the configured window.
pub async fn run_purge_janitor(engine: Engine, settings: JanitorSettings, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match engine.purge_tick(settings.purge_older_than_days).await {
                    Ok(0) => {}
                    Ok(purged) => tracing::info!(purged, "purge janitor pass"),
                    Err(e) => tracing::warn!("purge janitor tick failed: {e}"),
                }
            }
        }
    }
    tracing::debug!("purge janitor stopped");
}
