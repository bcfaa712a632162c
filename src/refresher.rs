//! Periodic refresh of the provider's cached on-chain payment state.

use crate::provider::PaymentParamsProvider;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Spawns a task calling [`PaymentParamsProvider::refresh_onchain_state`]
/// every `interval` until `shutdown` flips to `true` or its sender is dropped.
///
/// A failed refresh is logged and the previous cached state stays in use
/// until the next successful tick.
pub fn spawn_refresher(
    provider: Arc<dyn PaymentParamsProvider>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_ms = interval.as_millis() as u64,
            "payment state refresher started"
        );
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            match provider.refresh_onchain_state().await {
                Ok(()) => debug!("payment state refreshed"),
                Err(err) => warn!(error = %err, "payment state refresh failed"),
            }
        }
        info!("payment state refresher stopped");
    })
}
