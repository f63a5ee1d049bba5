use crate::config::NetworkConfig;
use crate::discovery::{broadcast, DiscoveryMessage};
use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Who this node announces itself as.
#[derive(Debug, Clone)]
pub(crate) struct AnnouncedIdentity {
    pub(crate) node_id: String,
    pub(crate) rpc_address: String,
    pub(crate) cluster_name: String,
}

/// Broadcasts a fresh announcement every `interval` until `shutdown` is cancelled. Send failures
/// are logged and the next tick tries again.
pub(crate) async fn run_announcer(
    logger: slog::Logger,
    config: NetworkConfig,
    identity: AnnouncedIdentity,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                slog::debug!(logger, "Announcer stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        let message = DiscoveryMessage::new(&identity.node_id, &identity.rpc_address, &identity.cluster_name);
        match broadcast(&config, &message).await {
            Ok(()) => consecutive_failures = 0,
            Err(e) => {
                consecutive_failures += 1;
                // Only the first of a streak is worth a warning.
                if consecutive_failures == 1 {
                    slog::warn!(logger, "Failed to broadcast announcement: {:?}", e);
                } else {
                    slog::debug!(logger, "Failed to broadcast announcement ({} in a row): {:?}", consecutive_failures, e);
                }
            }
        }
    }
}
