//! Reachability signal for the sync engine.
//!
//! Polls the server's health endpoint and publishes the result on a `watch`
//! channel. Only changes are published, so receivers see one edge per
//! transition.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::http::HttpRemote;

/// Starts polling in the background. The signal starts out `false` and the
/// task stops once every receiver is gone.
pub fn spawn_monitor(
    remote: HttpRemote,
    interval: Duration,
) -> (watch::Receiver<bool>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        loop {
            let online = remote.check_health().await;
            let changed = tx.send_if_modified(|current| {
                if *current == online {
                    false
                } else {
                    *current = online;
                    true
                }
            });
            if changed {
                debug!(online, server = remote.server_url(), "Reachability changed");
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = tx.closed() => break,
            }
        }
    });

    (rx, handle)
}
