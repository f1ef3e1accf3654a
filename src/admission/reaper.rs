//! Periodic eviction of idle client state.

use tokio::sync::broadcast;
use tokio::time::{self, Instant};

use crate::admission::queue::AdmissionQueue;

/// Sweeps the admission queue once per decay window.
pub struct ClientReaper {
    queue: AdmissionQueue,
}

impl ClientReaper {
    pub fn new(queue: AdmissionQueue) -> Self {
        Self { queue }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            window_secs = self.queue.settings().window_secs,
            "Client reaper starting"
        );

        loop {
            // Re-read each round so a reloaded window takes effect.
            let period = self.queue.settings().window();
            tokio::select! {
                _ = time::sleep(period) => {
                    let removed = self.queue.reap_idle(Instant::now());
                    if removed > 0 {
                        tracing::debug!(
                            removed,
                            tracked = self.queue.tracked_clients(),
                            "Reaped idle clients"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Client reaper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
