//! Periodic sweep removing instances that no longer report connected.

use std::time::Duration;

use dataminer_core::{Error, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::registry::ConversationRegistry;

/// Handle for stopping a running reaper.
pub struct ReaperHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Signal the reaper to stop and wait for it.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send reaper shutdown signal".into()))?;
        self.task
            .await
            .map_err(|e| Error::Internal(format!("reaper task failed: {}", e)))
    }
}

/// Start the reaper. The first sweep runs one `period` after start.
pub fn spawn_reaper(registry: ConversationRegistry, period: Duration) -> ReaperHandle {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    let task = tokio::spawn(async move {
        info!(interval_secs = period.as_secs(), "Reaper started");
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Reaper received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    let reaped = registry.reap().await;
                    if reaped > 0 {
                        info!(reaped, "Reaper removed disconnected instances");
                    } else {
                        debug!("Reaper sweep found nothing to remove");
                    }
                }
            }
        }
    });
    ReaperHandle { shutdown_tx, task }
}
