//! Liveness sweep
//!
//! Every tick each connection is either probed or evicted. A probe clears
//! the connection's alive flag and sends a ping; a pong sets the flag again.
//! A connection still flagged dead at the next tick has missed two
//! consecutive probes and is terminated.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{Hub, Outbound, SendError};

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections sent a fresh probe
    pub probed: usize,
    /// Connections terminated and unregistered
    pub evicted: usize,
}

impl Hub {
    /// Run one probe-and-evict pass over a snapshot of the registry
    pub fn sweep(&self) -> SweepReport {
        let snapshot = self.state.read().snapshot_all();
        let mut report = SweepReport::default();

        for handle in &snapshot {
            if !handle.take_alive() {
                warn!(
                    "Evicting {} ({}): missed two liveness probes",
                    handle.id(),
                    handle.addr()
                );
                handle.terminate();
                self.unregister(handle.id());
                if let Some(ref m) = self.metrics {
                    m.liveness_evicted();
                }
                report.evicted += 1;
                continue;
            }

            match handle.send(Outbound::Ping) {
                Ok(()) => report.probed += 1,
                Err(SendError::Closed) => {}
                Err(SendError::Full) => {
                    warn!("Outbound queue full for {}, cannot probe", handle.id());
                    handle.terminate();
                    self.unregister(handle.id());
                    if let Some(ref m) = self.metrics {
                        m.delivery_dropped("queue_full");
                    }
                    report.evicted += 1;
                }
            }
        }

        report
    }
}

/// Spawn the periodic sweep. The task ends when `shutdown` fires or its
/// sender is dropped.
pub fn spawn_liveness_supervisor(
    hub: Arc<Hub>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // First sweep one full interval after start
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                result = shutdown.recv() => {
                    match result {
                        Ok(()) => break,
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
                _ = ticker.tick() => {
                    let report = hub.sweep();
                    if report.evicted > 0 {
                        info!(
                            "Liveness sweep: probed {}, evicted {}",
                            report.probed, report.evicted
                        );
                    } else {
                        debug!("Liveness sweep: probed {}", report.probed);
                    }
                }
            }
        }

        debug!("Liveness supervisor stopped");
    })
}
