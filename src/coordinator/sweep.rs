//! Periodic alert sweep
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick / SweepNow → drain monitor → aggregate → history → notifier → (ALERT to nodes) → evict stale
//! ```
//!
//! A drained alert belongs to exactly one sweep, so no alert is delivered twice.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::{debug, error, info, instrument, warn};

use super::{Shared, connection::Outbound};
use crate::{
    alerts::{Alert, aggregate_alerts},
    error::CoordinatorError,
    protocol::{COORDINATOR_ID, Message, Payload},
};

/// What a single sweep did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    /// Alerts taken from the monitor
    pub drained: usize,
    /// Alerts left after aggregation
    pub aggregated: usize,
    /// Successful provider deliveries, summed over all alerts
    pub delivered: usize,
    pub evicted: Vec<String>,
}

#[derive(Debug)]
pub enum SweepCommand {
    SweepNow {
        respond_to: oneshot::Sender<SweepReport>,
    },
    Shutdown,
}

struct SweepActor {
    shared: Arc<Shared>,
    command_rx: mpsc::Receiver<SweepCommand>,
    stop: watch::Receiver<bool>,
    interval: Duration,
}

impl SweepActor {
    #[instrument(skip_all)]
    async fn run(mut self) {
        debug!("starting sweep task with interval {:?}", self.interval);

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.stop.changed() => {
                    debug!("stop signal received");
                    break;
                }

                _ = ticker.tick() => {
                    sweep(&self.shared).await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        SweepCommand::SweepNow { respond_to } => {
                            debug!("received SweepNow command");
                            let report = sweep(&self.shared).await;
                            let _ = respond_to.send(report);
                        }
                        SweepCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("sweep task stopped");
    }
}

/// Run one sweep against the coordinator state
pub(crate) async fn sweep(shared: &Shared) -> SweepReport {
    let drained = shared.monitor.lock().await.drain_alerts();
    let drained_count = drained.len();
    let aggregated = aggregate_alerts(drained);

    let mut report = SweepReport {
        drained: drained_count,
        aggregated: aggregated.len(),
        ..SweepReport::default()
    };

    for alert in &aggregated {
        if let Some(history) = &shared.history {
            if let Err(e) = history.append(alert).await {
                error!("failed to record alert in history: {e}");
            }
        }

        let results = shared.notifier.notify(alert).await;
        report.delivered += results.iter().filter(|delivered| **delivered).count();

        if shared.config.push_alerts_to_nodes {
            push_to_nodes(shared, alert).await;
        }
    }

    report.evicted = shared
        .registry
        .evict_stale(Utc::now(), shared.config.stale_threshold)
        .await;

    if report.drained > 0 || !report.evicted.is_empty() {
        info!(
            "sweep: {} alerts drained, {} after aggregation, {} evicted",
            report.drained,
            report.aggregated,
            report.evicted.len()
        );
    }
    report
}

async fn push_to_nodes(shared: &Shared, alert: &Alert) {
    for node_id in &alert.nodes {
        let Some(sender) = shared.registry.sender(node_id).await else {
            debug!("cannot push alert to {node_id}: not connected");
            continue;
        };

        let message = Message::new(
            COORDINATOR_ID,
            node_id.clone(),
            Payload::Alert {
                alert: alert.clone(),
            },
        );
        if let Err(e) = sender.try_send(Outbound::message(message)) {
            warn!("could not queue alert for {node_id}: {e}");
        }
    }
}

/// Handle for controlling the sweep task
pub struct SweepHandle {
    sender: mpsc::Sender<SweepCommand>,
    task: JoinHandle<()>,
}

impl SweepHandle {
    pub(crate) fn spawn(
        shared: Arc<Shared>,
        interval: Duration,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let (sender, command_rx) = mpsc::channel(8);
        let actor = SweepActor {
            shared,
            command_rx,
            stop,
            interval,
        };

        Self {
            sender,
            task: tokio::spawn(actor.run()),
        }
    }

    /// Sweep immediately instead of waiting for the next tick
    pub async fn sweep_now(&self) -> Result<SweepReport, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SweepCommand::SweepNow { respond_to: tx })
            .await
            .map_err(|_| CoordinatorError::SweepStopped)?;
        rx.await.map_err(|_| CoordinatorError::SweepStopped)
    }

    pub async fn shutdown(self) {
        // the task may already have stopped through the watch signal
        let _ = self.sender.send(SweepCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            error!("sweep task ended abnormally: {e}");
        }
    }
}
