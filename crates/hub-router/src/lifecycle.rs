//! Lifecycle Manager - Background tasks for the hub
//!
//! Handles:
//! - Rolling back transactions past their timeout
//! - Periodic snapshots and log compaction
//! - Dropping finished message status after retention
//! - Purging instances that stopped heartbeating
//! - Health reporting and queue depth gauges
//! - Graceful shutdown coordination
//!
//! A zero interval disables the corresponding task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use hub_common::{HealthStatus, Priority};
use hub_config::LifecycleConfig;

use crate::hub::Hub;
use crate::router_metrics;

/// Manages lifecycle tasks for a running hub
pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl LifecycleManager {
    /// Start all lifecycle tasks
    pub fn start(hub: Arc<Hub>, config: LifecycleConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = Vec::new();

        // Transaction timeout sweeper
        tasks.extend(spawn_ticker(
            "transaction sweeper",
            config.transaction_sweep_interval(),
            &shutdown_tx,
            hub.clone(),
            |hub| async move {
                let expired = hub.expire_transactions().await;
                if expired > 0 {
                    info!(expired = expired, "Rolled back timed out transactions");
                }
            },
        ));

        // Snapshot writer
        tasks.extend(spawn_ticker(
            "snapshot writer",
            config.snapshot_interval(),
            &shutdown_tx,
            hub.clone(),
            |hub| async move {
                if let Err(e) = hub.snapshot().await {
                    error!(error = %e, "Periodic snapshot failed");
                }
            },
        ));

        // Log compaction
        tasks.extend(spawn_ticker(
            "compactor",
            config.compaction_interval(),
            &shutdown_tx,
            hub.clone(),
            |hub| async move {
                match hub.compact().await {
                    Ok(report) => debug!(?report, "Compaction pass finished"),
                    Err(e) => warn!(error = %e, "Compaction failed"),
                }
            },
        ));

        // Finished message status cleanup
        tasks.extend(spawn_ticker(
            "status cleanup",
            config.status_cleanup_interval(),
            &shutdown_tx,
            hub.clone(),
            |hub| async move {
                let removed = hub.cleanup_completed();
                if removed > 0 {
                    debug!(removed = removed, "Dropped finished message status");
                }
                let pruned = hub.prune_quotas();
                if pruned > 0 {
                    debug!(destinations = pruned, "Dropped idle quota state");
                }
            },
        ));

        // Expired instance purge
        let heartbeat = hub.config().registry.heartbeat_interval();
        tasks.extend(spawn_ticker(
            "instance purge",
            heartbeat,
            &shutdown_tx,
            hub.clone(),
            |hub| async move {
                let purged = hub.purge_instances();
                if purged > 0 {
                    info!(purged = purged, "Purged unresponsive instances");
                }
            },
        ));

        // Health report logger
        tasks.extend(spawn_ticker(
            "health reporter",
            config.health_report_interval(),
            &shutdown_tx,
            hub,
            |hub| async move {
                let depth = hub.queue_depth();
                for priority in Priority::ALL {
                    router_metrics::set_queue_depth(priority, depth[priority.level()]);
                }

                let report = hub.health_report();
                if report.status != HealthStatus::Healthy {
                    warn!(
                        status = ?report.status,
                        issues = ?report.issues,
                        "Health report"
                    );
                } else {
                    debug!(status = ?report.status, queued = report.queued_messages, "Health report: OK");
                }
            },
        ));

        info!(tasks = tasks.len(), "Lifecycle manager started");

        Self { shutdown_tx, tasks }
    }

    /// Signal shutdown to all lifecycle tasks and wait for them
    pub async fn shutdown(self) {
        info!("Lifecycle manager shutting down...");
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

fn spawn_ticker<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown_tx: &broadcast::Sender<()>,
    hub: Arc<Hub>,
    tick: F,
) -> Option<JoinHandle<()>>
where
    F: Fn(Arc<Hub>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if period.is_zero() {
        debug!(task = name, "Lifecycle task disabled");
        return None;
    }
    let mut shutdown_rx = shutdown_tx.subscribe();

    Some(tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tick(hub.clone()).await;
                }
                _ = shutdown_rx.recv() => {
                    info!(task = name, "Lifecycle task shutting down");
                    break;
                }
            }
        }
    }))
}
