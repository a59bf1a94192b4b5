//! Liveness monitor: degrades and evicts sessions that stop heartbeating.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::activity::ActivityLogger;
use crate::agent::hub::Hub;
use crate::config::MonitorConfig;
use crate::db::ServerStore;
use crate::servers::status;

/// Outcome of one check, for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LivenessReport {
    pub unhealthy: Vec<i64>,
    pub offline: Vec<i64>,
}

pub struct LivenessMonitor {
    hub: Arc<Hub>,
    servers: Arc<dyn ServerStore>,
    activity: Arc<dyn ActivityLogger>,
    config: MonitorConfig,
}

impl LivenessMonitor {
    pub fn new(
        hub: Arc<Hub>,
        servers: Arc<dyn ServerStore>,
        activity: Arc<dyn ActivityLogger>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            hub,
            servers,
            activity,
            config,
        }
    }

    /// Tick every `config.tick` until shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Liveness monitor stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let report = self.check(Instant::now()).await;
                    if !report.offline.is_empty() || !report.unhealthy.is_empty() {
                        tracing::debug!(
                            unhealthy = ?report.unhealthy,
                            offline = ?report.offline,
                            "Liveness check"
                        );
                    }
                }
            }
        }
    }

    /// Classify every session against `now`. Offline sessions are closed
    /// and unregistered; unhealthy ones only get a status update.
    pub async fn check(&self, now: Instant) -> LivenessReport {
        let mut report = LivenessReport::default();

        for session in self.hub.snapshot().await {
            let server_id = session.server_id();
            let elapsed = now.saturating_duration_since(session.last_seen());

            if elapsed > self.config.offline_threshold {
                tracing::info!(server_id, elapsed_secs = elapsed.as_secs(), "Node offline, closing session");
                self.set_status(server_id, status::OFFLINE).await;
                session.close().await;
                self.hub.unregister_if_current(&session).await;
                self.activity
                    .log(
                        server_id,
                        "Agent went offline",
                        &format!("No heartbeat for {}", format_elapsed(elapsed)),
                    )
                    .await;
                report.offline.push(server_id);
            } else if elapsed > self.config.unhealthy_threshold {
                tracing::debug!(server_id, elapsed_secs = elapsed.as_secs(), "Node unhealthy");
                self.set_status(server_id, status::UNHEALTHY).await;
                report.unhealthy.push(server_id);
            }
        }

        report
    }

    async fn set_status(&self, server_id: i64, value: &str) {
        if let Err(e) = self.servers.update_server_status(server_id, value).await {
            tracing::warn!(server_id, status = value, error = %e, "Failed to update node status");
        }
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 60 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}
