// Copyright 2026 Penne Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Replication health.
//!
//! Health is judged from the checkpoint alone: replication is healthy when
//! the last confirmed checkpoint is no older than the staleness threshold
//! (five minutes by default). Missing checkpoints are unhealthy. Source and
//! target connectivity is reported alongside but does not decide the verdict.
//!
//! The monitor reads the checkpoint store and pings both sides; it shares no
//! state with the replication loop.

use crate::alert::AlertSink;
use crate::metrics;
use crate::state::{Checkpoint, CheckpointStore};
use crate::stream::ChangeFeed;
use crate::target::Target;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// Replication progress part of a [`HealthReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationStatus {
    /// Timestamp of the last confirmed checkpoint
    pub last_checkpoint: Option<DateTime<Utc>>,

    /// Whole seconds since that checkpoint
    pub seconds_behind: Option<i64>,
}

/// Result of one health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Whether replication is keeping up
    pub healthy: bool,

    /// `"connected"` or `"error: ..."`
    pub source_status: String,

    /// `"connected"` or `"error: ..."`
    pub target_status: String,

    /// Checkpoint age
    pub replication: ReplicationStatus,
}

/// Status string for a connectivity probe.
pub fn connection_status<E: Display>(result: &Result<(), E>) -> String {
    match result {
        Ok(()) => "connected".to_string(),
        Err(e) => format!("error: {e}"),
    }
}

/// Judges replication progress from the last checkpoint.
///
/// Healthy exactly when a checkpoint exists and `now - timestamp` does not
/// exceed `threshold`.
pub fn evaluate(
    checkpoint: Option<&Checkpoint>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> (bool, ReplicationStatus) {
    let Some(checkpoint) = checkpoint else {
        return (
            false,
            ReplicationStatus {
                last_checkpoint: None,
                seconds_behind: None,
            },
        );
    };

    let seconds_behind = checkpoint.seconds_behind(now);
    let limit = i64::try_from(threshold.as_secs()).unwrap_or(i64::MAX);

    (
        seconds_behind <= limit,
        ReplicationStatus {
            last_checkpoint: Some(checkpoint.timestamp),
            seconds_behind: Some(seconds_behind),
        },
    )
}

/// Periodic and on-demand health checker.
pub struct HealthMonitor<F, T, S>
where
    F: ChangeFeed + ?Sized,
    T: Target + ?Sized,
    S: CheckpointStore + ?Sized,
{
    source: Arc<F>,
    target: Arc<T>,
    store: Arc<S>,
    checkpoint_key: String,
    threshold: Duration,
}

impl<F, T, S> HealthMonitor<F, T, S>
where
    F: ChangeFeed + ?Sized,
    T: Target + ?Sized,
    S: CheckpointStore + ?Sized,
{
    /// Creates a monitor for the checkpoint stored under `checkpoint_key`.
    pub fn new(
        source: Arc<F>,
        target: Arc<T>,
        store: Arc<S>,
        checkpoint_key: impl Into<String>,
        threshold: Duration,
    ) -> Self {
        Self {
            source,
            target,
            store,
            checkpoint_key: checkpoint_key.into(),
            threshold,
        }
    }

    /// Runs one check.
    ///
    /// Never fails: unreachable stores are reported in the status strings,
    /// and an unreadable checkpoint counts as missing.
    #[instrument(skip(self), fields(checkpoint = %self.checkpoint_key))]
    pub async fn check(&self) -> HealthReport {
        let source_status = connection_status(&self.source.ping().await);
        let target_status = connection_status(&self.target.ping().await);

        let checkpoint = match self.store.load(&self.checkpoint_key).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!(error = %e, "Failed to read checkpoint for health check");
                None
            }
        };

        let (healthy, replication) = evaluate(checkpoint.as_ref(), Utc::now(), self.threshold);
        metrics::set_health(healthy, replication.seconds_behind);

        HealthReport {
            healthy,
            source_status,
            target_status,
            replication,
        }
    }

    /// Checks every `period` until shutdown, alerting on unhealthy results.
    pub async fn run_periodic(
        &self,
        period: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
        alerts: AlertSink,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period = ?period, "Health monitor started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Health monitor stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let report = self.check().await;
                    if report.healthy {
                        debug!(seconds_behind = ?report.replication.seconds_behind, "Replication healthy");
                    } else {
                        warn!(
                            seconds_behind = ?report.replication.seconds_behind,
                            source = %report.source_status,
                            target = %report.target_status,
                            "Replication unhealthy"
                        );
                        alerts.alert("Replication unhealthy", describe(&report));
                    }
                }
            }
        }
    }
}

fn describe(report: &HealthReport) -> String {
    let progress = match (report.replication.last_checkpoint, report.replication.seconds_behind) {
        (Some(at), Some(behind)) => format!("last checkpoint {at} ({behind}s behind)"),
        _ => "no checkpoint recorded".to_string(),
    };
    format!(
        "{progress}; source {}; target {}",
        report.source_status, report.target_status
    )
}
