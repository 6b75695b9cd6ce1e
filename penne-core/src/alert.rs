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

//! Operator alerts.
//!
//! The replicator reports connection failures, stream interruptions, failed
//! batches, failed checkpoint saves and unhealthy checks through an
//! [`AlertSink`]. The sink never blocks the caller: each alert is delivered on
//! its own task and delivery failures are only logged.
//!
//! Transports (email, chat, paging) implement [`Notifier`].
//!
//! ```rust
//! use penne_core::alert::{AlertSink, RecordingNotifier};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let notifier = Arc::new(RecordingNotifier::new());
//! let alerts = AlertSink::new(notifier.clone());
//! alerts.alert("Replication stalled", "no checkpoint for 10 minutes");
//! # }
//! ```

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{error, warn};

use crate::metrics;

/// Alert delivery failed.
#[derive(Debug, Error)]
#[error("alert delivery failed: {0}")]
pub struct AlertError(pub String);

/// Transport that delivers an alert to operators.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one alert.
    async fn notify(&self, subject: &str, message: &str) -> Result<(), AlertError>;
}

/// Notifier that writes alerts to the log at `WARN`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, message: &str) -> Result<(), AlertError> {
        warn!(alert = subject, "{message}");
        Ok(())
    }
}

/// An alert captured by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedAlert {
    /// Alert subject
    pub subject: String,
    /// Alert body
    pub message: String,
}

/// Notifier that keeps every alert in memory, for tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<RecordedAlert>>,
    fail: bool,
}

impl RecordingNotifier {
    /// Creates a recorder that accepts every alert.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a recorder that records, then reports a delivery failure.
    pub fn failing() -> Self {
        Self {
            alerts: Mutex::default(),
            fail: true,
        }
    }

    /// Alerts received so far.
    pub fn alerts(&self) -> Vec<RecordedAlert> {
        self.alerts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of alerts whose subject contains `needle`.
    pub fn count_matching(&self, needle: &str) -> usize {
        self.alerts()
            .iter()
            .filter(|a| a.subject.contains(needle))
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, subject: &str, message: &str) -> Result<(), AlertError> {
        self.alerts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedAlert {
                subject: subject.to_string(),
                message: message.to_string(),
            });
        if self.fail {
            return Err(AlertError("recording notifier configured to fail".into()));
        }
        Ok(())
    }
}

/// Fire-and-forget front end for a [`Notifier`].
#[derive(Clone)]
pub struct AlertSink {
    notifier: Arc<dyn Notifier>,
    prefix: Option<String>,
}

impl AlertSink {
    /// Wraps `notifier`.
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            prefix: None,
        }
    }

    /// Sink that only logs.
    pub fn log_only() -> Self {
        Self::new(Arc::new(LogNotifier))
    }

    /// Prefixes every subject, e.g. with the replicated namespace.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Raises an alert without waiting for delivery.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn alert(&self, subject: impl Into<String>, message: impl Into<String>) {
        let subject = match &self.prefix {
            Some(prefix) => format!("[{prefix}] {}", subject.into()),
            None => subject.into(),
        };
        let message = message.into();
        let notifier = Arc::clone(&self.notifier);

        metrics::increment_alerts();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&subject, &message).await {
                metrics::increment_alert_failures();
                error!(subject = %subject, error = %e, "Failed to deliver alert");
            }
        });
    }
}

impl std::fmt::Debug for AlertSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertSink")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn alert_is_delivered_with_prefix() {
        let notifier = Arc::new(RecordingNotifier::new());
        let sink = AlertSink::new(notifier.clone()).with_prefix("shop.orders");

        sink.alert("Change feed interrupted", "connection reset");
        settle().await;

        assert_eq!(
            notifier.alerts(),
            vec![RecordedAlert {
                subject: "[shop.orders] Change feed interrupted".into(),
                message: "connection reset".into(),
            }]
        );
    }

    #[tokio::test]
    async fn delivery_failure_does_not_reach_caller() {
        let notifier = Arc::new(RecordingNotifier::failing());
        let sink = AlertSink::new(notifier.clone());

        sink.alert("Batch apply failed", "target down");
        settle().await;

        assert_eq!(notifier.count_matching("Batch apply"), 1);
    }
}
