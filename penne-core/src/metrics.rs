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

//! Metrics instrumentation for replication observability.
//!
//! Uses the `metrics` crate facade; installing an exporter (Prometheus,
//! StatsD, ...) is left to the embedding binary. Without a recorder every call
//! is a no-op.
//!
//! # Naming
//!
//! Prometheus conventions: underscores, unit suffix, `penne_` prefix, and
//! counters ending in `_total`.
//!
//! # Labels
//!
//! - **collection**: source namespace (`db.coll`)
//! - **operation**: `insert` or `update`
//! - **target_type**: target identifier such as `mongodb`
//! - **error_type**: fixed error category
//!
//! Never label with document ids, tokens or error messages.
//!
//! # Examples
//!
//! ```rust
//! use penne_core::metrics;
//! use std::time::Instant;
//!
//! metrics::increment_events_received("shop.orders", "insert");
//!
//! let start = Instant::now();
//! // ... apply a batch ...
//! metrics::record_batch_duration(start.elapsed().as_secs_f64(), "shop.orders");
//! ```

use crate::pipeline::ReplicatorState;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Change events received from the feed.
///
/// Type: Counter
/// Labels: collection, operation
#[doc(hidden)]
pub const EVENTS_RECEIVED_TOTAL: &str = "penne_events_received_total";

/// Upserts confirmed by the target.
///
/// Type: Counter
/// Labels: collection, operation
#[doc(hidden)]
pub const UPSERTS_TOTAL: &str = "penne_upserts_total";

/// Individual upserts rejected by the target.
///
/// Type: Counter
/// Labels: collection
const UPSERT_ERRORS_TOTAL: &str = "penne_upsert_errors_total";

/// Batches applied to the target.
///
/// Type: Counter
/// Labels: target_type
const BATCHES_APPLIED_TOTAL: &str = "penne_batches_applied_total";

/// Batches that failed as a whole.
///
/// Type: Counter
/// Labels: target_type, error_type
const BATCH_FAILURES_TOTAL: &str = "penne_batch_failures_total";

/// Events per flushed batch, before collapse.
///
/// Type: Histogram
/// Labels: collection
const BATCH_SIZE: &str = "penne_batch_size";

/// Documents written per batch, after collapse.
///
/// Type: Histogram
/// Labels: collection
const COLLAPSED_BATCH_SIZE: &str = "penne_collapsed_batch_size";

/// Time to apply one batch.
///
/// Type: Histogram
/// Labels: collection
/// Unit: seconds
#[doc(hidden)]
pub const BATCH_DURATION_SECONDS: &str = "penne_batch_duration_seconds";

/// Checkpoints persisted.
///
/// Type: Counter
const CHECKPOINT_SAVES_TOTAL: &str = "penne_checkpoint_saves_total";

/// Checkpoint saves that failed.
///
/// Type: Counter
const CHECKPOINT_FAILURES_TOTAL: &str = "penne_checkpoint_failures_total";

/// Change feed reconnects.
///
/// Type: Counter
/// Labels: error_type
const RECONNECTS_TOTAL: &str = "penne_reconnects_total";

/// Delay between an operation on the source and its receipt.
///
/// Type: Histogram
/// Labels: collection
/// Unit: seconds
const CHANGE_FEED_LAG_SECONDS: &str = "penne_change_feed_lag_seconds";

/// Events buffered awaiting flush.
///
/// Type: Gauge
/// Labels: collection
const BUFFERED_EVENTS: &str = "penne_buffered_events";

/// Replicator state (see [`ReplicatorState::as_gauge`]).
///
/// Type: Gauge
#[doc(hidden)]
pub const REPLICATOR_STATE: &str = "penne_replicator_state";

/// Seconds since the last checkpoint, as seen by the health monitor.
///
/// Type: Gauge
const SECONDS_BEHIND: &str = "penne_seconds_behind";

/// 1 when the last health check passed, 0 otherwise.
///
/// Type: Gauge
const HEALTHY: &str = "penne_healthy";

/// Alerts handed to the notifier.
///
/// Type: Counter
const ALERTS_TOTAL: &str = "penne_alerts_total";

/// Notifier calls that failed.
///
/// Type: Counter
const ALERT_FAILURES_TOTAL: &str = "penne_alert_failures_total";

/// Checkpoint lock acquisitions.
///
/// Type: Counter
const LOCK_ACQUISITIONS_TOTAL: &str = "penne_lock_acquisitions_total";

/// Checkpoint locks lost to expiry or another owner.
///
/// Type: Counter
const LOCKS_LOST_TOTAL: &str = "penne_locks_lost_total";

/// Checkpoint locks released on shutdown.
///
/// Type: Counter
const LOCKS_RELEASED_TOTAL: &str = "penne_locks_released_total";

/// Registers descriptions for all metrics.
///
/// Call once after installing a recorder.
pub fn init_metrics() {
    describe_counter!(
        EVENTS_RECEIVED_TOTAL,
        "Total number of change events received from the change feed"
    );
    describe_counter!(UPSERTS_TOTAL, "Total number of upserts confirmed by the target");
    describe_counter!(
        UPSERT_ERRORS_TOTAL,
        "Total number of individual upserts rejected by the target"
    );
    describe_counter!(
        BATCHES_APPLIED_TOTAL,
        "Total number of batches applied to the target"
    );
    describe_counter!(
        BATCH_FAILURES_TOTAL,
        "Total number of batches that failed as a whole"
    );
    describe_counter!(CHECKPOINT_SAVES_TOTAL, "Total number of checkpoints persisted");
    describe_counter!(
        CHECKPOINT_FAILURES_TOTAL,
        "Total number of checkpoint saves that failed"
    );
    describe_counter!(RECONNECTS_TOTAL, "Total number of change feed reconnects");
    describe_counter!(ALERTS_TOTAL, "Total number of alerts raised");
    describe_counter!(ALERT_FAILURES_TOTAL, "Total number of alerts the notifier failed to deliver");
    describe_counter!(
        LOCK_ACQUISITIONS_TOTAL,
        "Total number of checkpoint lock acquisitions"
    );
    describe_counter!(
        LOCKS_LOST_TOTAL,
        "Total number of checkpoint locks lost (expired or taken by another instance)"
    );
    describe_counter!(
        LOCKS_RELEASED_TOTAL,
        "Total number of checkpoint locks released gracefully"
    );

    describe_histogram!(
        BATCH_SIZE,
        metrics::Unit::Count,
        "Events per flushed batch, before per-document collapse"
    );
    describe_histogram!(
        COLLAPSED_BATCH_SIZE,
        metrics::Unit::Count,
        "Documents written per batch, after per-document collapse"
    );
    describe_histogram!(
        BATCH_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Time taken to apply one batch to the target"
    );
    describe_histogram!(
        CHANGE_FEED_LAG_SECONDS,
        metrics::Unit::Seconds,
        "Time between the source operation and its receipt from the change feed"
    );

    describe_gauge!(
        BUFFERED_EVENTS,
        metrics::Unit::Count,
        "Events buffered awaiting flush"
    );
    describe_gauge!(
        REPLICATOR_STATE,
        "Replicator state: 0=stopped, 1=starting, 2=streaming, 3=reconnecting, 4=draining"
    );
    describe_gauge!(
        SECONDS_BEHIND,
        metrics::Unit::Seconds,
        "Seconds since the last persisted checkpoint"
    );
    describe_gauge!(HEALTHY, "1 when the last health check passed, 0 otherwise");
}

/// Counts one event received from the feed.
pub fn increment_events_received(collection: &str, operation: &str) {
    counter!(EVENTS_RECEIVED_TOTAL, "collection" => collection.to_string(), "operation" => operation.to_string())
        .increment(1);
}

/// Counts confirmed upserts.
pub fn increment_upserts(count: u64, collection: &str, operation: &str) {
    if count == 0 {
        return;
    }
    counter!(UPSERTS_TOTAL, "collection" => collection.to_string(), "operation" => operation.to_string())
        .increment(count);
}

/// Counts individually rejected upserts.
pub fn increment_upsert_errors(count: u64, collection: &str) {
    if count == 0 {
        return;
    }
    counter!(UPSERT_ERRORS_TOTAL, "collection" => collection.to_string()).increment(count);
}

/// Counts one applied batch.
pub fn increment_batches_applied(target_type: &str) {
    counter!(BATCHES_APPLIED_TOTAL, "target_type" => target_type.to_string()).increment(1);
}

/// Counts one batch that failed as a whole.
pub fn increment_batch_failures(target_type: &str, error_category: ErrorCategory) {
    counter!(
        BATCH_FAILURES_TOTAL,
        "target_type" => target_type.to_string(),
        "error_type" => error_category.as_str()
    )
    .increment(1);
}

/// Records the event count of a flushed batch.
pub fn record_batch_size(size: usize, collection: &str) {
    histogram!(BATCH_SIZE, "collection" => collection.to_string()).record(size as f64);
}

/// Records the document count of a collapsed batch.
pub fn record_collapsed_batch_size(size: usize, collection: &str) {
    histogram!(COLLAPSED_BATCH_SIZE, "collection" => collection.to_string()).record(size as f64);
}

/// Records how long a batch took to apply.
pub fn record_batch_duration(duration_seconds: f64, collection: &str) {
    histogram!(BATCH_DURATION_SECONDS, "collection" => collection.to_string())
        .record(duration_seconds);
}

/// Counts one persisted checkpoint.
pub fn increment_checkpoint_saves() {
    counter!(CHECKPOINT_SAVES_TOTAL).increment(1);
}

/// Counts one failed checkpoint save.
pub fn increment_checkpoint_failures() {
    counter!(CHECKPOINT_FAILURES_TOTAL).increment(1);
}

/// Counts one change feed reconnect.
pub fn increment_reconnects(error_category: ErrorCategory) {
    counter!(RECONNECTS_TOTAL, "error_type" => error_category.as_str()).increment(1);
}

/// Records the lag of a received event.
pub fn record_change_feed_lag(lag: Duration, collection: &str) {
    histogram!(CHANGE_FEED_LAG_SECONDS, "collection" => collection.to_string())
        .record(lag.as_secs_f64());
}

/// Sets the number of buffered events.
pub fn set_buffered_events(size: usize, collection: &str) {
    gauge!(BUFFERED_EVENTS, "collection" => collection.to_string()).set(size as f64);
}

/// Publishes the replicator state.
pub fn set_replicator_state(state: ReplicatorState) {
    gauge!(REPLICATOR_STATE).set(f64::from(state.as_gauge()));
}

/// Publishes the outcome of a health check.
pub fn set_health(healthy: bool, seconds_behind: Option<i64>) {
    gauge!(HEALTHY).set(if healthy { 1.0 } else { 0.0 });
    if let Some(seconds) = seconds_behind {
        gauge!(SECONDS_BEHIND).set(seconds as f64);
    }
}

/// Counts one raised alert.
pub fn increment_alerts() {
    counter!(ALERTS_TOTAL).increment(1);
}

/// Counts one alert the notifier failed to deliver.
pub fn increment_alert_failures() {
    counter!(ALERT_FAILURES_TOTAL).increment(1);
}

/// Counts one lock acquisition.
pub fn increment_lock_acquisitions() {
    counter!(LOCK_ACQUISITIONS_TOTAL).increment(1);
}

/// Counts one lost lock.
pub fn increment_locks_lost() {
    counter!(LOCKS_LOST_TOTAL).increment(1);
}

/// Counts one released lock.
pub fn increment_locks_released() {
    counter!(LOCKS_RELEASED_TOTAL).increment(1);
}

/// Error categories for consistent metric labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network, TCP, DNS or server selection failures
    Connection,
    /// Change stream invalidated or resume point lost
    Stream,
    /// Encoding or decoding failures
    Serialization,
    /// Write rejected by the target
    Write,
    /// Target lock lost or checkpoint store failure
    Checkpoint,
    /// Unclassified
    Unknown,
}

impl ErrorCategory {
    /// Returns the error category as a static string for metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection_error",
            Self::Stream => "stream_error",
            Self::Serialization => "serialization_error",
            Self::Write => "write_error",
            Self::Checkpoint => "checkpoint_error",
            Self::Unknown => "unknown_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_prefixed() {
        for name in [
            EVENTS_RECEIVED_TOTAL,
            UPSERTS_TOTAL,
            UPSERT_ERRORS_TOTAL,
            BATCHES_APPLIED_TOTAL,
            BATCH_FAILURES_TOTAL,
            BATCH_SIZE,
            BATCH_DURATION_SECONDS,
            CHECKPOINT_SAVES_TOTAL,
            RECONNECTS_TOTAL,
            REPLICATOR_STATE,
        ] {
            assert!(name.starts_with("penne_"), "{name}");
        }
    }

    #[test]
    fn counters_end_with_total() {
        for name in [UPSERTS_TOTAL, ALERTS_TOTAL, LOCKS_LOST_TOTAL, CHECKPOINT_FAILURES_TOTAL] {
            assert!(name.ends_with("_total"), "{name}");
        }
    }

    #[test]
    fn calls_without_recorder_are_noops() {
        init_metrics();
        increment_events_received("db.coll", "insert");
        increment_upserts(0, "db.coll", "update");
        record_change_feed_lag(Duration::from_millis(5), "db.coll");
        set_replicator_state(ReplicatorState::Streaming);
        set_health(false, None);
    }

    #[test]
    fn error_category_labels() {
        assert_eq!(ErrorCategory::Connection.as_str(), "connection_error");
        assert_eq!(ErrorCategory::Checkpoint.as_str(), "checkpoint_error");
    }
}
