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

//! Applies collapsed batches to the target.
//!
//! Every collapsed entry becomes one upsert keyed by its document key; inserts
//! and updates are written identically. The upserts run as a single unordered
//! bulk. Individual failures are counted and logged but leave the batch
//! applied; a bulk-level failure is an [`ApplyError`] and the batch counts as
//! not applied.

use crate::batch::Batch;
use crate::event::OperationType;
use crate::metrics::{self, ErrorCategory};
use crate::target::{Target, TargetError, UpsertOp};
use serde::Serialize;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, instrument};

/// Per-batch write counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStats {
    /// Upserts that came from an insert
    pub inserts: u64,

    /// Upserts that came from an update
    pub updates: u64,

    /// Upserts the target rejected
    pub errors: u64,
}

impl ApplyStats {
    /// Upserts the target confirmed.
    pub fn applied(&self) -> u64 {
        self.inserts + self.updates
    }
}

impl AddAssign for ApplyStats {
    fn add_assign(&mut self, rhs: Self) {
        self.inserts += rhs.inserts;
        self.updates += rhs.updates;
        self.errors += rhs.errors;
    }
}

/// A batch could not be applied at all.
#[derive(Debug, Error)]
#[error("failed to apply batch of {events} events ({documents} documents): {source}")]
pub struct ApplyError {
    /// Events in the batch
    pub events: usize,

    /// Documents after collapse
    pub documents: usize,

    /// Failure reported by the target
    #[source]
    pub source: TargetError,
}

impl ApplyError {
    /// Metric category of the underlying failure.
    pub fn category(&self) -> ErrorCategory {
        match self.source {
            TargetError::ConnectionError { .. } => ErrorCategory::Connection,
            TargetError::SerializationError { .. } => ErrorCategory::Serialization,
            TargetError::WriteError { .. } => ErrorCategory::Write,
            TargetError::ConfigurationError { .. } => ErrorCategory::Unknown,
        }
    }
}

/// Writes batches to a [`Target`].
pub struct Applier<T: Target + ?Sized> {
    target: Arc<T>,
    collection: String,
}

impl<T: Target + ?Sized> Applier<T> {
    /// Creates an applier; `collection` labels logs and metrics.
    pub fn new(target: Arc<T>, collection: impl Into<String>) -> Self {
        Self {
            target,
            collection: collection.into(),
        }
    }

    /// The wrapped target.
    pub fn target(&self) -> &Arc<T> {
        &self.target
    }

    /// Collapses `batch` and applies it as one unordered bulk upsert.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError`] when the bulk could not run. Nothing from the
    /// batch may be considered applied in that case.
    #[instrument(skip(self, batch), fields(collection = %self.collection, events = batch.len()))]
    pub async fn apply(&self, batch: &Batch) -> Result<ApplyStats, ApplyError> {
        let entries = batch.collapse();
        if entries.is_empty() {
            debug!("Nothing to apply after collapse");
            return Ok(ApplyStats::default());
        }

        let ops: Vec<UpsertOp> = entries
            .into_iter()
            .map(|entry| UpsertOp {
                key: entry.key,
                operation: entry.operation,
                document: entry.document,
            })
            .collect();
        let documents = ops.len();
        let target_type = self.target.metadata().target_type;

        metrics::record_batch_size(batch.len(), &self.collection);
        metrics::record_collapsed_batch_size(documents, &self.collection);

        let started = Instant::now();
        let outcome = match self.target.bulk_upsert(ops.clone()).await {
            Ok(outcome) => outcome,
            Err(source) => {
                let err = ApplyError {
                    events: batch.len(),
                    documents,
                    source,
                };
                metrics::increment_batch_failures(&target_type, err.category());
                return Err(err);
            }
        };

        let mut stats = ApplyStats::default();
        for (index, op) in ops.iter().enumerate() {
            if outcome.failed(index) {
                stats.errors += 1;
                continue;
            }
            match op.operation {
                OperationType::Insert => stats.inserts += 1,
                _ => stats.updates += 1,
            }
        }

        for failure in &outcome.failures {
            if let Some(op) = ops.get(failure.index) {
                error!(
                    document_key = %op.key,
                    operation = %op.operation,
                    error = %failure.message,
                    "Upsert failed"
                );
            }
        }

        metrics::record_batch_duration(started.elapsed().as_secs_f64(), &self.collection);
        metrics::increment_batches_applied(&target_type);
        metrics::increment_upserts(stats.inserts, &self.collection, "insert");
        metrics::increment_upserts(stats.updates, &self.collection, "update");
        metrics::increment_upsert_errors(stats.errors, &self.collection);

        debug!(
            documents,
            inserts = stats.inserts,
            updates = stats.updates,
            errors = stats.errors,
            "Batch applied"
        );

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ChangeEvent, Namespace};
    use crate::target::MemoryTarget;
    use bson::{doc, Bson};
    use chrono::Utc;

    fn event(seq: usize, id: i32, operation: OperationType, a: i32) -> ChangeEvent {
        ChangeEvent {
            operation,
            namespace: Namespace::new("db", "coll"),
            document_key: Some(doc! { "_id": id }),
            full_document: Some(doc! { "_id": id, "a": a }),
            cluster_time: Utc::now(),
            resume_token: doc! { "_data": format!("{seq:08}") },
        }
    }

    #[tokio::test]
    async fn insert_then_update_yields_single_upsert() {
        let target = Arc::new(MemoryTarget::new());
        let applier = Applier::new(Arc::clone(&target), "db.coll");

        let batch = Batch::new(vec![
            event(1, 1, OperationType::Insert, 1),
            event(2, 1, OperationType::Update, 2),
        ]);
        let stats = applier.apply(&batch).await.unwrap();

        assert_eq!(stats, ApplyStats { inserts: 0, updates: 1, errors: 0 });
        assert_eq!(target.upsert_count(), 1);
        assert_eq!(
            target.get_document(&Bson::Int32(1)).await.unwrap(),
            Some(doc! { "_id": 1, "a": 2 })
        );
    }

    #[tokio::test]
    async fn deletes_never_reach_the_target() {
        let target = Arc::new(MemoryTarget::new());
        let applier = Applier::new(Arc::clone(&target), "db.coll");

        let batch = Batch::new(vec![
            event(1, 1, OperationType::Delete, 0),
            event(2, 2, OperationType::Other("drop".into()), 0),
        ]);
        let stats = applier.apply(&batch).await.unwrap();

        assert_eq!(stats, ApplyStats::default());
        assert_eq!(target.bulk_count(), 0);
        assert!(target.is_empty());
    }

    #[tokio::test]
    async fn per_operation_failures_are_counted_not_raised() {
        let target = Arc::new(MemoryTarget::new());
        target.fail_id(2);
        let applier = Applier::new(Arc::clone(&target), "db.coll");

        let batch = Batch::new(vec![
            event(1, 1, OperationType::Insert, 1),
            event(2, 2, OperationType::Insert, 1),
            event(3, 3, OperationType::Update, 1),
        ]);
        let stats = applier.apply(&batch).await.unwrap();

        assert_eq!(stats, ApplyStats { inserts: 1, updates: 1, errors: 1 });
        assert_eq!(target.len(), 2);
    }

    #[tokio::test]
    async fn bulk_failure_is_an_apply_error() {
        let target = Arc::new(MemoryTarget::new());
        target.fail_next_bulks(1);
        let applier = Applier::new(Arc::clone(&target), "db.coll");

        let batch = Batch::new(vec![event(1, 1, OperationType::Insert, 1)]);
        let err = applier.apply(&batch).await.unwrap_err();

        assert_eq!(err.events, 1);
        assert_eq!(err.documents, 1);
        assert_eq!(err.category(), ErrorCategory::Connection);
        assert!(target.is_empty());
    }

    #[tokio::test]
    async fn reversed_bulk_order_gives_same_result() {
        let target = Arc::new(MemoryTarget::new().with_reversed_execution());
        let applier = Applier::new(Arc::clone(&target), "db.coll");

        let batch = Batch::new(vec![
            event(1, 1, OperationType::Insert, 1),
            event(2, 2, OperationType::Insert, 5),
            event(3, 1, OperationType::Update, 3),
        ]);
        applier.apply(&batch).await.unwrap();

        assert_eq!(
            target.get_document(&Bson::Int32(1)).await.unwrap(),
            Some(doc! { "_id": 1, "a": 3 })
        );
    }

    #[test]
    fn stats_accumulate() {
        let mut total = ApplyStats::default();
        total += ApplyStats { inserts: 2, updates: 1, errors: 0 };
        total += ApplyStats { inserts: 0, updates: 4, errors: 1 };
        assert_eq!(total, ApplyStats { inserts: 2, updates: 5, errors: 1 });
        assert_eq!(total.applied(), 7);
    }
}
