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

//! Target store trait and error types.
//!
//! A [`Target`] is a keyed document store supporting get-by-identity and an
//! unordered bulk upsert. The replicator only ever writes full post-images
//! keyed by document key, so every write is idempotent and replaying a batch
//! converges to the same state.
//!
//! # Bulk semantics
//!
//! [`Target::bulk_upsert`] runs every operation even when some fail:
//!
//! - per-operation failures are returned in [`BulkWriteOutcome::failures`],
//! - a failure that prevents the bulk from running at all (lost connectivity)
//!   is returned as `Err(TargetError)` and the whole batch is treated as
//!   unapplied.
//!
//! # Implementing a target
//!
//! ```rust
//! use penne_core::target::{BulkWriteOutcome, Target, TargetError, UpsertOp};
//! use async_trait::async_trait;
//! use bson::{Bson, Document};
//!
//! struct NullTarget;
//!
//! #[async_trait]
//! impl Target for NullTarget {
//!     async fn bulk_upsert(&self, ops: Vec<UpsertOp>) -> Result<BulkWriteOutcome, TargetError> {
//!         Ok(BulkWriteOutcome::all_succeeded(ops.len()))
//!     }
//!
//!     async fn get_document(&self, _id: &Bson) -> Result<Option<Document>, TargetError> {
//!         Ok(None)
//!     }
//!
//!     async fn ping(&self) -> Result<(), TargetError> {
//!         Ok(())
//!     }
//! }
//! ```

use crate::event::{key_fingerprint, OperationType};
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Errors that can occur when talking to the target store.
#[derive(Error, Debug)]
pub enum TargetError {
    /// Target unreachable. Retryable after a delay.
    #[error("Connection error: {message}")]
    ConnectionError {
        /// Human-readable error message
        message: String,
        /// The underlying connection error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A document could not be encoded for the target.
    #[error("Serialization error: {message}")]
    SerializationError {
        /// Human-readable error message
        message: String,
        /// The underlying serialization error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The target rejected a write or read.
    #[error("Write error: {message}")]
    WriteError {
        /// Human-readable error message
        message: String,
        /// Whether this specific write error is retryable
        retryable: bool,
        /// The underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invalid target configuration.
    #[error("Configuration error: {message}")]
    ConfigurationError {
        /// Human-readable error message
        message: String,
        /// Configuration parameter name if applicable
        parameter: Option<String>,
    },
}

impl TargetError {
    /// Creates a connection error from any error type.
    #[must_use]
    pub fn connection(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::ConnectionError {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a connection error with a custom message.
    #[must_use]
    pub fn connection_msg(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a serialization error from any error type.
    #[must_use]
    pub fn serialization(
        source: impl std::error::Error + Send + Sync + 'static,
        message: impl Into<String>,
    ) -> Self {
        Self::SerializationError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a write error with retryability information.
    #[must_use]
    pub fn write(source: impl std::error::Error + Send + Sync + 'static, retryable: bool) -> Self {
        Self::WriteError {
            message: source.to_string(),
            retryable,
            source: Some(Box::new(source)),
        }
    }

    /// Creates a write error with a custom message.
    #[must_use]
    pub fn write_msg(message: impl Into<String>, retryable: bool) -> Self {
        Self::WriteError {
            message: message.into(),
            retryable,
            source: None,
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>, parameter: Option<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
            parameter,
        }
    }

    /// Returns whether this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionError { .. } => true,
            Self::SerializationError { .. } | Self::ConfigurationError { .. } => false,
            Self::WriteError { retryable, .. } => *retryable,
        }
    }

    /// Returns the error category for metrics/logging.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::ConnectionError { .. } => "connection",
            Self::SerializationError { .. } => "serialization",
            Self::WriteError { .. } => "write",
            Self::ConfigurationError { .. } => "configuration",
        }
    }
}

/// One idempotent write: replace-or-insert `document` where the key matches.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOp {
    /// Filter identifying the document
    pub key: Document,

    /// Operation that produced this state, kept for accounting and logs
    pub operation: OperationType,

    /// Full document to store
    pub document: Document,
}

/// A single failed operation within a bulk upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationFailure {
    /// Position of the operation in the submitted list
    pub index: usize,

    /// Error reported by the target
    pub message: String,
}

/// Result of a bulk upsert that ran.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkWriteOutcome {
    /// Number of operations submitted
    pub attempted: usize,

    /// Operations that failed, in no particular order
    pub failures: Vec<OperationFailure>,
}

impl BulkWriteOutcome {
    /// Outcome where all `attempted` operations succeeded.
    pub fn all_succeeded(attempted: usize) -> Self {
        Self {
            attempted,
            failures: Vec::new(),
        }
    }

    /// Number of operations that succeeded.
    pub fn succeeded(&self) -> usize {
        self.attempted.saturating_sub(self.failures.len())
    }

    /// Returns true if the operation at `index` failed.
    pub fn failed(&self, index: usize) -> bool {
        self.failures.iter().any(|f| f.index == index)
    }
}

/// Descriptive information about a target, used in logs and metric labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetMetadata {
    /// Human-readable target name (e.g., "MongoDB")
    pub name: String,

    /// Target type identifier (e.g., "mongodb")
    pub target_type: String,

    /// Additional target-specific metadata
    pub properties: HashMap<String, String>,
}

impl TargetMetadata {
    /// Creates new metadata with required fields.
    #[must_use]
    pub fn new(name: impl Into<String>, target_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_type: target_type.into(),
            properties: HashMap::new(),
        }
    }

    /// Adds a custom property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// A keyed document store the replicator writes to.
///
/// Methods take `&self` so one target can be shared between the replicator,
/// the health monitor and the reconciler.
#[async_trait]
pub trait Target: Send + Sync {
    /// Runs all `ops` as one unordered bulk upsert.
    ///
    /// # Errors
    ///
    /// Returns an error only when the bulk could not run. Individual failures
    /// are reported in the outcome.
    async fn bulk_upsert(&self, ops: Vec<UpsertOp>) -> Result<BulkWriteOutcome, TargetError>;

    /// Fetches the document whose `_id` equals `id`.
    async fn get_document(&self, id: &Bson) -> Result<Option<Document>, TargetError>;

    /// Checks that the target is reachable.
    async fn ping(&self) -> Result<(), TargetError>;

    /// Releases connections. Default is a no-op.
    async fn close(&self) -> Result<(), TargetError> {
        Ok(())
    }

    /// Returns metadata about this target.
    fn metadata(&self) -> TargetMetadata {
        TargetMetadata::new("Unknown", "unknown")
    }
}

/// In-memory target for tests and examples.
///
/// Documents are stored by document key. Failures can be injected for whole
/// bulks, for individual `_id`s, and for pings. Execution order within a bulk
/// can be reversed to check that callers do not depend on it.
///
/// ```rust
/// use penne_core::target::{MemoryTarget, Target, UpsertOp};
/// use penne_core::event::OperationType;
/// use bson::{doc, Bson};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let target = MemoryTarget::new();
/// target
///     .bulk_upsert(vec![UpsertOp {
///         key: doc! { "_id": 1 },
///         operation: OperationType::Insert,
///         document: doc! { "_id": 1, "a": 1 },
///     }])
///     .await?;
///
/// assert_eq!(target.get_document(&Bson::Int32(1)).await?, Some(doc! { "_id": 1, "a": 1 }));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryTarget {
    inner: Arc<Mutex<MemoryTargetState>>,
}

#[derive(Debug, Default)]
struct MemoryTargetState {
    documents: HashMap<String, Document>,
    upserts: usize,
    bulk_calls: usize,
    failing_bulks: usize,
    failing_ids: HashSet<String>,
    failing_pings: usize,
    reversed: bool,
    closed: bool,
}

impl MemoryTarget {
    /// Creates an empty target.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryTargetState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Executes each bulk in reverse submission order.
    #[must_use]
    pub fn with_reversed_execution(self) -> Self {
        self.lock().reversed = true;
        self
    }

    /// Stores `document` directly, bypassing accounting.
    pub fn insert(&self, document: Document) {
        let id = document.get("_id").cloned().unwrap_or(Bson::Null);
        self.lock()
            .documents
            .insert(key_fingerprint(&doc! { "_id": id }), document);
    }

    /// The next `count` bulk upserts fail as a whole with a connection error.
    pub fn fail_next_bulks(&self, count: usize) {
        self.lock().failing_bulks = count;
    }

    /// Upserts of the document with this `_id` fail individually.
    pub fn fail_id(&self, id: impl Into<Bson>) {
        let id: Bson = id.into();
        self.lock()
            .failing_ids
            .insert(key_fingerprint(&doc! { "_id": id }));
    }

    /// The next `count` pings fail.
    pub fn fail_next_pings(&self, count: usize) {
        self.lock().failing_pings = count;
    }

    /// Snapshot of stored documents.
    pub fn documents(&self) -> Vec<Document> {
        self.lock().documents.values().cloned().collect()
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.lock().documents.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.lock().documents.is_empty()
    }

    /// Successful individual upserts so far.
    pub fn upsert_count(&self) -> usize {
        self.lock().upserts
    }

    /// Bulk calls that ran, failed ones excluded.
    pub fn bulk_count(&self) -> usize {
        self.lock().bulk_calls
    }

    /// Returns true once `close` was called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[async_trait]
impl Target for MemoryTarget {
    async fn bulk_upsert(&self, ops: Vec<UpsertOp>) -> Result<BulkWriteOutcome, TargetError> {
        let mut state = self.lock();
        if state.failing_bulks > 0 {
            state.failing_bulks -= 1;
            return Err(TargetError::connection_msg("simulated connectivity loss"));
        }

        state.bulk_calls += 1;
        let mut order: Vec<usize> = (0..ops.len()).collect();
        if state.reversed {
            order.reverse();
        }

        let mut outcome = BulkWriteOutcome::all_succeeded(ops.len());
        for index in order {
            let op = &ops[index];
            let id = op.key.get("_id").cloned().unwrap_or(Bson::Null);
            let fingerprint = key_fingerprint(&doc! { "_id": id });
            if state.failing_ids.contains(&fingerprint) {
                outcome.failures.push(OperationFailure {
                    index,
                    message: "simulated write failure".to_string(),
                });
                continue;
            }
            state.documents.insert(fingerprint, op.document.clone());
            state.upserts += 1;
        }

        Ok(outcome)
    }

    async fn get_document(&self, id: &Bson) -> Result<Option<Document>, TargetError> {
        let fingerprint = key_fingerprint(&doc! { "_id": id.clone() });
        Ok(self.lock().documents.get(&fingerprint).cloned())
    }

    async fn ping(&self) -> Result<(), TargetError> {
        let mut state = self.lock();
        if state.failing_pings > 0 {
            state.failing_pings -= 1;
            return Err(TargetError::connection_msg("simulated ping failure"));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TargetError> {
        self.lock().closed = true;
        Ok(())
    }

    fn metadata(&self) -> TargetMetadata {
        TargetMetadata::new("MemoryTarget", "memory")
    }
}
