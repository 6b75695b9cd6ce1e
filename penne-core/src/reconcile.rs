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

//! On-demand diffing between source and target.
//!
//! The [`Reconciler`] compares single documents ([`Reconciler::compare_document`])
//! or every document touched in a time window ([`Reconciler::compare_window`]).
//! It opens its own reads and never touches the checkpoint or the live
//! replication loop. Errors go back to the caller of that comparison only.
//!
//! Documents are compared field by field at the top level, excluding `_id`.
//! Values are compared with full structural BSON equality, so nested
//! documents and arrays must match exactly, and `Int32(1)` differs from
//! `Int64(1)`.
//!
//! ```rust
//! use penne_core::reconcile::{diff_documents, DiffKind};
//! use bson::doc;
//!
//! let source = doc! { "_id": 1, "a": 1, "b": "x" };
//! let target = doc! { "_id": 1, "a": 2, "c": true };
//!
//! let diffs = diff_documents(&source, &target);
//! let kinds: Vec<_> = diffs.iter().map(|d| (d.field.as_str(), d.kind)).collect();
//! assert_eq!(
//!     kinds,
//!     vec![
//!         ("a", DiffKind::ValueMismatch),
//!         ("b", DiffKind::MissingInTarget),
//!         ("c", DiffKind::MissingInSource),
//!     ]
//! );
//! ```

use crate::source::{SourceError, SourceReader};
use crate::target::{Target, TargetError};
use bson::{oid::ObjectId, Bson, Document};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};

/// Identity field excluded from field comparison.
pub const IDENTITY_FIELD: &str = "_id";

/// Default cap on documents compared by a window comparison.
pub const DEFAULT_WINDOW_LIMIT: usize = 100;

/// Errors raised by a comparison.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Reading from the source failed
    #[error("source read failed: {0}")]
    Source(#[from] SourceError),

    /// Reading from the target failed
    #[error("target read failed: {0}")]
    Target(#[from] TargetError),

    /// Window bounds are inverted
    #[error("invalid window: start {start} is after end {end}")]
    InvalidWindow {
        /// Window start
        start: DateTime<Utc>,
        /// Window end
        end: DateTime<Utc>,
    },
}

/// How a field differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiffKind {
    /// Field exists only in the target
    MissingInSource,
    /// Field exists only in the source
    MissingInTarget,
    /// Field exists on both sides with different values
    ValueMismatch,
}

/// One differing field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffEntry {
    /// Top-level field name
    pub field: String,

    /// Source value, absent for [`DiffKind::MissingInSource`]
    pub source_value: Option<Bson>,

    /// Target value, absent for [`DiffKind::MissingInTarget`]
    pub target_value: Option<Bson>,

    /// Difference classification
    pub kind: DiffKind,
}

/// Outcome of comparing one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComparisonStatus {
    /// Both sides hold identical documents
    Match,
    /// Both sides hold the document with differing fields
    Differs,
    /// The source does not hold the document
    MissingInSource,
    /// Only the source holds the document
    MissingInTarget,
}

/// Result of comparing one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentComparison {
    /// Compared identity
    pub id: Bson,

    /// Outcome
    pub status: ComparisonStatus,

    /// Whether the source holds the document
    pub exists_in_source: bool,

    /// Whether the target holds the document
    pub exists_in_target: bool,

    /// Field differences; empty unless `status` is `Differs`
    pub differences: Vec<DiffEntry>,

    /// Human-readable summary for missing documents
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl DocumentComparison {
    /// Returns true unless the document matches on both sides.
    pub fn has_differences(&self) -> bool {
        self.status != ComparisonStatus::Match
    }
}

/// Result of comparing every document touched in a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowReport {
    /// Window start
    pub start: DateTime<Utc>,

    /// Window end
    pub end: DateTime<Utc>,

    /// Cap on compared documents
    pub limit: usize,

    /// Documents compared
    pub documents_compared: usize,

    /// Documents that did not match
    pub documents_with_differences: usize,

    /// Per-document detail
    pub results: Vec<DocumentComparison>,
}

/// Compares two documents field by field, excluding `_id`.
///
/// Source fields come first in source order, then target-only fields in
/// target order.
pub fn diff_documents(source: &Document, target: &Document) -> Vec<DiffEntry> {
    let mut diffs = Vec::new();

    for (field, source_value) in source {
        if field == IDENTITY_FIELD {
            continue;
        }
        match target.get(field) {
            None => diffs.push(DiffEntry {
                field: field.clone(),
                source_value: Some(source_value.clone()),
                target_value: None,
                kind: DiffKind::MissingInTarget,
            }),
            Some(target_value) if target_value != source_value => diffs.push(DiffEntry {
                field: field.clone(),
                source_value: Some(source_value.clone()),
                target_value: Some(target_value.clone()),
                kind: DiffKind::ValueMismatch,
            }),
            Some(_) => {}
        }
    }

    for (field, target_value) in target {
        if field == IDENTITY_FIELD || source.contains_key(field) {
            continue;
        }
        diffs.push(DiffEntry {
            field: field.clone(),
            source_value: None,
            target_value: Some(target_value.clone()),
            kind: DiffKind::MissingInSource,
        });
    }

    diffs
}

/// Parses a command-line identity.
///
/// 24 hex characters become an `ObjectId`, integers become `Int64` (or
/// `Int32` when they fit), anything else stays a string.
pub fn parse_document_id(raw: &str) -> Bson {
    let raw = raw.trim();
    if raw.len() == 24 {
        if let Ok(oid) = ObjectId::parse_str(raw) {
            return Bson::ObjectId(oid);
        }
    }
    if let Ok(n) = raw.parse::<i64>() {
        return match i32::try_from(n) {
            Ok(small) => Bson::Int32(small),
            Err(_) => Bson::Int64(n),
        };
    }
    Bson::String(raw.to_string())
}

/// Diffs source and target on demand.
pub struct Reconciler<R: SourceReader + ?Sized, T: Target + ?Sized> {
    source: Arc<R>,
    target: Arc<T>,
}

impl<R: SourceReader + ?Sized, T: Target + ?Sized> Reconciler<R, T> {
    /// Creates a reconciler over its own source and target handles.
    pub fn new(source: Arc<R>, target: Arc<T>) -> Self {
        Self { source, target }
    }

    /// Compares the document identified by `id` on both sides.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] if either side cannot be read.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn compare_document(&self, id: &Bson) -> Result<DocumentComparison, ReconcileError> {
        let source_doc = self.source.get_document(id).await?;
        let target_doc = self.target.get_document(id).await?;

        let comparison = match (source_doc, target_doc) {
            (None, target_doc) => DocumentComparison {
                id: id.clone(),
                status: ComparisonStatus::MissingInSource,
                exists_in_source: false,
                exists_in_target: target_doc.is_some(),
                differences: Vec::new(),
                note: Some("Document not found in source".to_string()),
            },
            (Some(_), None) => DocumentComparison {
                id: id.clone(),
                status: ComparisonStatus::MissingInTarget,
                exists_in_source: true,
                exists_in_target: false,
                differences: Vec::new(),
                note: Some("Document not found in target".to_string()),
            },
            (Some(source_doc), Some(target_doc)) => {
                let differences = diff_documents(&source_doc, &target_doc);
                DocumentComparison {
                    id: id.clone(),
                    status: if differences.is_empty() {
                        ComparisonStatus::Match
                    } else {
                        ComparisonStatus::Differs
                    },
                    exists_in_source: true,
                    exists_in_target: true,
                    differences,
                    note: None,
                }
            }
        };

        Ok(comparison)
    }

    /// Compares every document inserted or updated on the source within
    /// `[start, end]`, up to `limit` documents.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::InvalidWindow`] if `start > end`, or a read
    /// error from either side.
    #[instrument(skip(self))]
    pub async fn compare_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<WindowReport, ReconcileError> {
        if start > end {
            return Err(ReconcileError::InvalidWindow { start, end });
        }

        let mut ids = self.source.modified_ids(start, end, limit).await?;
        ids.truncate(limit);

        let mut results = Vec::with_capacity(ids.len());
        for id in &ids {
            results.push(self.compare_document(id).await?);
        }

        let documents_with_differences = results.iter().filter(|r| r.has_differences()).count();
        info!(
            documents_compared = results.len(),
            documents_with_differences, "Window comparison finished"
        );

        Ok(WindowReport {
            start,
            end,
            limit,
            documents_compared: results.len(),
            documents_with_differences,
            results,
        })
    }
}
