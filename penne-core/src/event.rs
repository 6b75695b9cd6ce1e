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

//! Change feed event representation.
//!
//! A [`ChangeEvent`] is a single entry observed on the source collection's
//! change feed. Events flow from the [`ChangeFeed`](crate::stream::ChangeFeed)
//! into the [`BatchAccumulator`](crate::batch::BatchAccumulator) and are
//! consumed exactly once.
//!
//! # Examples
//!
//! ```rust
//! use penne_core::event::{ChangeEvent, Namespace, OperationType};
//! use bson::doc;
//! use chrono::Utc;
//!
//! let event = ChangeEvent {
//!     operation: OperationType::Insert,
//!     namespace: Namespace::new("shop", "orders"),
//!     document_key: Some(doc! { "_id": 1 }),
//!     full_document: Some(doc! { "_id": 1, "total": 42 }),
//!     cluster_time: Utc::now(),
//!     resume_token: doc! { "_data": "8263A1" },
//! };
//!
//! assert!(event.is_replicable());
//! assert_eq!(event.namespace.full_name(), "shop.orders");
//! ```

use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Error raised when a driver event cannot be turned into a [`ChangeEvent`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConversionError {
    /// The resume token could not be represented as a BSON document.
    #[error("failed to convert resume token: {0}")]
    ResumeToken(String),
}

/// Operation type carried by a change event.
///
/// Only [`Insert`](OperationType::Insert) and [`Update`](OperationType::Update)
/// are replicated. Everything else is dropped at the feed boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// A document was inserted.
    Insert,

    /// A document was updated.
    Update,

    /// A document was deleted. Never replicated.
    Delete,

    /// Any other operation type reported by the source (replace, drop,
    /// invalidate, ...). Holds the original name for logging.
    #[serde(untagged)]
    Other(String),
}

impl OperationType {
    /// Returns true for operation types that are applied to the target.
    #[inline]
    pub fn is_replicable(&self) -> bool {
        matches!(self, OperationType::Insert | OperationType::Update)
    }

    /// Returns the lowercase name used in logs and metric labels.
    pub fn as_str(&self) -> &str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::Other(name) => name,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Database and collection pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name
    pub database: String,

    /// Collection name
    pub collection: String,
}

impl Namespace {
    /// Creates a new namespace from database and collection names.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Returns the fully qualified namespace as "database.collection".
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// A single change observed on the source collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Type of operation that occurred
    #[serde(rename = "operationType")]
    pub operation: OperationType,

    /// Namespace where the operation occurred
    #[serde(rename = "ns")]
    pub namespace: Namespace,

    /// Document key (`_id` plus the shard key on sharded collections)
    #[serde(rename = "documentKey", skip_serializing_if = "Option::is_none")]
    pub document_key: Option<Document>,

    /// Post-image of the document. Present for inserts, and for updates when
    /// the feed is opened with update lookup and the document still exists.
    #[serde(rename = "fullDocument", skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Document>,

    /// Time the operation was observed on the source
    #[serde(rename = "clusterTime")]
    pub cluster_time: DateTime<Utc>,

    /// Opaque position token. Resuming after it replays every later event.
    #[serde(rename = "_id")]
    pub resume_token: Document,
}

impl ChangeEvent {
    /// Returns true if this event is applied to the target.
    #[inline]
    pub fn is_replicable(&self) -> bool {
        self.operation.is_replicable()
    }

    /// Returns the document `_id` if present in the document key.
    pub fn document_id(&self) -> Option<&Bson> {
        self.document_key.as_ref()?.get("_id")
    }

    /// Returns a stable string identity for the document key, suitable as a
    /// map key. `None` when the event carries no document key.
    pub fn key_fingerprint(&self) -> Option<String> {
        self.document_key.as_ref().map(key_fingerprint)
    }
}

/// Renders a document key as canonical extended JSON.
///
/// Two keys produce the same fingerprint exactly when they hold the same
/// fields with the same BSON values in the same order, which is how the
/// source reports keys for a given document.
pub fn key_fingerprint(key: &Document) -> String {
    Bson::Document(key.clone())
        .into_canonical_extjson()
        .to_string()
}

impl TryFrom<mongodb::change_stream::event::ChangeStreamEvent<Document>> for ChangeEvent {
    type Error = ConversionError;

    fn try_from(
        event: mongodb::change_stream::event::ChangeStreamEvent<Document>,
    ) -> Result<Self, Self::Error> {
        use mongodb::change_stream::event::OperationType as MongoOpType;

        let operation = match event.operation_type {
            MongoOpType::Insert => OperationType::Insert,
            MongoOpType::Update => OperationType::Update,
            MongoOpType::Delete => OperationType::Delete,
            other => OperationType::Other(format!("{other:?}").to_lowercase()),
        };

        let namespace = event
            .ns
            .map(|ns| Namespace::new(ns.db, ns.coll.unwrap_or_default()))
            .unwrap_or_else(|| Namespace::new("", ""));

        // Prefer the wall clock time reported by newer servers; the cluster
        // timestamp only carries whole seconds.
        let cluster_time = event
            .wall_time
            .map(|wall| wall.to_chrono())
            .or_else(|| {
                event
                    .cluster_time
                    .and_then(|ts| DateTime::from_timestamp(i64::from(ts.time), 0))
            })
            .unwrap_or_else(|| {
                warn!(operation = %operation, "Change event without cluster time, using current time");
                Utc::now()
            });

        let resume_token = bson::to_document(&event.id)
            .map_err(|e| ConversionError::ResumeToken(e.to_string()))?;

        Ok(Self {
            operation,
            namespace,
            document_key: event.document_key,
            full_document: event.full_document,
            cluster_time,
            resume_token,
        })
    }
}
