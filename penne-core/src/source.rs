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

//! Read access to the source store, for reconciliation.
//!
//! A [`SourceReader`] fetches documents by identity and lists the identities
//! touched by inserts and updates in a time window, read from the source's
//! raw operation record (the oplog on MongoDB). It shares nothing with the
//! live replication path.

use crate::event::{key_fingerprint, Namespace, OperationType};
use crate::stream::to_timestamp;
use async_trait::async_trait;
use bson::{doc, Bson, Document, Timestamp};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{Client, Collection};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised while reading from the source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The query failed
    #[error("source query failed: {0}")]
    Query(#[from] mongodb::error::Error),

    /// Source unreachable
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Read-only view of the source collection.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Fetches the document whose `_id` equals `id`.
    async fn get_document(&self, id: &Bson) -> Result<Option<Document>, SourceError>;

    /// Lists distinct `_id`s inserted or updated within `[start, end]`, in
    /// operation order, stopping after `limit` ids.
    async fn modified_ids(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Bson>, SourceError>;

    /// Checks that the source is reachable.
    async fn ping(&self) -> Result<(), SourceError>;
}

/// [`SourceReader`] over a MongoDB replica set.
///
/// Needs read access to `local.oplog.rs`.
#[derive(Clone)]
pub struct MongoSourceReader {
    client: Client,
    namespace: Namespace,
}

impl MongoSourceReader {
    /// Creates a reader over an existing client.
    pub fn new(client: Client, namespace: Namespace) -> Self {
        Self { client, namespace }
    }

    /// Creates a client from `uri` and wraps it.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI cannot be parsed.
    pub async fn connect(uri: &str, namespace: Namespace) -> Result<Self, SourceError> {
        let client = Client::with_uri_str(uri).await?;
        Ok(Self::new(client, namespace))
    }

    fn collection(&self) -> Collection<Document> {
        self.client
            .database(&self.namespace.database)
            .collection(&self.namespace.collection)
    }

    fn oplog(&self) -> Collection<Document> {
        self.client.database("local").collection("oplog.rs")
    }
}

/// Extracts the document identity from an oplog entry.
///
/// Inserts carry the document in `o`; updates carry the target in `o2`.
fn oplog_identity(entry: &Document) -> Option<Bson> {
    match entry.get_str("op").ok()? {
        "i" => entry.get_document("o").ok()?.get("_id").cloned(),
        "u" => entry.get_document("o2").ok()?.get("_id").cloned(),
        _ => None,
    }
}

#[async_trait]
impl SourceReader for MongoSourceReader {
    async fn get_document(&self, id: &Bson) -> Result<Option<Document>, SourceError> {
        Ok(self
            .collection()
            .find_one(doc! { "_id": id.clone() })
            .await?)
    }

    async fn modified_ids(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Bson>, SourceError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let upper = Timestamp {
            increment: u32::MAX,
            ..to_timestamp(end)
        };
        let filter = doc! {
            "ns": self.namespace.full_name(),
            "op": { "$in": ["i", "u"] },
            "ts": { "$gte": to_timestamp(start), "$lte": upper },
        };

        let mut cursor = self
            .oplog()
            .find(filter)
            .projection(doc! { "op": 1, "o._id": 1, "o2._id": 1 })
            .sort(doc! { "$natural": 1 })
            .await?;

        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        while let Some(entry) = cursor.try_next().await? {
            let Some(id) = oplog_identity(&entry) else {
                warn!(?entry, "Oplog entry without document identity");
                continue;
            };
            if seen.insert(key_fingerprint(&doc! { "_id": id.clone() })) {
                ids.push(id);
                if ids.len() >= limit {
                    break;
                }
            }
        }

        debug!(count = ids.len(), limit, "Collected modified ids from oplog");
        Ok(ids)
    }

    async fn ping(&self) -> Result<(), SourceError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;
        Ok(())
    }
}

/// In-memory [`SourceReader`] for tests.
///
/// Documents and operation records are added independently so tests can
/// model a source whose documents changed after the recorded operations.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    inner: Arc<Mutex<MemorySourceState>>,
}

#[derive(Debug, Default)]
struct MemorySourceState {
    documents: HashMap<String, Document>,
    operations: Vec<(DateTime<Utc>, OperationType, Bson)>,
    unavailable: bool,
}

impl MemorySource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemorySourceState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores `document` under its `_id`.
    pub fn insert(&self, document: Document) {
        let id = document.get("_id").cloned().unwrap_or(Bson::Null);
        self.lock()
            .documents
            .insert(key_fingerprint(&doc! { "_id": id }), document);
    }

    /// Records an operation on `id` at `at`.
    pub fn record(&self, at: DateTime<Utc>, operation: OperationType, id: impl Into<Bson>) {
        let id: Bson = id.into();
        self.lock().operations.push((at, operation, id));
    }

    /// Makes every call fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    fn check(&self) -> Result<(), SourceError> {
        if self.lock().unavailable {
            return Err(SourceError::Unavailable("simulated outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceReader for MemorySource {
    async fn get_document(&self, id: &Bson) -> Result<Option<Document>, SourceError> {
        self.check()?;
        let fingerprint = key_fingerprint(&doc! { "_id": id.clone() });
        Ok(self.lock().documents.get(&fingerprint).cloned())
    }

    async fn modified_ids(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Bson>, SourceError> {
        self.check()?;
        let state = self.lock();
        let mut ops: Vec<_> = state
            .operations
            .iter()
            .filter(|(at, op, _)| *at >= start && *at <= end && op.is_replicable())
            .collect();
        ops.sort_by_key(|(at, _, _)| *at);

        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for (_, _, id) in ops {
            if ids.len() >= limit {
                break;
            }
            if seen.insert(key_fingerprint(&doc! { "_id": id.clone() })) {
                ids.push(id.clone());
            }
        }
        Ok(ids)
    }

    async fn ping(&self) -> Result<(), SourceError> {
        self.check()
    }
}
