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

//! MongoDB target implementation.

use super::config::MongoTargetConfig;
use ::mongodb::error::{Error as MongoError, ErrorKind, RETRYABLE_WRITE_ERROR};
use ::mongodb::{Client, Collection};
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::stream::{self, StreamExt};
use penne_core::target::{
    BulkWriteOutcome, OperationFailure, Target, TargetError, TargetMetadata, UpsertOp,
};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, instrument, warn};

/// Target that upserts into a MongoDB collection.
#[derive(Clone)]
pub struct MongoTarget {
    client: Client,
    collection: Collection<Document>,
    config: MongoTargetConfig,
    closed: std::sync::Arc<AtomicBool>,
}

impl std::fmt::Debug for MongoTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoTarget")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MongoTarget {
    /// Wraps an existing client.
    pub fn new(client: Client, config: MongoTargetConfig) -> Self {
        let collection = client
            .database(&config.database)
            .collection::<Document>(&config.collection);
        Self {
            client,
            collection,
            config,
            closed: std::sync::Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates a client from the configured URI.
    ///
    /// The driver connects lazily; use [`Target::ping`] to verify
    /// connectivity.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the URI cannot be parsed.
    pub async fn connect(config: MongoTargetConfig) -> Result<Self, TargetError> {
        let client = Client::with_uri_str(&config.uri).await.map_err(|e| {
            TargetError::configuration(
                format!("invalid target URI {}: {e}", config.redacted_uri()),
                Some("uri".to_string()),
            )
        })?;
        info!(
            uri = %config.redacted_uri(),
            database = %config.database,
            collection = %config.collection,
            "Created MongoDB target"
        );
        Ok(Self::new(client, config))
    }

    /// Configuration this target was built from.
    pub fn config(&self) -> &MongoTargetConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<(), TargetError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TargetError::write_msg(
                "Cannot use closed MongoDB target",
                false,
            ));
        }
        Ok(())
    }
}

/// Errors after which the deployment is presumed unreachable.
fn is_network_error(error: &MongoError) -> bool {
    matches!(
        error.kind.as_ref(),
        ErrorKind::Io(_)
            | ErrorKind::ServerSelection { .. }
            | ErrorKind::ConnectionPoolCleared { .. }
    )
}

/// Classifies driver errors into [`TargetError`] variants.
fn classify_mongo_error(error: MongoError) -> TargetError {
    if is_network_error(&error) {
        return TargetError::connection(error);
    }

    match error.kind.as_ref() {
        ErrorKind::InvalidArgument { .. } => TargetError::configuration(error.to_string(), None),
        ErrorKind::BsonSerialization(_) => {
            let message = error.to_string();
            TargetError::serialization(error, message)
        }
        _ => {
            let retryable = error.contains_label(RETRYABLE_WRITE_ERROR);
            TargetError::write(error, retryable)
        }
    }
}

#[async_trait]
impl Target for MongoTarget {
    #[instrument(skip(self, ops), fields(collection = %self.config.collection, ops = ops.len()))]
    async fn bulk_upsert(&self, ops: Vec<UpsertOp>) -> Result<BulkWriteOutcome, TargetError> {
        self.ensure_open()?;

        let attempted = ops.len();
        if attempted == 0 {
            debug!("Received empty bulk, skipping");
            return Ok(BulkWriteOutcome::all_succeeded(0));
        }

        let results: Vec<(usize, Result<(), MongoError>)> =
            stream::iter(ops.into_iter().enumerate())
                .map(|(index, op)| {
                    let collection = self.collection.clone();
                    async move {
                        let result = collection
                            .replace_one(op.key, op.document)
                            .upsert(true)
                            .await
                            .map(|_| ());
                        (index, result)
                    }
                })
                .buffer_unordered(self.config.max_concurrency)
                .collect()
                .await;

        let mut failures = Vec::new();
        for (index, result) in results {
            match result {
                Ok(()) => {}
                Err(e) if is_network_error(&e) => {
                    warn!(index, error = %e, "Target unreachable during bulk upsert");
                    return Err(TargetError::connection(e));
                }
                Err(e) => failures.push(OperationFailure {
                    index,
                    message: e.to_string(),
                }),
            }
        }
        failures.sort_by_key(|failure| failure.index);

        debug!(
            attempted,
            failed = failures.len(),
            "Bulk upsert completed"
        );
        Ok(BulkWriteOutcome {
            attempted,
            failures,
        })
    }

    async fn get_document(&self, id: &Bson) -> Result<Option<Document>, TargetError> {
        self.ensure_open()?;
        self.collection
            .find_one(doc! { "_id": id.clone() })
            .await
            .map_err(classify_mongo_error)
    }

    async fn ping(&self) -> Result<(), TargetError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(classify_mongo_error)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TargetError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("MongoDB target already closed");
            return Ok(());
        }
        info!(collection = %self.config.collection, "Closed MongoDB target");
        Ok(())
    }

    fn metadata(&self) -> TargetMetadata {
        TargetMetadata::new("MongoDB", "mongodb")
            .with_property("uri", self.config.redacted_uri())
            .with_property("database", &self.config.database)
            .with_property("collection", &self.config.collection)
            .with_property("max_concurrency", self.config.max_concurrency.to_string())
    }
}
