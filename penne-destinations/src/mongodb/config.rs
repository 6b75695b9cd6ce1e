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

//! Configuration for the MongoDB target.

use std::fmt;

/// Default number of operations in flight per bulk.
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

/// Configuration for [`MongoTarget`](super::MongoTarget).
///
/// `Debug` output hides any credentials embedded in the URI.
#[derive(Clone, PartialEq, Eq)]
pub struct MongoTargetConfig {
    /// Connection string of the target deployment
    pub uri: String,

    /// Target database name
    pub database: String,

    /// Target collection name
    pub collection: String,

    /// Maximum number of concurrent writes within one bulk
    pub max_concurrency: usize,
}

impl MongoTargetConfig {
    /// Creates a new builder for `MongoTargetConfig`.
    #[must_use]
    pub fn builder() -> MongoTargetConfigBuilder {
        MongoTargetConfigBuilder::default()
    }

    /// The URI with any `user:password@` part replaced by `***@`.
    pub fn redacted_uri(&self) -> String {
        redact_uri(&self.uri)
    }
}

impl fmt::Debug for MongoTargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MongoTargetConfig")
            .field("uri", &self.redacted_uri())
            .field("database", &self.database)
            .field("collection", &self.collection)
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

fn redact_uri(uri: &str) -> String {
    let Some(scheme_end) = uri.find("://") else {
        return uri.to_string();
    };
    let rest = &uri[scheme_end + 3..];
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}***{}", &uri[..scheme_end + 3], &rest[at..]),
        None => uri.to_string(),
    }
}

/// Builder for [`MongoTargetConfig`].
#[derive(Debug, Default)]
pub struct MongoTargetConfigBuilder {
    uri: Option<String>,
    database: Option<String>,
    collection: Option<String>,
    max_concurrency: Option<usize>,
}

impl MongoTargetConfigBuilder {
    /// Sets the connection string (required).
    #[must_use]
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Sets the database name (required).
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Sets the collection name (required).
    #[must_use]
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Sets how many writes of one bulk may run at once.
    ///
    /// Default: [`DEFAULT_MAX_CONCURRENCY`]
    #[must_use]
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Builds the `MongoTargetConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if required fields are missing or invalid:
    /// - `uri`, `database` and `collection` are required and must not be empty
    /// - `max_concurrency` must be greater than zero
    pub fn build(self) -> Result<MongoTargetConfig, String> {
        let uri = self.uri.ok_or("uri is required")?;
        if uri.is_empty() {
            return Err("uri cannot be empty".to_string());
        }

        let database = self.database.ok_or("database is required")?;
        if database.is_empty() {
            return Err("database cannot be empty".to_string());
        }

        let collection = self.collection.ok_or("collection is required")?;
        if collection.is_empty() {
            return Err("collection cannot be empty".to_string());
        }

        let max_concurrency = self.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY);
        if max_concurrency == 0 {
            return Err("max_concurrency must be greater than 0".to_string());
        }

        Ok(MongoTargetConfig {
            uri,
            database,
            collection,
            max_concurrency,
        })
    }
}
