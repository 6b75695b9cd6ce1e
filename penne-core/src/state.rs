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

//! Checkpoint persistence.
//!
//! A [`Checkpoint`] records the last replay position whose effects are
//! confirmed on the target. There is one checkpoint per source collection,
//! owned by the single replicator instance holding that collection's lock.
//!
//! The [`CheckpointStore`] trait abstracts the durable backend. Backends live
//! in the `penne-stores` crate.
//!
//! # Serialized form
//!
//! ```json
//! { "resumeToken": { "_data": "8263A1..." }, "timestamp": "2026-03-01T10:00:00Z" }
//! ```
//!
//! `resumeToken` is `null` when no event has been confirmed yet.
//!
//! # Example
//!
//! ```rust
//! use penne_core::state::{CheckpointError, CheckpointStore, Checkpoint};
//! use std::collections::HashMap;
//! use std::time::Duration;
//!
//! #[derive(Default)]
//! struct TestStore {
//!     checkpoints: tokio::sync::Mutex<HashMap<String, Checkpoint>>,
//! }
//!
//! #[async_trait::async_trait]
//! impl CheckpointStore for TestStore {
//!     async fn load(&self, key: &str) -> Result<Option<Checkpoint>, CheckpointError> {
//!         Ok(self.checkpoints.lock().await.get(key).cloned())
//!     }
//!
//!     async fn save(&self, key: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
//!         self.checkpoints.lock().await.insert(key.to_string(), checkpoint.clone());
//!         Ok(())
//!     }
//!
//!     async fn clear(&self, key: &str) -> Result<(), CheckpointError> {
//!         self.checkpoints.lock().await.remove(key);
//!         Ok(())
//!     }
//!
//!     async fn close(&self) -> Result<(), CheckpointError> {
//!         Ok(())
//!     }
//!
//!     async fn try_acquire_lock(&self, _key: &str, _owner: &str, _ttl: Duration) -> Result<bool, CheckpointError> {
//!         Ok(true)
//!     }
//!
//!     async fn refresh_lock(&self, _key: &str, _owner: &str, _ttl: Duration) -> Result<bool, CheckpointError> {
//!         Ok(true)
//!     }
//!
//!     async fn release_lock(&self, _key: &str, _owner: &str) -> Result<bool, CheckpointError> {
//!         Ok(true)
//!     }
//!
//!     async fn is_locked(&self, _key: &str) -> Result<bool, CheckpointError> {
//!         Ok(false)
//!     }
//! }
//! ```

use bson::Document;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::stream::ResumePosition;

/// Last confirmed replay position for one source collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Token of the last event whose effects are applied, if any.
    pub resume_token: Option<Document>,

    /// When this position was confirmed.
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// A checkpoint with no token, starting at the current instant.
    pub fn starting_now() -> Self {
        Self {
            resume_token: None,
            timestamp: Utc::now(),
        }
    }

    /// A checkpoint confirming everything up to and including `token`.
    pub fn confirmed(token: Document, at: DateTime<Utc>) -> Self {
        Self {
            resume_token: Some(token),
            timestamp: at,
        }
    }

    /// Same position, re-stamped with `at`. Used for idle heartbeats.
    #[must_use]
    pub fn touched(&self, at: DateTime<Utc>) -> Self {
        Self {
            resume_token: self.resume_token.clone(),
            timestamp: at,
        }
    }

    /// Whole seconds between the checkpoint timestamp and `now`.
    ///
    /// Negative when the checkpoint was written by a host with a clock ahead
    /// of ours.
    pub fn seconds_behind(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_seconds()
    }

    /// Position to reopen the change feed at.
    ///
    /// A stored token always wins. Without one the feed starts at
    /// `start_override` when given, otherwise at the checkpoint timestamp.
    pub fn resume_position(
        &self,
        start_override: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> ResumePosition {
        match &self.resume_token {
            Some(token) => ResumePosition::after_token(token.clone()).with_end(end),
            None => {
                ResumePosition::starting_at(start_override.unwrap_or(self.timestamp)).with_end(end)
            }
        }
    }
}

/// Durable backend for checkpoints and the single-writer lock.
///
/// `save` must be crash-atomic: after a crash, `load` returns either the
/// previous checkpoint or the new one, never a torn write.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Loads the checkpoint stored under `key`.
    ///
    /// Returns `None` if no checkpoint exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read or holds malformed data.
    async fn load(&self, key: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Replaces the checkpoint stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be persisted. The previous
    /// checkpoint remains intact.
    async fn save(&self, key: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Removes the checkpoint stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be removed.
    async fn clear(&self, key: &str) -> Result<(), CheckpointError>;

    /// Releases backend resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be closed cleanly.
    async fn close(&self) -> Result<(), CheckpointError>;

    /// Tries to acquire the exclusive lock for `key` on behalf of `owner_id`.
    ///
    /// The lock expires after `ttl` unless refreshed.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Lock acquired (or already held by `owner_id`)
    /// * `Ok(false)` - Lock held by another owner
    /// * `Err(_)` - Backend failure
    async fn try_acquire_lock(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, CheckpointError>;

    /// Extends the lock held by `owner_id`.
    ///
    /// Returns `Ok(false)` if the lock expired or now belongs to someone else.
    async fn refresh_lock(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, CheckpointError>;

    /// Releases the lock if held by `owner_id`.
    ///
    /// Returns `Ok(false)` if the lock was not held by `owner_id`.
    async fn release_lock(&self, key: &str, owner_id: &str) -> Result<bool, CheckpointError>;

    /// Returns whether any owner currently holds an unexpired lock on `key`.
    async fn is_locked(&self, key: &str) -> Result<bool, CheckpointError>;
}

/// Errors that can occur during checkpoint store operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored checkpoint could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend unreachable
    #[error("Connection error: {0}")]
    Connection(String),

    /// Other errors
    #[error("Checkpoint store error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        CheckpointError::Serialization(err.to_string())
    }
}
