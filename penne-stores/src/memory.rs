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

//! In-memory checkpoint store implementation.
//!
//! This module provides a thread-safe, in-memory implementation of the
//! [`CheckpointStore`] trait.
//!
//! # Use Cases
//!
//! - **Local development and testing** - No files or services required
//! - **Dry runs** - Replicate without leaving a checkpoint behind
//!
//! # Limitations
//!
//! - **No persistence** - Checkpoints are lost on process restart, so every
//!   start begins at the current time
//! - **Single process only** - Locks only exclude tasks within this process
//!
//! For anything that must survive a restart, use
//! [`FileStore`](crate::file::FileStore).
//!
//! # Example
//!
//! ```rust
//! use penne_stores::memory::MemoryStore;
//! use penne_core::state::{Checkpoint, CheckpointStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::new();
//!
//! store.save("shop.orders", &Checkpoint::starting_now()).await?;
//! assert!(store.load("shop.orders").await?.is_some());
//!
//! store.clear("shop.orders").await?;
//! assert!(store.load("shop.orders").await?.is_none());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use penne_core::state::{Checkpoint, CheckpointError, CheckpointStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
struct LockEntry {
    owner: String,
    expires_at: Instant,
}

impl LockEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-memory checkpoint store.
///
/// Clones share the same underlying storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    checkpoints: Arc<RwLock<HashMap<String, Checkpoint>>>,
    locks: Arc<RwLock<HashMap<String, LockEntry>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        debug!("Creating new in-memory checkpoint store");
        Self::default()
    }

    /// Creates a store pre-populated with `checkpoints`.
    ///
    /// Useful in tests that start from a known position.
    #[must_use]
    pub fn with_checkpoints(checkpoints: HashMap<String, Checkpoint>) -> Self {
        debug!(
            checkpoint_count = checkpoints.len(),
            "Creating in-memory checkpoint store with initial checkpoints"
        );
        Self {
            checkpoints: Arc::new(RwLock::new(checkpoints)),
            locks: Arc::default(),
        }
    }

    /// Number of stored checkpoints.
    pub async fn len(&self) -> usize {
        self.checkpoints.read().await.len()
    }

    /// Returns `true` if no checkpoint is stored.
    pub async fn is_empty(&self) -> bool {
        self.checkpoints.read().await.is_empty()
    }

    /// Current owner of the lock on `key`, if it has not expired.
    pub async fn lock_owner(&self, key: &str) -> Option<String> {
        self.locks
            .read()
            .await
            .get(key)
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.owner.clone())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        trace!(key, "Loading checkpoint from memory");
        Ok(self.checkpoints.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints.insert(key.to_string(), checkpoint.clone());
        debug!(
            key,
            has_token = checkpoint.resume_token.is_some(),
            "Saved checkpoint to memory"
        );
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), CheckpointError> {
        if self.checkpoints.write().await.remove(key).is_none() {
            warn!(key, "Attempted to clear non-existent checkpoint");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), CheckpointError> {
        debug!("Closing in-memory checkpoint store (no-op)");
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, CheckpointError> {
        let mut locks = self.locks.write().await;
        let now = Instant::now();

        if let Some(entry) = locks.get(key) {
            if entry.is_live(now) && entry.owner != owner_id {
                debug!(key, owner = %entry.owner, "Lock held by another owner");
                return Ok(false);
            }
        }

        locks.insert(
            key.to_string(),
            LockEntry {
                owner: owner_id.to_string(),
                expires_at: now + ttl,
            },
        );
        debug!(key, owner = owner_id, ttl = ?ttl, "Acquired lock");
        Ok(true)
    }

    async fn refresh_lock(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, CheckpointError> {
        let mut locks = self.locks.write().await;
        let now = Instant::now();

        match locks.get_mut(key) {
            Some(entry) if entry.owner == owner_id && entry.is_live(now) => {
                entry.expires_at = now + ttl;
                trace!(key, owner = owner_id, "Refreshed lock");
                Ok(true)
            }
            _ => {
                warn!(key, owner = owner_id, "Cannot refresh lock not held by owner");
                Ok(false)
            }
        }
    }

    async fn release_lock(&self, key: &str, owner_id: &str) -> Result<bool, CheckpointError> {
        let mut locks = self.locks.write().await;
        match locks.get(key) {
            Some(entry) if entry.owner == owner_id => {
                locks.remove(key);
                debug!(key, owner = owner_id, "Released lock");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_locked(&self, key: &str) -> Result<bool, CheckpointError> {
        Ok(self
            .locks
            .read()
            .await
            .get(key)
            .is_some_and(|entry| entry.is_live(Instant::now())))
    }
}
