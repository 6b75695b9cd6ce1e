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

//! Local file checkpoint store.
//!
//! Each checkpoint lives in `<dir>/<key>.json`:
//!
//! ```json
//! {
//!   "resumeToken": { "_data": "8265F1C2A4000000012B0229296E04" },
//!   "timestamp": "2026-03-01T10:00:00.123Z"
//! }
//! ```
//!
//! Writes go to a temporary file that is then renamed over the checkpoint,
//! so a crash leaves either the previous or the new checkpoint, never a
//! partial one.
//!
//! Locks live in `<dir>/<key>.lock` as `{"owner": ..., "expiresAt": ...}`.
//! A fresh lock file is created exclusively; an expired one is replaced.
//! Two processes racing to replace the same expired lock can both succeed,
//! so the lock guards against accidental double starts rather than providing
//! consensus.
//!
//! Keys are mapped to file names by replacing every character outside
//! `[A-Za-z0-9._-]` with `_`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use penne_core::state::{Checkpoint, CheckpointError, CheckpointStore};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockFile {
    owner: String,
    expires_at: DateTime<Utc>,
}

impl LockFile {
    fn new(owner: &str, ttl: Duration) -> Result<Self, CheckpointError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| CheckpointError::Other(format!("invalid lock ttl: {e}")))?;
        Ok(Self {
            owner: owner.to_string(),
            expires_at: Utc::now() + ttl,
        })
    }

    fn is_live(&self) -> bool {
        self.expires_at > Utc::now()
    }
}

/// Checkpoint store backed by JSON files in a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    /// Serializes lock-file read-modify-write within this process
    lock_ops: Arc<Mutex<()>>,
}

impl FileStore {
    /// Opens a store in `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "Opened file checkpoint store");
        Ok(Self {
            dir,
            lock_ops: Arc::new(Mutex::new(())),
        })
    }

    /// Directory holding the checkpoint files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the checkpoint file for `key`.
    pub fn checkpoint_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(key)))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", file_stem(key)))
    }

    async fn read_lock(&self, path: &Path) -> Result<Option<LockFile>, CheckpointError> {
        match fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(lock) => Ok(Some(lock)),
                Err(e) => {
                    // Unreadable locks count as absent.
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable lock file");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn file_stem(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Writes `bytes` to `path` through a temporary sibling and a rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl CheckpointStore for FileStore {
    async fn load(&self, key: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.checkpoint_path(key);
        trace!(path = %path.display(), "Loading checkpoint");

        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(key, "No checkpoint file");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.checkpoint_path(key);
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        write_atomic(&path, &bytes).await?;
        debug!(
            key,
            has_token = checkpoint.resume_token.is_some(),
            timestamp = %checkpoint.timestamp,
            "Saved checkpoint"
        );
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), CheckpointError> {
        match fs::remove_file(self.checkpoint_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(key, "Attempted to clear non-existent checkpoint");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&self) -> Result<(), CheckpointError> {
        debug!("Closing file checkpoint store (no-op)");
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, CheckpointError> {
        let _guard = self.lock_ops.lock().await;
        let path = self.lock_path(key);
        let lock = LockFile::new(owner_id, ttl)?;
        let bytes = serde_json::to_vec(&lock)?;

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut file) => {
                file.write_all(&bytes).await?;
                file.sync_all().await?;
                debug!(key, owner = owner_id, "Acquired lock");
                return Ok(true);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(existing) = self.read_lock(&path).await? {
            if existing.is_live() && existing.owner != owner_id {
                debug!(key, owner = %existing.owner, "Lock held by another owner");
                return Ok(false);
            }
        }

        write_atomic(&path, &bytes).await?;
        debug!(key, owner = owner_id, "Took over expired or own lock");
        Ok(true)
    }

    async fn refresh_lock(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, CheckpointError> {
        let _guard = self.lock_ops.lock().await;
        let path = self.lock_path(key);

        match self.read_lock(&path).await? {
            Some(existing) if existing.owner == owner_id && existing.is_live() => {
                let bytes = serde_json::to_vec(&LockFile::new(owner_id, ttl)?)?;
                write_atomic(&path, &bytes).await?;
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
        let _guard = self.lock_ops.lock().await;
        let path = self.lock_path(key);

        match self.read_lock(&path).await? {
            Some(existing) if existing.owner == owner_id => {
                fs::remove_file(&path).await?;
                debug!(key, owner = owner_id, "Released lock");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_locked(&self, key: &str) -> Result<bool, CheckpointError> {
        Ok(self
            .read_lock(&self.lock_path(key))
            .await?
            .is_some_and(|lock| lock.is_live()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem_sanitizes() {
        assert_eq!(file_stem("shop.orders"), "shop.orders");
        assert_eq!(file_stem("penne:lock:shop.orders"), "penne_lock_shop.orders");
        assert_eq!(file_stem("a/b\\c"), "a_b_c");
    }

    #[test]
    fn test_lock_file_format() {
        let lock = LockFile::new("instance-1", Duration::from_secs(30)).unwrap();
        let json = serde_json::to_value(&lock).unwrap();
        assert_eq!(json["owner"], "instance-1");
        assert!(json["expiresAt"].is_string());
        assert!(lock.is_live());
    }
}
