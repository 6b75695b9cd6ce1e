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

#![cfg(feature = "file")]

use bson::doc;
use chrono::{TimeZone, Utc};
use penne_core::state::{Checkpoint, CheckpointError, CheckpointStore};
use penne_stores::file::FileStore;
use std::time::Duration;
use tempfile::TempDir;

async fn store() -> (TempDir, FileStore) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let store = FileStore::new(dir.path()).await.expect("failed to open store");
    (dir, store)
}

#[tokio::test]
async fn test_missing_checkpoint_loads_as_none() {
    let (_dir, store) = store().await;
    assert!(store.load("shop.orders").await.unwrap().is_none());
}

#[tokio::test]
async fn test_save_and_load_round_trip() {
    let (_dir, store) = store().await;
    let at = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
    let checkpoint = Checkpoint::confirmed(doc! { "_data": "8265F1C2A4000000012B" }, at);

    store.save("shop.orders", &checkpoint).await.unwrap();

    assert_eq!(store.load("shop.orders").await.unwrap(), Some(checkpoint));
}

#[tokio::test]
async fn test_file_format_is_camel_case_json() {
    let (_dir, store) = store().await;
    let at = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
    store
        .save(
            "shop.orders",
            &Checkpoint {
                resume_token: None,
                timestamp: at,
            },
        )
        .await
        .unwrap();

    let raw = tokio::fs::read_to_string(store.checkpoint_path("shop.orders"))
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(json["resumeToken"], serde_json::Value::Null);
    assert_eq!(json["timestamp"], "2026-03-01T10:00:00Z");
}

#[tokio::test]
async fn test_save_leaves_no_temporary_file() {
    let (dir, store) = store().await;
    store
        .save("shop.orders", &Checkpoint::starting_now())
        .await
        .unwrap();
    store
        .save("shop.orders", &Checkpoint::starting_now())
        .await
        .unwrap();

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["shop.orders.json".to_string()]);
}

#[tokio::test]
async fn test_checkpoint_survives_reopen() {
    let (dir, store) = store().await;
    let checkpoint = Checkpoint::confirmed(doc! { "_data": "abc" }, Utc::now());
    store.save("shop.orders", &checkpoint).await.unwrap();
    drop(store);

    let reopened = FileStore::new(dir.path()).await.unwrap();
    assert_eq!(reopened.load("shop.orders").await.unwrap(), Some(checkpoint));
}

#[tokio::test]
async fn test_corrupt_checkpoint_is_an_error() {
    let (_dir, store) = store().await;
    tokio::fs::write(store.checkpoint_path("shop.orders"), b"{ not json")
        .await
        .unwrap();

    let err = store.load("shop.orders").await.unwrap_err();
    assert!(matches!(err, CheckpointError::Serialization(_)));
}

#[tokio::test]
async fn test_clear_removes_checkpoint() {
    let (_dir, store) = store().await;
    store
        .save("shop.orders", &Checkpoint::starting_now())
        .await
        .unwrap();

    store.clear("shop.orders").await.unwrap();
    store.clear("shop.orders").await.unwrap();
    assert!(store.load("shop.orders").await.unwrap().is_none());
}

#[tokio::test]
async fn test_lock_lifecycle() {
    let (_dir, store) = store().await;
    let key = "penne:lock:shop.orders";
    let ttl = Duration::from_secs(30);

    assert!(!store.is_locked(key).await.unwrap());
    assert!(store.try_acquire_lock(key, "a", ttl).await.unwrap());
    assert!(store.try_acquire_lock(key, "a", ttl).await.unwrap());
    assert!(!store.try_acquire_lock(key, "b", ttl).await.unwrap());
    assert!(store.refresh_lock(key, "a", ttl).await.unwrap());
    assert!(!store.refresh_lock(key, "b", ttl).await.unwrap());
    assert!(store.is_locked(key).await.unwrap());

    assert!(!store.release_lock(key, "b").await.unwrap());
    assert!(store.release_lock(key, "a").await.unwrap());
    assert!(!store.is_locked(key).await.unwrap());
}

#[tokio::test]
async fn test_lock_is_shared_across_store_instances() {
    let (dir, first) = store().await;
    let second = FileStore::new(dir.path()).await.unwrap();
    let key = "penne:lock:shop.orders";

    assert!(first
        .try_acquire_lock(key, "a", Duration::from_secs(30))
        .await
        .unwrap());
    assert!(!second
        .try_acquire_lock(key, "b", Duration::from_secs(30))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_expired_lock_is_taken_over() {
    let (_dir, store) = store().await;
    let key = "penne:lock:shop.orders";

    assert!(store
        .try_acquire_lock(key, "a", Duration::from_millis(50))
        .await
        .unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!store.is_locked(key).await.unwrap());
    assert!(!store
        .refresh_lock(key, "a", Duration::from_secs(30))
        .await
        .unwrap());
    assert!(store
        .try_acquire_lock(key, "b", Duration::from_secs(30))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_unreadable_lock_file_does_not_block() {
    let (dir, store) = store().await;
    tokio::fs::write(dir.path().join("penne_lock_shop.orders.lock"), b"")
        .await
        .unwrap();

    assert!(store
        .try_acquire_lock("penne:lock:shop.orders", "a", Duration::from_secs(30))
        .await
        .unwrap());
}
