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

//! Replication with in-memory collaborators.
//!
//! Runs the full replicator against a scripted change feed, an in-memory
//! target and the in-memory checkpoint store. No MongoDB needed.
//!
//! ```bash
//! cargo run -p penne-stores --example replicate_in_memory
//! ```

use bson::doc;
use chrono::Utc;
use penne_core::alert::AlertSink;
use penne_core::config::ReplicatorConfig;
use penne_core::event::{ChangeEvent, Namespace, OperationType};
use penne_core::pipeline::Replicator;
use penne_core::state::CheckpointStore;
use penne_core::stream::MockChangeFeed;
use penne_core::target::MemoryTarget;
use penne_stores::memory::MemoryStore;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn change(seq: i32, id: i32, operation: OperationType, status: &str) -> ChangeEvent {
    ChangeEvent {
        operation,
        namespace: Namespace::new("shop", "orders"),
        document_key: Some(doc! { "_id": id }),
        full_document: Some(doc! { "_id": id, "status": status }),
        cluster_time: Utc::now(),
        resume_token: doc! { "_data": format!("{seq:08}") },
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let feed = Arc::new(MockChangeFeed::new());
    let target = Arc::new(MemoryTarget::new());
    let store = Arc::new(MemoryStore::new());

    let config = ReplicatorConfig::builder()
        .namespace(Namespace::new("shop", "orders"))
        .batch_size(10)
        .flush_interval(Duration::from_millis(200))
        .without_health_monitor()
        .build()?;
    let checkpoint_key = config.checkpoint_key();

    let mut replicator = Replicator::new(
        config,
        Arc::clone(&feed),
        Arc::clone(&target),
        Arc::clone(&store),
        AlertSink::log_only(),
    );
    replicator.start().await?;

    // Wait for the feed to open before producing changes.
    while feed.open_count() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    feed.push(change(1, 1, OperationType::Insert, "new"));
    feed.push(change(2, 2, OperationType::Insert, "new"));
    feed.push(change(3, 1, OperationType::Update, "paid"));
    feed.push(change(4, 2, OperationType::Delete, "gone"));
    feed.push(change(5, 1, OperationType::Update, "shipped"));

    tokio::time::sleep(Duration::from_millis(500)).await;
    let stats = replicator.stop().await?;

    info!(
        events = stats.events_received,
        batches = stats.batches_applied,
        upserts = target.upsert_count(),
        "Replication stopped"
    );
    for document in target.documents() {
        info!(%document, "Target document");
    }
    if let Some(checkpoint) = store.load(&checkpoint_key).await? {
        info!(
            token = ?checkpoint.resume_token,
            timestamp = %checkpoint.timestamp,
            "Final checkpoint"
        );
    }

    Ok(())
}
