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

//! Penne Core - change-feed replication engine
//!
//! This crate replicates inserts and updates from one MongoDB collection into
//! another document store, resuming from a durable checkpoint after restarts
//! and failures, and can diff the two sides on demand.
//!
//! # Key Components
//!
//! - **Events**: [`event`] defines change events and document key fingerprints
//! - **Change feed**: [`stream`] opens resumable feeds ([`stream::ChangeFeed`])
//! - **Batching**: [`batch`] buffers events and collapses them per document
//! - **Target**: [`target`] is the write-side seam; [`apply`] writes batches to it
//! - **Checkpoints**: [`state`] persists the last confirmed position
//! - **Controller**: [`pipeline`] runs the replication state machine
//! - **Reconciliation**: [`reconcile`] compares source and target documents
//! - **Health**: [`health`] judges replication from checkpoint age
//!
//! # Example
//!
//! ```rust
//! use penne_core::batch::Batch;
//! use penne_core::event::{ChangeEvent, Namespace, OperationType};
//! use bson::doc;
//! use chrono::Utc;
//!
//! let event = |seq: i32, a: i32, operation| ChangeEvent {
//!     operation,
//!     namespace: Namespace::new("shop", "orders"),
//!     document_key: Some(doc! { "_id": 1 }),
//!     full_document: Some(doc! { "_id": 1, "a": a }),
//!     cluster_time: Utc::now(),
//!     resume_token: doc! { "_data": seq },
//! };
//!
//! let batch = Batch::new(vec![
//!     event(1, 1, OperationType::Insert),
//!     event(2, 2, OperationType::Update),
//! ]);
//!
//! // One upsert per document, carrying the last image.
//! let entries = batch.collapse();
//! assert_eq!(entries.len(), 1);
//! assert_eq!(entries[0].document, doc! { "_id": 1, "a": 2 });
//! ```

pub mod alert;
pub mod apply;
pub mod batch;
pub mod config;
pub mod event;
pub mod health;
pub mod metrics;
pub mod pipeline;
pub mod reconcile;
pub mod source;
pub mod state;
pub mod stream;
pub mod target;
