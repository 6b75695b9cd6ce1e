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

//! Event buffering and per-document collapse.
//!
//! The [`BatchAccumulator`] buffers events until the replicator decides to
//! flush: the buffer reached its size threshold, the flush timer fired, or a
//! shutdown drain forces it. Flush timing lives in the replicator's loop; the
//! accumulator only reports when it is full.
//!
//! Before a batch is written it is collapsed with [`Batch::collapse`]: one
//! entry per document key, holding the operation and post-image of the latest
//! event for that key. Events arrive in position order, so the latest arrival
//! is the highest position.
//!
//! ```rust
//! use penne_core::batch::BatchAccumulator;
//! use penne_core::event::{ChangeEvent, Namespace, OperationType};
//! use bson::doc;
//! use chrono::Utc;
//!
//! let mut acc = BatchAccumulator::new(100);
//! for (seq, a) in [(1, 1), (2, 2)] {
//!     acc.push(ChangeEvent {
//!         operation: if seq == 1 { OperationType::Insert } else { OperationType::Update },
//!         namespace: Namespace::new("db", "coll"),
//!         document_key: Some(doc! { "_id": 1 }),
//!         full_document: Some(doc! { "_id": 1, "a": a }),
//!         cluster_time: Utc::now(),
//!         resume_token: doc! { "_data": seq.to_string() },
//!     });
//! }
//!
//! let entries = acc.take().collapse();
//! assert_eq!(entries.len(), 1);
//! assert_eq!(entries[0].document, doc! { "_id": 1, "a": 2 });
//! ```

use crate::event::{ChangeEvent, OperationType};
use bson::Document;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{trace, warn};

/// Buffers change events between flushes.
#[derive(Debug)]
pub struct BatchAccumulator {
    events: Vec<ChangeEvent>,
    max_size: usize,
    first_buffered_at: Option<Instant>,
}

impl BatchAccumulator {
    /// Creates an accumulator that reports full at `max_size` events.
    ///
    /// A `max_size` of zero is treated as one.
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            events: Vec::with_capacity(max_size),
            max_size,
            first_buffered_at: None,
        }
    }

    /// Buffers `event`. Returns true when the size threshold is reached.
    pub fn push(&mut self, event: ChangeEvent) -> bool {
        if self.events.is_empty() {
            self.first_buffered_at = Some(Instant::now());
        }
        self.events.push(event);
        self.is_full()
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns true once the size threshold is reached.
    pub fn is_full(&self) -> bool {
        self.events.len() >= self.max_size
    }

    /// Size threshold.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Time since the oldest buffered event arrived.
    pub fn oldest_age(&self) -> Option<std::time::Duration> {
        self.first_buffered_at.map(|at| at.elapsed())
    }

    /// Removes and returns everything buffered.
    pub fn take(&mut self) -> Batch {
        self.first_buffered_at = None;
        let events = std::mem::replace(&mut self.events, Vec::with_capacity(self.max_size));
        Batch { events }
    }

    /// Drops everything buffered, returning how many events were discarded.
    pub fn discard(&mut self) -> usize {
        self.take().len()
    }
}

/// An ordered group of events flushed together.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    events: Vec<ChangeEvent>,
}

/// Final state of one document within a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct CollapsedEntry {
    /// Document key the upsert is filtered on
    pub key: Document,

    /// Operation of the latest event for this key
    pub operation: OperationType,

    /// Post-image of the latest event for this key
    pub document: Document,

    /// Earlier events for this key folded into this entry
    pub superseded: usize,
}

impl Batch {
    /// Creates a batch from events in arrival order.
    pub fn new(events: Vec<ChangeEvent>) -> Self {
        Self { events }
    }

    /// Number of events in the batch.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if the batch holds no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events in arrival order.
    pub fn events(&self) -> &[ChangeEvent] {
        &self.events
    }

    /// Token of the last event. Confirming the batch confirms this position.
    pub fn last_resume_token(&self) -> Option<&Document> {
        self.events.last().map(|e| &e.resume_token)
    }

    /// Observation time of the last event.
    pub fn last_cluster_time(&self) -> Option<DateTime<Utc>> {
        self.events.last().map(|e| e.cluster_time)
    }

    /// Collapses the batch to one entry per document key.
    ///
    /// The latest event for a key wins. Entries keep the order in which their
    /// key first appeared. Non-replicable events are skipped, as are events
    /// without a key or a post-image (an update whose document was gone by
    /// the time the post-image was looked up).
    pub fn collapse(&self) -> Vec<CollapsedEntry> {
        let mut entries: Vec<CollapsedEntry> = Vec::with_capacity(self.events.len());
        let mut index: HashMap<String, usize> = HashMap::with_capacity(self.events.len());

        for event in &self.events {
            if !event.is_replicable() {
                trace!(operation = %event.operation, "Skipping non-replicable event");
                continue;
            }

            let (Some(key), Some(document)) = (&event.document_key, &event.full_document) else {
                warn!(
                    operation = %event.operation,
                    document_key = ?event.document_key,
                    "Skipping event without document key or full document"
                );
                continue;
            };

            let fingerprint = crate::event::key_fingerprint(key);
            match index.get(&fingerprint) {
                Some(&slot) => {
                    let entry = &mut entries[slot];
                    entry.operation = event.operation.clone();
                    entry.document = document.clone();
                    entry.superseded += 1;
                }
                None => {
                    index.insert(fingerprint, entries.len());
                    entries.push(CollapsedEntry {
                        key: key.clone(),
                        operation: event.operation.clone(),
                        document: document.clone(),
                        superseded: 0,
                    });
                }
            }
        }

        entries
    }
}
