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

//! Shared fixtures for the Penne benchmarks.

use bson::doc;
use chrono::{Duration, TimeZone, Utc};
use penne_core::event::{ChangeEvent, Namespace, OperationType};

/// Builds `count` events spread over `distinct_keys` documents.
///
/// Every third event is an update; the rest are inserts. Resume tokens and
/// cluster times increase with the event index.
pub fn events(count: usize, distinct_keys: usize) -> Vec<ChangeEvent> {
    let base = Utc
        .with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now);
    let distinct_keys = distinct_keys.max(1);

    (0..count)
        .map(|i| {
            let id = (i % distinct_keys) as i64;
            ChangeEvent {
                operation: if i % 3 == 0 {
                    OperationType::Update
                } else {
                    OperationType::Insert
                },
                namespace: Namespace::new("bench_db", "orders"),
                document_key: Some(doc! { "_id": id }),
                full_document: Some(doc! {
                    "_id": id,
                    "customer": format!("customer_{}", i % 1000),
                    "total": i as i64,
                    "lines": [{ "sku": "A-1", "qty": 2 }, { "sku": "B-7", "qty": 1 }],
                }),
                cluster_time: base + Duration::milliseconds(i as i64),
                resume_token: doc! { "_data": format!("{i:016X}") },
            }
        })
        .collect()
}
