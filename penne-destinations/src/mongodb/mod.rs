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

//! MongoDB target.
//!
//! Writes each collapsed operation as a `replaceOne` with `upsert: true`,
//! filtered on the event's document key. Operations in one bulk run
//! concurrently, up to [`MongoTargetConfig::max_concurrency`] at a time, and
//! complete in no particular order. Callers must therefore never send two
//! operations for the same document in one bulk.
//!
//! # Error handling
//!
//! Network-class failures (I/O, server selection, a cleared pool) abort the
//! whole bulk with [`TargetError::ConnectionError`](penne_core::target::TargetError)
//! so the caller can replay it. Any other failure is reported per operation in
//! the [`BulkWriteOutcome`](penne_core::target::BulkWriteOutcome).
//!
//! # Example
//!
//! ```rust,ignore
//! use penne_destinations::mongodb::{MongoTarget, MongoTargetConfig};
//!
//! let config = MongoTargetConfig::builder()
//!     .uri("mongodb://replica:27017")
//!     .database("shop")
//!     .collection("orders")
//!     .max_concurrency(32)
//!     .build()?;
//!
//! let target = MongoTarget::connect(config).await?;
//! ```

mod config;
mod destination;

pub use config::{MongoTargetConfig, MongoTargetConfigBuilder, DEFAULT_MAX_CONCURRENCY};
pub use destination::MongoTarget;
