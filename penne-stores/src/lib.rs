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

//! Checkpoint store implementations for Penne.
//!
//! This crate provides backend implementations of the
//! [`CheckpointStore`](penne_core::state::CheckpointStore) trait, which
//! persists the last confirmed change-feed position and guards it with a
//! single-writer lock.
//!
//! # Available Stores
//!
//! - **Memory** (`memory` feature): process-local, for tests and dry runs
//! - **File** (`file` feature): one JSON document per key in a local
//!   directory, written atomically
//!
//! # Example: File Store
//!
//! ```rust,no_run
//! use penne_stores::file::FileStore;
//! use penne_core::state::{Checkpoint, CheckpointStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = FileStore::new("/var/lib/penne").await?;
//!
//! store.save("shop.orders", &Checkpoint::starting_now()).await?;
//! let loaded = store.load("shop.orders").await?;
//! assert!(loaded.is_some());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(feature = "file")]
pub mod file;
#[cfg(feature = "memory")]
pub mod memory;
