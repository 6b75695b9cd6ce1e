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

//! Penne Destinations - target store backends
//!
//! This crate provides [`Target`](penne_core::target::Target) implementations
//! that the replicator writes collapsed batches into.
//!
//! # Available Targets
//!
//! - **MongoDB**: a collection on any MongoDB deployment, written with
//!   concurrent upserting replaces
//!
//! # Features
//!
//! - `mongodb` - MongoDB target (default)
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use penne_destinations::mongodb::{MongoTarget, MongoTargetConfig};
//! use penne_core::target::Target;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MongoTargetConfig::builder()
//!         .uri("mongodb://replica:27017")
//!         .database("shop")
//!         .collection("orders")
//!         .build()?;
//!
//!     let target = MongoTarget::connect(config).await?;
//!     target.ping().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(feature = "mongodb")]
pub mod mongodb;
