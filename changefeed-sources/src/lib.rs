// Copyright 2025 Changefeed Contributors
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

//! Operation log sources for changefeed.
//!
//! This crate provides implementations of the collaborator traits in
//! [`changefeed_core::source`].
//!
//! # Available Sources
//!
//! - **Memory**: [`memory::MemoryOplog`], an in-process log for tests and
//!   embedding, plus [`memory::MemoryDocuments`] for post-image lookups
//! - **MongoDB** (`mongodb-source` feature): tails `local.oplog.rs` of a
//!   replica set member
//!
//! # Feature Flags
//!
//! - `mongodb-source`: Enables the `MongoDB` oplog reader, catalog loader and
//!   post-image lookup (requires a replica set)
//!
//! # Example: MongoDB Source
//!
//! ```rust,ignore
//! use changefeed_core::legality::FeatureCompatibilityVersion;
//! use changefeed_core::options::ChangeStreamOptions;
//! use changefeed_core::resume::Role;
//! use changefeed_core::scope::Namespace;
//! use changefeed_core::stage::{ChangeStreamPlan, StreamContext};
//! use changefeed_core::stream::{ChangeStream, StreamConfig};
//! use changefeed_sources::mongodb::{load_catalog, MongoOplogConfig, MongoOplogReader};
//!
//! # async fn example(client: mongodb::Client, last_applied: bson::Timestamp) -> Result<(), Box<dyn std::error::Error>> {
//! let config = MongoOplogConfig::builder()
//!     .uri("mongodb://localhost:27017/?replicaSet=rs0")
//!     .build()?;
//!
//! let catalog = load_catalog(&client).await?;
//! let ctx = StreamContext::new(Role::ReplicaSetMember { last_applied }, FeatureCompatibilityVersion::V4_0);
//! let plan = ChangeStreamPlan::open(
//!     &Namespace::database("shop"),
//!     &ChangeStreamOptions::default(),
//!     &ctx,
//!     &catalog,
//! )?;
//!
//! let reader = MongoOplogReader::with_client(&client, &config);
//! let mut stream = ChangeStream::new(&plan, reader, StreamConfig::default())?;
//! let item = stream.next().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod memory;

#[cfg(feature = "mongodb-source")]
pub mod mongodb;
