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

//! Changefeed Core - Change Streams Derived from a Replicated Operation Log
//!
//! This crate turns a tailable, append-only operation log into ordered,
//! resumable, filtered streams of change events for one collection, one
//! database or a whole cluster.
//!
//! # Key Components
//!
//! - **Resume tokens**: [`resume_token`] defines the totally ordered position marker
//! - **Scopes**: [`scope`] classifies namespaces and derives namespace patterns
//! - **Filters**: [`filter`] synthesizes the predicate over raw log entries
//! - **Legality**: [`legality`] rejects streams that may not be opened
//! - **Resume positions**: [`resume`] reconciles the starting point options
//! - **Plans**: [`stage`] assembles the stages of an opened stream
//! - **Executor**: [`stream`] runs a plan against an [`source::OplogReader`]
//! - **Invalidation**: [`close_cursor`] ends a stream after its invalidate event
//! - **Sharding**: [`merge`] merges per-shard streams in resume-token order
//!
//! # Example
//!
//! ```rust
//! use bson::Timestamp;
//! use changefeed_core::legality::FeatureCompatibilityVersion;
//! use changefeed_core::options::ChangeStreamOptions;
//! use changefeed_core::resume::Role;
//! use changefeed_core::scope::Namespace;
//! use changefeed_core::source::CatalogSnapshot;
//! use changefeed_core::stage::{ChangeStreamPlan, StreamContext};
//!
//! let ctx = StreamContext::new(
//!     Role::ReplicaSetMember { last_applied: Timestamp { time: 1, increment: 0 } },
//!     FeatureCompatibilityVersion::V4_0,
//! );
//! let plan = ChangeStreamPlan::open(
//!     &Namespace::database("shop"),
//!     &ChangeStreamOptions::default(),
//!     &ctx,
//!     &CatalogSnapshot::new(),
//! )
//! .unwrap();
//!
//! let filter = plan.filter().unwrap();
//! assert!(filter.pattern().matches("shop.orders"));
//! assert!(!filter.pattern().matches("shop.system.views"));
//! ```

pub mod close_cursor;
pub mod error;
pub mod event;
pub mod filter;
pub mod legality;
pub mod merge;
pub mod metrics;
pub mod oplog;
pub mod options;
pub mod resume;
pub mod resume_token;
pub mod scope;
pub mod source;
pub mod stage;
pub mod stream;
pub mod transform;

pub use error::{ChangeStreamError, Result};
pub use event::{ChangeEvent, OperationType};
pub use resume_token::ResumeToken;
pub use stream::{ChangeStream, StreamItem};
