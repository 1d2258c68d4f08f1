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

//! Interfaces to the collaborators a change stream reads from.
//!
//! - [`OplogReader`]: tailable, filtered access to the operation log.
//! - [`CollectionCatalog`]: collection uuid to namespace resolution.
//! - [`PostImageLookup`]: current version of a document, for `updateLookup`.
//!
//! Implementations live in the `changefeed-sources` crate.

use crate::filter::FilterSpec;
use crate::oplog::OplogEntry;
use crate::scope::Namespace;
use async_trait::async_trait;
use bson::{Document, Timestamp, Uuid};
use std::collections::HashMap;
use std::time::Duration;

/// Faults raised by a collaborator.
///
/// Passed through to the consumer unmodified; the change stream never
/// retries them.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Could not reach the log storage
    #[error("Connection error: {0}")]
    Connection(String),

    /// The storage rejected or failed the read
    #[error("Query error: {0}")]
    Query(String),

    /// A returned document could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Other errors
    #[error("Source error: {0}")]
    Other(String),
}

/// Entries returned by one fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct OplogBatch {
    /// Matching entries in commit order
    pub entries: Vec<OplogEntry>,

    /// Highest log timestamp the reader has scanned past, matching or not.
    ///
    /// No later fetch returns an entry at or below this timestamp.
    pub high_water_mark: Timestamp,
}

impl OplogBatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Tailable reader over the operation log.
///
/// A reader is bound to one stream: the first fetch positions it at
/// `filter.start()`, later fetches continue where the previous one stopped.
#[async_trait]
pub trait OplogReader: Send {
    /// Fetches up to `batch_size` entries matching `filter`.
    ///
    /// Waits at most `max_await` for new entries; an empty batch means the
    /// wait elapsed. Returns `Ok(None)` once the log is closed and every
    /// entry has been returned.
    ///
    /// Must be cancel safe: the executor drops a fetch that outlives
    /// `max_await` by a short grace, and no entry may be lost when it does.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    async fn next_batch(
        &mut self,
        filter: &FilterSpec,
        batch_size: usize,
        max_await: Duration,
    ) -> Result<Option<OplogBatch>, SourceError>;

    /// Returns the timestamp of the oldest entry still retained, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    async fn earliest_timestamp(&mut self) -> Result<Option<Timestamp>, SourceError>;
}

/// Resolves collection uuids to namespaces.
pub trait CollectionCatalog: Send + Sync {
    /// Returns the namespace of the collection with `uuid`, if it exists.
    fn lookup_namespace(&self, uuid: &Uuid) -> Option<Namespace>;
}

/// In-memory catalog snapshot.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    collections: HashMap<[u8; 16], Namespace>,
}

impl CatalogSnapshot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a collection.
    pub fn insert(&mut self, uuid: Uuid, ns: Namespace) {
        self.collections.insert(uuid.bytes(), ns);
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with_collection(mut self, uuid: Uuid, ns: Namespace) -> Self {
        self.insert(uuid, ns);
        self
    }

    /// Forgets a collection, as if it had been dropped.
    pub fn remove(&mut self, uuid: &Uuid) -> Option<Namespace> {
        self.collections.remove(&uuid.bytes())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.collections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

impl CollectionCatalog for CatalogSnapshot {
    fn lookup_namespace(&self, uuid: &Uuid) -> Option<Namespace> {
        self.collections.get(&uuid.bytes()).cloned()
    }
}

/// Fetches the current version of a document.
#[async_trait]
pub trait PostImageLookup: Send + Sync {
    /// Looks up the document identified by `document_key` in `ns`.
    ///
    /// Returns `Ok(None)` if the document no longer exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    async fn lookup(
        &self,
        ns: &Namespace,
        document_key: &Document,
    ) -> Result<Option<Document>, SourceError>;
}
