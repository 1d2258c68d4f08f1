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

//! In-memory operation log.
//!
//! [`MemoryOplog`] is an append-only, optionally truncated log held in
//! process. Any number of [`MemoryOplogReader`]s tail it concurrently; a
//! reader blocked in await-data wakes as soon as an entry is appended or the
//! log is closed.
//!
//! # Use Cases
//!
//! - **Tests** - deterministic logs without a server
//! - **Embedding** - driving change streams from an application-owned log
//!
//! # Example
//!
//! ```rust
//! use bson::{doc, Timestamp};
//! use changefeed_core::filter::FilterSpec;
//! use changefeed_core::oplog::{OpType, OplogEntry};
//! use changefeed_core::scope::{Namespace, Scope};
//! use changefeed_core::source::OplogReader;
//! use changefeed_sources::memory::MemoryOplog;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let log = MemoryOplog::new();
//! let ts = Timestamp { time: 1, increment: 0 };
//! log.append(OplogEntry::new(ts, OpType::Insert, "shop.orders", doc! { "_id": 1 })).await?;
//!
//! let scope = Scope::SingleCollection(Namespace::new("shop", "orders"));
//! let filter = FilterSpec::synthesize(&scope, ts, true, false);
//!
//! let mut reader = log.reader();
//! let batch = reader.next_batch(&filter, 10, Duration::from_millis(10)).await?.unwrap();
//! assert_eq!(batch.entries.len(), 1);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bson::{Bson, Document, Timestamp};
use changefeed_core::filter::FilterSpec;
use changefeed_core::oplog::OplogEntry;
use changefeed_core::resume_token::cmp_timestamps;
use changefeed_core::scope::Namespace;
use changefeed_core::source::{OplogBatch, OplogReader, PostImageLookup, SourceError};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Debug, Default)]
struct LogState {
    entries: Vec<OplogEntry>,
    /// Entries at or before this timestamp have been discarded.
    truncated_through: Option<Timestamp>,
    closed: bool,
}

impl LogState {
    /// Index of the first entry strictly after `ts`.
    fn index_after(&self, ts: Timestamp) -> usize {
        self.entries
            .partition_point(|e| cmp_timestamps(e.ts, ts) != Ordering::Greater)
    }

    /// Index of the first entry at or after `ts`.
    fn index_from(&self, ts: Timestamp) -> usize {
        self.entries
            .partition_point(|e| cmp_timestamps(e.ts, ts) == Ordering::Less)
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: RwLock<LogState>,
    appended: Notify,
}

/// Append-only operation log kept in memory.
///
/// Cloning is cheap; clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MemoryOplog {
    shared: Arc<Shared>,
}

impl MemoryOplog {
    /// Creates an empty, open log.
    #[must_use]
    pub fn new() -> Self {
        debug!("Creating in-memory oplog");
        Self::default()
    }

    /// Creates an open log holding `entries`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Other`] if the entries are not in strictly
    /// increasing timestamp order.
    pub async fn with_entries(entries: Vec<OplogEntry>) -> Result<Self, SourceError> {
        let log = Self::new();
        for entry in entries {
            log.append(entry).await?;
        }
        Ok(log)
    }

    /// Appends `entry` and wakes waiting readers.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Other`] if the log is closed or `entry` is not
    /// later than the last entry.
    pub async fn append(&self, entry: OplogEntry) -> Result<(), SourceError> {
        let mut state = self.shared.state.write().await;
        if state.closed {
            return Err(SourceError::Other("cannot append to a closed oplog".to_string()));
        }
        let last = state.entries.last().map(|e| e.ts).or(state.truncated_through);
        if let Some(last) = last {
            if cmp_timestamps(entry.ts, last) != Ordering::Greater {
                return Err(SourceError::Other(format!(
                    "oplog entries must be appended in timestamp order: {:?} is not after {:?}",
                    entry.ts, last
                )));
            }
        }
        trace!(ts = ?entry.ts, op = entry.op.as_code(), ns = %entry.ns, "Appending oplog entry");
        state.entries.push(entry);
        drop(state);

        self.shared.appended.notify_waiters();
        Ok(())
    }

    /// Closes the log. Readers drain the remaining entries, then report the end.
    pub async fn close(&self) {
        self.shared.state.write().await.closed = true;
        self.shared.appended.notify_waiters();
        debug!("In-memory oplog closed");
    }

    /// Discards every entry strictly before `ts`, as a capped log rolling over would.
    ///
    /// Returns the number of entries removed.
    pub async fn truncate_before(&self, ts: Timestamp) -> usize {
        let mut state = self.shared.state.write().await;
        let cut = state.index_from(ts);
        if cut == 0 {
            return 0;
        }
        let last_removed = state.entries[cut - 1].ts;
        state.entries.drain(..cut);
        state.truncated_through = Some(last_removed);
        debug!(removed = cut, through = ?last_removed, "Truncated in-memory oplog");
        cut
    }

    /// Returns the number of retained entries.
    pub async fn len(&self) -> usize {
        self.shared.state.read().await.entries.len()
    }

    /// Returns true if no entries are retained.
    pub async fn is_empty(&self) -> bool {
        self.shared.state.read().await.entries.is_empty()
    }

    /// Timestamp of the newest entry ever appended.
    pub async fn last_timestamp(&self) -> Option<Timestamp> {
        let state = self.shared.state.read().await;
        state.entries.last().map(|e| e.ts).or(state.truncated_through)
    }

    /// Returns a new reader positioned by the first filter it is given.
    #[must_use]
    pub fn reader(&self) -> MemoryOplogReader {
        MemoryOplogReader {
            log: self.clone(),
            scanned_through: None,
        }
    }
}

/// Tailing reader over a [`MemoryOplog`].
///
/// Cancel-safe: a fetch dropped while awaiting data leaves the read position
/// unchanged.
#[derive(Debug)]
pub struct MemoryOplogReader {
    log: MemoryOplog,
    /// Timestamp of the last entry scanned, matching or not.
    scanned_through: Option<Timestamp>,
}

impl MemoryOplogReader {
    /// Scans forward from the current position without waiting.
    async fn scan(
        &mut self,
        filter: &FilterSpec,
        batch_size: usize,
    ) -> Result<Scan, SourceError> {
        let state = self.log.shared.state.read().await;

        let begin = match self.scanned_through {
            Some(ts) => {
                if let Some(truncated) = state.truncated_through {
                    if cmp_timestamps(truncated, ts) == Ordering::Greater {
                        warn!(position = ?ts, truncated = ?truncated, "Read position fell off the in-memory oplog");
                        return Err(SourceError::Query(format!(
                            "oplog truncated past the read position {ts:?}"
                        )));
                    }
                }
                state.index_after(ts)
            }
            None if filter.is_inclusive() => state.index_from(filter.start()),
            None => state.index_after(filter.start()),
        };

        if begin == state.entries.len() {
            return Ok(if state.closed { Scan::Closed } else { Scan::Nothing });
        }

        let mut entries = Vec::new();
        let mut last_scanned = None;
        for entry in &state.entries[begin..] {
            last_scanned = Some(entry.ts);
            if filter.matches(entry) {
                entries.push(entry.clone());
                if entries.len() >= batch_size {
                    break;
                }
            }
        }

        self.scanned_through = last_scanned.or(self.scanned_through);
        Ok(Scan::Batch(entries))
    }

    fn high_water_mark(&self, filter: &FilterSpec) -> Timestamp {
        match self.scanned_through {
            Some(ts) => ts,
            None if filter.is_inclusive() => just_before(filter.start()),
            None => filter.start(),
        }
    }
}

enum Scan {
    Batch(Vec<OplogEntry>),
    Nothing,
    Closed,
}

#[async_trait]
impl OplogReader for MemoryOplogReader {
    async fn next_batch(
        &mut self,
        filter: &FilterSpec,
        batch_size: usize,
        max_await: Duration,
    ) -> Result<Option<OplogBatch>, SourceError> {
        let deadline = Instant::now() + max_await;
        let shared = Arc::clone(&self.log.shared);
        loop {
            // Registered before the scan so an append in between is not missed.
            let appended = shared.appended.notified();

            match self.scan(filter, batch_size.max(1)).await? {
                Scan::Batch(entries) => {
                    trace!(count = entries.len(), "Scanned in-memory oplog");
                    return Ok(Some(OplogBatch {
                        entries,
                        high_water_mark: self.high_water_mark(filter),
                    }));
                }
                Scan::Closed => return Ok(None),
                Scan::Nothing => {}
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Some(OplogBatch {
                    entries: Vec::new(),
                    high_water_mark: self.high_water_mark(filter),
                }));
            }
        }
    }

    async fn earliest_timestamp(&mut self) -> Result<Option<Timestamp>, SourceError> {
        let state = self.log.shared.state.read().await;
        Ok(state.entries.first().map(|e| e.ts).or(state.truncated_through))
    }
}

/// The greatest timestamp strictly before `ts`, saturating at zero.
fn just_before(ts: Timestamp) -> Timestamp {
    match (ts.time, ts.increment) {
        (0, 0) => ts,
        (time, 0) => Timestamp {
            time: time - 1,
            increment: u32::MAX,
        },
        (time, increment) => Timestamp {
            time,
            increment: increment - 1,
        },
    }
}

/// In-memory document store answering post-image lookups.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocuments {
    collections: Arc<RwLock<HashMap<String, Vec<Document>>>>,
}

impl MemoryDocuments {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `doc` into `ns`, replacing any document with the same `_id`.
    pub async fn upsert(&self, ns: &Namespace, doc: Document) {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(ns.full_name()).or_default();
        let id = doc.get("_id").cloned();
        match docs.iter_mut().find(|d| d.get("_id").cloned() == id) {
            Some(existing) => *existing = doc,
            None => docs.push(doc),
        }
    }

    /// Removes the document matching `document_key`; returns true if one was removed.
    pub async fn remove(&self, ns: &Namespace, document_key: &Document) -> bool {
        let mut collections = self.collections.write().await;
        let Some(docs) = collections.get_mut(&ns.full_name()) else {
            return false;
        };
        let before = docs.len();
        docs.retain(|d| !matches_key(d, document_key));
        docs.len() != before
    }
}

#[async_trait]
impl PostImageLookup for MemoryDocuments {
    async fn lookup(
        &self,
        ns: &Namespace,
        document_key: &Document,
    ) -> Result<Option<Document>, SourceError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(&ns.full_name())
            .and_then(|docs| docs.iter().find(|d| matches_key(d, document_key)))
            .cloned())
    }
}

/// True if every field of `key` is present in `doc` with an equal value.
fn matches_key(doc: &Document, key: &Document) -> bool {
    key.iter()
        .all(|(field, value)| doc.get(field).is_some_and(|v: &Bson| v == value))
}
