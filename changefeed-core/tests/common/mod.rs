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

//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bson::{doc, Document, Timestamp};
use changefeed_core::filter::FilterSpec;
use changefeed_core::oplog::{OpType, OplogEntry};
use changefeed_core::source::{OplogBatch, OplogReader, SourceError};
use std::time::Duration;

pub fn ts(time: u32) -> Timestamp {
    Timestamp { time, increment: 0 }
}

pub fn insert(time: u32, ns: &str, id: i32) -> OplogEntry {
    OplogEntry::new(ts(time), OpType::Insert, ns, doc! { "_id": id })
}

pub fn update(time: u32, ns: &str, id: i32, set: Document) -> OplogEntry {
    OplogEntry::new(ts(time), OpType::Update, ns, doc! { "$set": set }).with_o2(doc! { "_id": id })
}

pub fn delete(time: u32, ns: &str, id: i32) -> OplogEntry {
    OplogEntry::new(ts(time), OpType::Delete, ns, doc! { "_id": id })
}

pub fn command(time: u32, db: &str, o: Document) -> OplogEntry {
    OplogEntry::new(ts(time), OpType::Command, format!("{db}.$cmd"), o)
}

pub fn noop(time: u32) -> OplogEntry {
    OplogEntry::new(ts(time), OpType::Noop, "", doc! { "msg": "periodic noop" })
}

/// Reader over a fixed log. Returns immediately instead of awaiting.
pub struct VecReader {
    entries: Vec<OplogEntry>,
    position: usize,
    scanned: Option<Timestamp>,
    earliest: Option<Timestamp>,
    closed: bool,
    fail_with: Option<String>,
}

impl VecReader {
    /// A closed log: once every entry is read the reader reports the end.
    pub fn closed(entries: Vec<OplogEntry>) -> Self {
        Self {
            entries,
            position: 0,
            scanned: None,
            earliest: None,
            closed: true,
            fail_with: None,
        }
    }

    /// An open log: once every entry is read fetches come back empty.
    pub fn open(entries: Vec<OplogEntry>) -> Self {
        Self {
            closed: false,
            ..Self::closed(entries)
        }
    }

    pub fn with_earliest(mut self, earliest: Timestamp) -> Self {
        self.earliest = Some(earliest);
        self
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::open(Vec::new())
        }
    }
}

#[async_trait]
impl OplogReader for VecReader {
    async fn next_batch(
        &mut self,
        filter: &FilterSpec,
        batch_size: usize,
        _max_await: Duration,
    ) -> Result<Option<OplogBatch>, SourceError> {
        if let Some(message) = &self.fail_with {
            return Err(SourceError::Connection(message.clone()));
        }
        if self.position >= self.entries.len() && self.closed {
            return Ok(None);
        }

        let mut matched = Vec::new();
        while self.position < self.entries.len() && matched.len() < batch_size {
            let entry = &self.entries[self.position];
            self.position += 1;
            self.scanned = Some(entry.ts);
            if filter.matches(entry) {
                matched.push(entry.clone());
            }
        }

        Ok(Some(OplogBatch {
            entries: matched,
            high_water_mark: self.scanned.unwrap_or(filter.start()),
        }))
    }

    async fn earliest_timestamp(&mut self) -> Result<Option<Timestamp>, SourceError> {
        Ok(self.earliest)
    }
}
