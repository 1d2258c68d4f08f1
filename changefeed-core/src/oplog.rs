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

//! Raw operation log entries.
//!
//! Only the fields the change stream machinery reads are modelled. Entries
//! arrive from an [`OplogReader`](crate::source::OplogReader) in commit order.

use crate::error::{ChangeStreamError, Result};
use bson::{doc, Bson, Document, Timestamp, Uuid};
use chrono::{DateTime, Utc};
use std::fmt;

/// Operation kind of a log entry (`op` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    /// `"i"`
    Insert,
    /// `"u"`
    Update,
    /// `"d"`
    Delete,
    /// `"c"`: DDL commands and transaction batches (`applyOps`)
    Command,
    /// `"n"`: no-op, used for heartbeats and topology markers
    Noop,
}

impl OpType {
    /// Parses the single-letter wire code.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "i" => Some(Self::Insert),
            "u" => Some(Self::Update),
            "d" => Some(Self::Delete),
            "c" => Some(Self::Command),
            "n" => Some(Self::Noop),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_code(&self) -> &'static str {
        match self {
            Self::Insert => "i",
            Self::Update => "u",
            Self::Delete => "d",
            Self::Command => "c",
            Self::Noop => "n",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

/// `o2.type` of the no-op written when a chunk migrates to a shard that
/// previously held no data for the collection.
pub const MIGRATE_CHUNK_TO_NEW_SHARD: &str = "migrateChunkToNewShard";

/// One entry of the replicated operation log.
#[derive(Debug, Clone, PartialEq)]
pub struct OplogEntry {
    /// Commit timestamp, strictly increasing along the log
    pub ts: Timestamp,

    /// Operation kind
    pub op: OpType,

    /// Target namespace, `db.$cmd` for commands
    pub ns: String,

    /// Operation payload
    pub o: Document,

    /// Secondary payload (update query, chunk-migration markers)
    pub o2: Option<Document>,

    /// Collection identity
    pub ui: Option<Uuid>,

    /// Set on writes performed by chunk migration
    pub from_migrate: bool,

    /// Session id, present on transaction entries
    pub lsid: Option<Document>,

    /// Transaction number, present on transaction entries
    pub txn_number: Option<i64>,

    /// Wall-clock time of the write
    pub wall: Option<DateTime<Utc>>,
}

impl OplogEntry {
    /// Creates an entry with only the mandatory fields set.
    pub fn new(ts: Timestamp, op: OpType, ns: impl Into<String>, o: Document) -> Self {
        Self {
            ts,
            op,
            ns: ns.into(),
            o,
            o2: None,
            ui: None,
            from_migrate: false,
            lsid: None,
            txn_number: None,
            wall: None,
        }
    }

    #[must_use]
    pub fn with_o2(mut self, o2: Document) -> Self {
        self.o2 = Some(o2);
        self
    }

    #[must_use]
    pub fn with_uuid(mut self, ui: Uuid) -> Self {
        self.ui = Some(ui);
        self
    }

    #[must_use]
    pub fn from_migrate(mut self) -> Self {
        self.from_migrate = true;
        self
    }

    /// Marks the entry as part of a transaction.
    #[must_use]
    pub fn in_transaction(mut self, lsid: Document, txn_number: i64) -> Self {
        self.lsid = Some(lsid);
        self.txn_number = Some(txn_number);
        self
    }

    #[must_use]
    pub fn with_wall(mut self, wall: DateTime<Utc>) -> Self {
        self.wall = Some(wall);
        self
    }

    /// Returns true for transaction batches: `applyOps` with session and txn number.
    #[must_use]
    pub fn is_transaction_batch(&self) -> bool {
        self.op == OpType::Command
            && self.lsid.is_some()
            && self.txn_number.is_some()
            && matches!(self.o.get("applyOps"), Some(Bson::Array(_)))
    }

    /// Returns true for the chunk-migration-to-new-shard no-op.
    #[must_use]
    pub fn is_chunk_migration_marker(&self) -> bool {
        self.op == OpType::Noop
            && self
                .o2
                .as_ref()
                .and_then(|o2| o2.get_str("type").ok())
                .is_some_and(|t| t == MIGRATE_CHUNK_TO_NEW_SHARD)
    }

    /// Returns the sub-operations of a transaction batch, skipping malformed elements.
    pub fn apply_ops(&self) -> impl Iterator<Item = &Document> {
        self.o
            .get_array("applyOps")
            .map(|ops| ops.as_slice())
            .unwrap_or(&[])
            .iter()
            .filter_map(Bson::as_document)
    }

    /// Decodes an entry, checking the type of every consumed field.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeStreamError::UnexpectedFieldType`] naming the first
    /// field that is missing or mistyped.
    pub fn from_document(doc: &Document) -> Result<Self> {
        let ts = match doc.get("ts") {
            Some(Bson::Timestamp(ts)) => *ts,
            other => return Err(ChangeStreamError::unexpected_type("ts", "timestamp", other)),
        };
        let op = match doc.get("op") {
            Some(Bson::String(code)) => OpType::from_code(code).ok_or_else(|| {
                ChangeStreamError::UnexpectedFieldType {
                    field: "op".to_string(),
                    expected: "one of i, u, d, c, n",
                    found: format!("\"{code}\""),
                }
            })?,
            other => return Err(ChangeStreamError::unexpected_type("op", "string", other)),
        };
        let ns = match doc.get("ns") {
            Some(Bson::String(ns)) => ns.clone(),
            other => return Err(ChangeStreamError::unexpected_type("ns", "string", other)),
        };
        let o = match doc.get("o") {
            Some(Bson::Document(o)) => o.clone(),
            other => return Err(ChangeStreamError::unexpected_type("o", "object", other)),
        };
        let o2 = optional_document(doc, "o2")?;
        let lsid = optional_document(doc, "lsid")?;

        let ui = match doc.get("ui") {
            None => None,
            Some(Bson::Binary(bin)) => Some(bin.to_uuid().map_err(|_| {
                ChangeStreamError::unexpected_type("ui", "uuid", doc.get("ui"))
            })?),
            other => return Err(ChangeStreamError::unexpected_type("ui", "uuid", other)),
        };
        let from_migrate = match doc.get("fromMigrate") {
            None => false,
            Some(Bson::Boolean(b)) => *b,
            other => return Err(ChangeStreamError::unexpected_type("fromMigrate", "bool", other)),
        };
        let txn_number = match doc.get("txnNumber") {
            None => None,
            Some(Bson::Int64(n)) => Some(*n),
            Some(Bson::Int32(n)) => Some(i64::from(*n)),
            other => return Err(ChangeStreamError::unexpected_type("txnNumber", "long", other)),
        };
        let wall = match doc.get("wall") {
            None => None,
            Some(Bson::DateTime(dt)) => Some(dt.to_chrono()),
            other => return Err(ChangeStreamError::unexpected_type("wall", "date", other)),
        };

        Ok(Self {
            ts,
            op,
            ns,
            o,
            o2,
            ui,
            from_migrate,
            lsid,
            txn_number,
            wall,
        })
    }

    /// Encodes the entry in the log's document form.
    #[must_use]
    pub fn to_document(&self) -> Document {
        let mut doc = doc! {
            "ts": self.ts,
            "op": self.op.as_code(),
            "ns": self.ns.as_str(),
            "o": self.o.clone(),
        };
        if let Some(o2) = &self.o2 {
            doc.insert("o2", o2.clone());
        }
        if let Some(ui) = self.ui {
            doc.insert("ui", ui);
        }
        if self.from_migrate {
            doc.insert("fromMigrate", true);
        }
        if let Some(lsid) = &self.lsid {
            doc.insert("lsid", lsid.clone());
        }
        if let Some(txn_number) = self.txn_number {
            doc.insert("txnNumber", txn_number);
        }
        if let Some(wall) = self.wall {
            doc.insert("wall", bson::DateTime::from_chrono(wall));
        }
        doc
    }
}

fn optional_document(doc: &Document, field: &str) -> Result<Option<Document>> {
    match doc.get(field) {
        None => Ok(None),
        Some(Bson::Document(d)) => Ok(Some(d.clone())),
        other => Err(ChangeStreamError::unexpected_type(field, "object", other)),
    }
}
