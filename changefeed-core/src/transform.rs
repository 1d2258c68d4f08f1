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

//! Raw log entry to change event transformation.
//!
//! The filter accepts a superset of the relevant entries; the transform is
//! where false positives are dropped. [`DefaultTransform`] produces:
//!
//! | entry | event |
//! |-------|-------|
//! | `i` | `insert` with `fullDocument` |
//! | `u` with operators | `update` with `updateDescription` |
//! | `u` without operators | `replace` with `fullDocument` |
//! | `d` | `delete` |
//! | invalidating command | `invalidate` |
//! | transaction batch | one event per in-scope sub-operation, numbered by `txnOpIndex` |
//! | chunk-migration marker | `newShardDetected` (consumed by the merge point) |
//!
//! Everything else yields no event.

use crate::error::{ChangeStreamError, Result};
use crate::event::{ChangeEvent, OperationType, UpdateDescription};
use crate::filter::FilterSpec;
use crate::oplog::{OpType, OplogEntry};
use crate::resume_token::ResumeToken;
use crate::scope::{Namespace, Scope};
use bson::{doc, Bson, Document};
use tracing::trace;

/// Turns one raw log entry into zero or more change events.
pub trait Transform: Send + Sync {
    /// Transforms `entry`.
    ///
    /// Events are returned in resume-token order. An empty result means the
    /// entry was a false positive of the filter.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeStreamError::UnexpectedFieldType`] for malformed entries.
    fn apply(&self, entry: &OplogEntry) -> Result<Vec<ChangeEvent>>;
}

/// Reference transform for the stream's [`FilterSpec`].
#[derive(Debug, Clone)]
pub struct DefaultTransform {
    filter: FilterSpec,
}

impl DefaultTransform {
    #[must_use]
    pub fn new(filter: FilterSpec) -> Self {
        Self { filter }
    }

    fn in_scope(&self, ns: &str) -> bool {
        self.filter.pattern().matches(ns)
    }

    fn crud_event(&self, entry: &OplogEntry, txn_op_index: i64) -> Result<Option<ChangeEvent>> {
        if !self.in_scope(&entry.ns) {
            return Ok(None);
        }

        let (operation, document_key, full_document, update_description) = match entry.op {
            OpType::Insert => {
                let id = entry
                    .o
                    .get("_id")
                    .ok_or_else(|| ChangeStreamError::unexpected_type("o._id", "any", None))?;
                (OperationType::Insert, doc! { "_id": id.clone() }, Some(entry.o.clone()), None)
            }
            OpType::Update => {
                let key = entry
                    .o2
                    .clone()
                    .ok_or_else(|| ChangeStreamError::unexpected_type("o2", "object", None))?;
                if is_update_by_operators(&entry.o) {
                    (OperationType::Update, key, None, Some(update_description(&entry.o)?))
                } else {
                    (OperationType::Replace, key, Some(entry.o.clone()), None)
                }
            }
            OpType::Delete => (OperationType::Delete, entry.o.clone(), None, None),
            OpType::Noop if entry.is_chunk_migration_marker() => {
                let key = entry.o2.clone().unwrap_or_default();
                (OperationType::NewShardDetected, key, None, None)
            }
            OpType::Noop | OpType::Command => return Ok(None),
        };

        let id = ResumeToken::new(entry.ts, entry.ui, Some(document_key.clone()))
            .with_txn_op_index(txn_op_index);
        let mut event = ChangeEvent::new(id, operation, entry.ts)
            .with_namespace(Namespace::parse(&entry.ns))
            .with_document_key(document_key);
        event.full_document = full_document;
        event.update_description = update_description;
        event.wall_time = entry.wall;
        event.lsid = entry.lsid.clone();
        event.txn_number = entry.txn_number;
        Ok(Some(event))
    }

    fn invalidate_event(&self, entry: &OplogEntry) -> ChangeEvent {
        // Terminal tokens name no collection, so they cannot be resumed from.
        let id = ResumeToken::new(entry.ts, None, None).invalidated();
        let event = ChangeEvent::new(id, OperationType::Invalidate, entry.ts);
        let event = match self.filter.scope() {
            Scope::SingleCollection(ns) => event.with_namespace(ns.clone()),
            _ => event,
        };
        match entry.wall {
            Some(wall) => event.with_wall_time(wall),
            None => event,
        }
    }

    fn expand_transaction(&self, entry: &OplogEntry) -> Result<Vec<ChangeEvent>> {
        let mut events = Vec::new();
        for (index, op) in entry.apply_ops().enumerate() {
            let mut sub = OplogEntry::from_document(&with_outer_ts(op, entry))?;
            sub.lsid = entry.lsid.clone();
            sub.txn_number = entry.txn_number;
            sub.wall = entry.wall;
            if let Some(event) = self.crud_event(&sub, index as i64)? {
                events.push(event);
            }
        }
        Ok(events)
    }
}

impl Transform for DefaultTransform {
    fn apply(&self, entry: &OplogEntry) -> Result<Vec<ChangeEvent>> {
        let events = match entry.op {
            OpType::Command if entry.is_transaction_batch() => self.expand_transaction(entry)?,
            OpType::Command if self.filter.matches_invalidating_command(entry) => {
                vec![self.invalidate_event(entry)]
            }
            OpType::Command => Vec::new(),
            _ => self.crud_event(entry, 0)?.into_iter().collect(),
        };
        if events.is_empty() {
            trace!(ts = ?entry.ts, ns = %entry.ns, op = %entry.op, "Discarding oplog entry");
        }
        Ok(events)
    }
}

/// Sub-operations of `applyOps` carry no `ts`; they share the batch's.
fn with_outer_ts(op: &Document, entry: &OplogEntry) -> Document {
    let mut op = op.clone();
    op.insert("ts", entry.ts);
    op
}

fn is_update_by_operators(o: &Document) -> bool {
    o.keys().next().is_some_and(|key| key.starts_with('$'))
}

fn update_description(o: &Document) -> Result<UpdateDescription> {
    let updated_fields = match o.get("$set") {
        None => Document::new(),
        Some(Bson::Document(set)) => set.clone(),
        other => return Err(ChangeStreamError::unexpected_type("o.$set", "object", other)),
    };
    let removed_fields = match o.get("$unset") {
        None => Vec::new(),
        Some(Bson::Document(unset)) => unset.keys().cloned().collect(),
        other => return Err(ChangeStreamError::unexpected_type("o.$unset", "object", other)),
    };
    Ok(UpdateDescription {
        updated_fields,
        removed_fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::MIGRATE_CHUNK_TO_NEW_SHARD;
    use bson::{Timestamp, Uuid};

    fn ts(time: u32) -> Timestamp {
        Timestamp { time, increment: 0 }
    }

    fn transform(scope: Scope) -> DefaultTransform {
        DefaultTransform::new(FilterSpec::synthesize(&scope, ts(0), true, false))
    }

    fn coll_transform() -> DefaultTransform {
        transform(Scope::SingleCollection(Namespace::new("db", "coll")))
    }

    #[test]
    fn test_insert() {
        let uuid = Uuid::new();
        let entry = OplogEntry::new(ts(5), OpType::Insert, "db.coll", doc! { "_id": 1, "a": 1 })
            .with_uuid(uuid);
        let events = coll_transform().apply(&entry).unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert!(event.is_insert());
        assert_eq!(event.document_key, Some(doc! { "_id": 1 }));
        assert_eq!(event.full_document, Some(doc! { "_id": 1, "a": 1 }));
        assert_eq!(event.id.uuid, Some(uuid));
        assert_eq!(event.id.cluster_time, ts(5));
    }

    #[test]
    fn test_update_and_replace() {
        let update = OplogEntry::new(
            ts(5),
            OpType::Update,
            "db.coll",
            doc! { "$set": { "a": 2 }, "$unset": { "b": true } },
        )
        .with_o2(doc! { "_id": 1 });
        let event = coll_transform().apply(&update).unwrap().remove(0);
        assert!(event.is_update());
        let desc = event.update_description.unwrap();
        assert_eq!(desc.updated_fields, doc! { "a": 2 });
        assert_eq!(desc.removed_fields, vec!["b".to_string()]);

        let replace = OplogEntry::new(ts(6), OpType::Update, "db.coll", doc! { "_id": 1, "c": 3 })
            .with_o2(doc! { "_id": 1 });
        let event = coll_transform().apply(&replace).unwrap().remove(0);
        assert!(event.is_replace());
        assert_eq!(event.full_document, Some(doc! { "_id": 1, "c": 3 }));
    }

    #[test]
    fn test_update_without_o2_is_malformed() {
        let update = OplogEntry::new(ts(5), OpType::Update, "db.coll", doc! { "$set": { "a": 2 } });
        assert!(matches!(
            coll_transform().apply(&update),
            Err(ChangeStreamError::UnexpectedFieldType { .. })
        ));
    }

    #[test]
    fn test_false_positive_discarded() {
        let other = OplogEntry::new(ts(5), OpType::Insert, "db.other", doc! { "_id": 1 });
        assert!(coll_transform().apply(&other).unwrap().is_empty());

        let create = OplogEntry::new(ts(5), OpType::Command, "db.$cmd", doc! { "create": "x" });
        assert!(coll_transform().apply(&create).unwrap().is_empty());
    }

    #[test]
    fn test_drop_invalidates() {
        let uuid = Uuid::new();
        let drop = OplogEntry::new(ts(9), OpType::Command, "db.$cmd", doc! { "drop": "coll" })
            .with_uuid(uuid);
        let event = coll_transform().apply(&drop).unwrap().remove(0);
        assert!(event.is_invalidate());
        assert!(event.id.from_invalidate);
        assert_eq!(event.id.uuid, None);
        assert_eq!(event.cluster_time, ts(9));
        assert_eq!(event.collection_name(), Some("coll"));
    }

    #[test]
    fn test_transaction_expansion() {
        let batch = OplogEntry::new(
            ts(7),
            OpType::Command,
            "admin.$cmd",
            doc! { "applyOps": [
                { "op": "i", "ns": "db.coll", "o": { "_id": 1 } },
                { "op": "i", "ns": "db.other", "o": { "_id": 2 } },
                { "op": "d", "ns": "db.coll", "o": { "_id": 3 } },
            ] },
        )
        .in_transaction(doc! { "id": 1 }, 12);

        let events = coll_transform().apply(&batch).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id.txn_op_index, 0);
        assert_eq!(events[1].id.txn_op_index, 2);
        assert!(events[0].id < events[1].id);
        assert_eq!(events[1].txn_number, Some(12));
        assert!(events.iter().all(|e| e.cluster_time == ts(7)));
    }

    #[test]
    fn test_chunk_migration_marker() {
        let marker = OplogEntry::new(ts(3), OpType::Noop, "db.coll", doc! { "msg": "moved" })
            .with_o2(doc! { "type": MIGRATE_CHUNK_TO_NEW_SHARD });
        let event = transform(Scope::WholeCluster).apply(&marker).unwrap().remove(0);
        assert_eq!(event.operation, OperationType::NewShardDetected);
        assert!(event.operation.is_internal());
    }
}
