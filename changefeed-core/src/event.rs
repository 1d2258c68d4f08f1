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

//! Change events delivered to consumers.
//!
//! Events are produced from raw log entries by a
//! [`Transform`](crate::transform::Transform) and carry their own resume
//! token in `_id`.
//!
//! # Examples
//!
//! ```rust
//! use bson::{doc, Timestamp};
//! use changefeed_core::event::{ChangeEvent, OperationType};
//! use changefeed_core::resume_token::ResumeToken;
//! use changefeed_core::scope::Namespace;
//!
//! let ts = Timestamp { time: 1_700_000_000, increment: 1 };
//! let event = ChangeEvent::new(
//!     ResumeToken::from_timestamp(ts).with_document_key(doc! { "_id": 1 }),
//!     OperationType::Insert,
//!     ts,
//! )
//! .with_namespace(Namespace::new("shop", "orders"))
//! .with_document_key(doc! { "_id": 1 })
//! .with_full_document(doc! { "_id": 1, "total": 12.5 });
//!
//! assert!(event.is_insert());
//! assert_eq!(event.collection_name(), Some("orders"));
//!
//! let decoded = ChangeEvent::from_document(&event.to_document().unwrap()).unwrap();
//! assert_eq!(decoded, event);
//! ```

use crate::error::{ChangeStreamError, Result};
use crate::resume_token::ResumeToken;
use crate::scope::Namespace;
use bson::{doc, Bson, Document, Timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Change event operation types.
///
/// The `Unknown` variant keeps decoding forward compatible with producers
/// that emit operation types this crate does not model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum OperationType {
    /// A document was inserted
    Insert,

    /// A document was modified in place
    Update,

    /// A document was replaced entirely
    Replace,

    /// A document was deleted
    Delete,

    /// The stream is no longer valid (drop, rename, database drop, collation change)
    Invalidate,

    /// A shard started holding data for the watched namespace.
    ///
    /// Internal: consumed by the merge point, never delivered.
    #[serde(rename = "kNewShardDetected")]
    NewShardDetected,

    /// An operation type this crate does not model
    #[serde(untagged)]
    Unknown(String),
}

impl OperationType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::Invalidate => "invalidate",
            Self::NewShardDetected => "kNewShardDetected",
            Self::Unknown(other) => other,
        }
    }

    /// Parses an `operationType` value; never fails.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "insert" => Self::Insert,
            "update" => Self::Update,
            "replace" => Self::Replace,
            "delete" => Self::Delete,
            "invalidate" => Self::Invalidate,
            "kNewShardDetected" => Self::NewShardDetected,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Returns true if this operation modifies data (insert, update, replace).
    #[inline]
    pub fn is_data_modification(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Replace)
    }

    /// Returns true for operations that never reach a consumer.
    #[inline]
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::NewShardDetected)
    }

    #[inline]
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Update description for partial document updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateDescription {
    /// Fields that were added or modified
    #[serde(rename = "updatedFields")]
    pub updated_fields: Document,

    /// Fields that were removed from the document
    #[serde(rename = "removedFields")]
    pub removed_fields: Vec<String>,
}

impl UpdateDescription {
    fn to_document(&self) -> Document {
        doc! {
            "updatedFields": self.updated_fields.clone(),
            "removedFields": self.removed_fields.clone(),
        }
    }

    fn from_document(doc: &Document) -> Result<Self> {
        let updated_fields = match doc.get("updatedFields") {
            Some(Bson::Document(d)) => d.clone(),
            other => {
                return Err(ChangeStreamError::unexpected_type(
                    "updateDescription.updatedFields",
                    "object",
                    other,
                ))
            }
        };
        let removed_fields = match doc.get("removedFields") {
            Some(Bson::Array(fields)) => fields
                .iter()
                .map(|field| match field {
                    Bson::String(s) => Ok(s.clone()),
                    other => Err(ChangeStreamError::unexpected_type(
                        "updateDescription.removedFields",
                        "array of strings",
                        Some(other),
                    )),
                })
                .collect::<Result<Vec<_>>>()?,
            other => {
                return Err(ChangeStreamError::unexpected_type(
                    "updateDescription.removedFields",
                    "array",
                    other,
                ))
            }
        };
        Ok(Self {
            updated_fields,
            removed_fields,
        })
    }
}

/// A change event.
///
/// All fields are owned so events move freely between tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Resume token naming this event's position
    pub id: ResumeToken,

    /// Type of operation that occurred
    pub operation: OperationType,

    /// Namespace of the change; absent for invalidate events on wide scopes
    pub namespace: Option<Namespace>,

    /// `_id` (and shard key, if any) of the changed document
    pub document_key: Option<Document>,

    /// Document after the change: inserts, replaces, and looked-up updates
    pub full_document: Option<Document>,

    /// Delta of an update
    pub update_description: Option<UpdateDescription>,

    /// Commit timestamp of the originating log entry
    pub cluster_time: Timestamp,

    /// Wall-clock time of the originating write
    pub wall_time: Option<DateTime<Utc>>,

    /// Transaction number, for events from a transaction
    pub txn_number: Option<i64>,

    /// Session id, for events from a transaction
    pub lsid: Option<Document>,
}

impl ChangeEvent {
    /// Creates an event with only the mandatory fields set.
    #[must_use]
    pub fn new(id: ResumeToken, operation: OperationType, cluster_time: Timestamp) -> Self {
        Self {
            id,
            operation,
            namespace: None,
            document_key: None,
            full_document: None,
            update_description: None,
            cluster_time,
            wall_time: None,
            txn_number: None,
            lsid: None,
        }
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = Some(namespace);
        self
    }

    #[must_use]
    pub fn with_document_key(mut self, document_key: Document) -> Self {
        self.document_key = Some(document_key);
        self
    }

    #[must_use]
    pub fn with_full_document(mut self, full_document: Document) -> Self {
        self.full_document = Some(full_document);
        self
    }

    #[must_use]
    pub fn with_update_description(mut self, update_description: UpdateDescription) -> Self {
        self.update_description = Some(update_description);
        self
    }

    #[must_use]
    pub fn with_wall_time(mut self, wall_time: DateTime<Utc>) -> Self {
        self.wall_time = Some(wall_time);
        self
    }

    #[must_use]
    pub fn with_transaction(mut self, lsid: Document, txn_number: i64) -> Self {
        self.lsid = Some(lsid);
        self.txn_number = Some(txn_number);
        self
    }

    #[inline]
    pub fn is_insert(&self) -> bool {
        self.operation == OperationType::Insert
    }

    #[inline]
    pub fn is_update(&self) -> bool {
        self.operation == OperationType::Update
    }

    #[inline]
    pub fn is_delete(&self) -> bool {
        self.operation == OperationType::Delete
    }

    #[inline]
    pub fn is_replace(&self) -> bool {
        self.operation == OperationType::Replace
    }

    /// Returns true for the event that ends the stream.
    #[inline]
    pub fn is_invalidate(&self) -> bool {
        self.operation == OperationType::Invalidate
    }

    /// Returns the collection name, if the event has one.
    #[inline]
    pub fn collection_name(&self) -> Option<&str> {
        self.namespace.as_ref()?.coll.as_deref()
    }

    /// Returns the database name, if the event has one.
    #[inline]
    pub fn database_name(&self) -> Option<&str> {
        self.namespace.as_ref().map(|ns| ns.db.as_str())
    }

    /// Returns the document ID if present in the document key.
    pub fn document_id(&self) -> Option<&Bson> {
        self.document_key.as_ref()?.get("_id")
    }

    /// Encodes the event document delivered to consumers.
    pub fn to_document(&self) -> Result<Document> {
        let mut doc = doc! {
            "_id": self.id.to_document()?,
            "operationType": self.operation.as_str(),
            "clusterTime": self.cluster_time,
        };
        if let Some(ns) = &self.namespace {
            let mut ns_doc = doc! { "db": ns.db.as_str() };
            if let Some(coll) = &ns.coll {
                ns_doc.insert("coll", coll.as_str());
            }
            doc.insert("ns", ns_doc);
        }
        if let Some(key) = &self.document_key {
            doc.insert("documentKey", key.clone());
        }
        if let Some(update) = &self.update_description {
            doc.insert("updateDescription", update.to_document());
        }
        if let Some(full) = &self.full_document {
            doc.insert("fullDocument", full.clone());
        }
        if let Some(wall) = self.wall_time {
            doc.insert("wallTime", bson::DateTime::from_chrono(wall));
        }
        if let Some(txn_number) = self.txn_number {
            doc.insert("txnNumber", txn_number);
        }
        if let Some(lsid) = &self.lsid {
            doc.insert("lsid", lsid.clone());
        }
        Ok(doc)
    }

    /// Decodes an event document, checking every field's type.
    ///
    /// # Errors
    ///
    /// - [`ChangeStreamError::UnexpectedFieldType`] if `_id` is not a
    ///   document, `operationType` not a string, `clusterTime` not a
    ///   timestamp, or an optional field has the wrong type.
    /// - [`ChangeStreamError::InvalidResumeToken`] if `_id` is not a token.
    pub fn from_document(doc: &Document) -> Result<Self> {
        let id = match doc.get("_id") {
            Some(Bson::Document(id)) => ResumeToken::from_document(id)?,
            other => return Err(ChangeStreamError::unexpected_type("_id", "object", other)),
        };
        let operation = match doc.get("operationType") {
            Some(Bson::String(op)) => OperationType::parse(op),
            other => {
                return Err(ChangeStreamError::unexpected_type(
                    "operationType",
                    "string",
                    other,
                ))
            }
        };
        let cluster_time = match doc.get("clusterTime") {
            Some(Bson::Timestamp(ts)) => *ts,
            other => {
                return Err(ChangeStreamError::unexpected_type(
                    "clusterTime",
                    "timestamp",
                    other,
                ))
            }
        };

        let namespace = match doc.get("ns") {
            None => None,
            Some(Bson::Document(ns)) => {
                let db = match ns.get("db") {
                    Some(Bson::String(db)) => db.clone(),
                    other => return Err(ChangeStreamError::unexpected_type("ns.db", "string", other)),
                };
                let coll = match ns.get("coll") {
                    None => None,
                    Some(Bson::String(coll)) => Some(coll.clone()),
                    other => {
                        return Err(ChangeStreamError::unexpected_type("ns.coll", "string", other))
                    }
                };
                Some(Namespace { db, coll })
            }
            other => return Err(ChangeStreamError::unexpected_type("ns", "object", other)),
        };

        let update_description = match doc.get("updateDescription") {
            None => None,
            Some(Bson::Document(d)) => Some(UpdateDescription::from_document(d)?),
            other => {
                return Err(ChangeStreamError::unexpected_type(
                    "updateDescription",
                    "object",
                    other,
                ))
            }
        };
        let wall_time = match doc.get("wallTime") {
            None => None,
            Some(Bson::DateTime(dt)) => Some(dt.to_chrono()),
            other => return Err(ChangeStreamError::unexpected_type("wallTime", "date", other)),
        };
        let txn_number = match doc.get("txnNumber") {
            None => None,
            Some(Bson::Int64(n)) => Some(*n),
            Some(Bson::Int32(n)) => Some(i64::from(*n)),
            other => return Err(ChangeStreamError::unexpected_type("txnNumber", "long", other)),
        };

        Ok(Self {
            id,
            operation,
            namespace,
            document_key: optional_document(doc, "documentKey")?,
            full_document: optional_document(doc, "fullDocument")?,
            update_description,
            cluster_time,
            wall_time,
            txn_number,
            lsid: optional_document(doc, "lsid")?,
        })
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} on {} at {}", self.operation, ns, self.id),
            None => write!(f, "{} at {}", self.operation, self.id),
        }
    }
}

fn optional_document(doc: &Document, field: &str) -> Result<Option<Document>> {
    match doc.get(field) {
        None | Some(Bson::Null) => Ok(None),
        Some(Bson::Document(d)) => Ok(Some(d.clone())),
        other => Err(ChangeStreamError::unexpected_type(field, "object", other)),
    }
}
