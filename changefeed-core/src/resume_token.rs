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

//! Resume tokens: opaque, totally ordered stream positions.
//!
//! A token names the position of one event in a derived stream. Consumers
//! store it and hand it back (`resumeAfter`) to re-derive the same stream
//! from just after that event.
//!
//! # Wire form
//!
//! ```text
//! {
//!     clusterTime: Timestamp,
//!     version: Int32,
//!     txnOpIndex: Int64,
//!     fromInvalidate: Boolean,   // defaults to false when absent
//!     uuid: BinData(4),          // optional
//!     documentKey: Document,     // optional
//! }
//! ```
//!
//! # Ordering
//!
//! Tokens sort by `(clusterTime, txnOpIndex, uuid, documentKey)`, where an
//! absent `uuid`/`documentKey` sorts before any present one. Tokens with an
//! identical position are further ordered by `fromInvalidate` (the invalidate
//! token follows the event that caused it). `version` is a format tag and
//! takes no part: tokens differing only in `version` are equal.
//!
//! ```rust
//! use bson::{doc, Timestamp};
//! use changefeed_core::resume_token::ResumeToken;
//!
//! let ts = Timestamp { time: 100, increment: 1 };
//! let first = ResumeToken::from_timestamp(ts);
//! let second = first.clone().with_txn_op_index(1);
//! assert!(first < second);
//!
//! let encoded = second.to_document().unwrap();
//! assert_eq!(ResumeToken::from_document(&encoded).unwrap(), second);
//! ```

use crate::error::{ChangeStreamError, Result};
use bson::{Bson, Document, Timestamp, Uuid};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Token format version written by this crate.
pub const TOKEN_VERSION: i32 = 0;

/// Position marker of one event in a derived change stream.
///
/// Immutable once created: tokens are compared and re-encoded, never edited
/// in place. Builder-style `with_*` methods return new tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResumeToken {
    /// Commit timestamp of the log entry
    #[serde(rename = "clusterTime")]
    pub cluster_time: Timestamp,

    /// Format tag
    #[serde(default)]
    pub version: i32,

    /// Ordinal within a transaction batch sharing one `clusterTime`
    #[serde(rename = "txnOpIndex", default)]
    pub txn_op_index: i64,

    /// True only for the synthetic token of an invalidate event
    #[serde(rename = "fromInvalidate", default)]
    pub from_invalidate: bool,

    /// Collection identity
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub uuid: Option<Uuid>,

    /// Key of the changed document
    #[serde(rename = "documentKey", skip_serializing_if = "Option::is_none", default)]
    pub document_key: Option<Document>,
}

impl ResumeToken {
    /// Creates a collection-less, key-less token at `cluster_time`.
    ///
    /// This is the form used for positions derived from a timestamp alone.
    #[must_use]
    pub fn from_timestamp(cluster_time: Timestamp) -> Self {
        Self {
            cluster_time,
            version: TOKEN_VERSION,
            txn_op_index: 0,
            from_invalidate: false,
            uuid: None,
            document_key: None,
        }
    }

    /// Creates the token of an event on a known collection.
    #[must_use]
    pub fn new(cluster_time: Timestamp, uuid: Option<Uuid>, document_key: Option<Document>) -> Self {
        Self {
            uuid,
            document_key,
            ..Self::from_timestamp(cluster_time)
        }
    }

    #[must_use]
    pub fn with_txn_op_index(mut self, txn_op_index: i64) -> Self {
        self.txn_op_index = txn_op_index;
        self
    }

    #[must_use]
    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    #[must_use]
    pub fn with_document_key(mut self, document_key: Document) -> Self {
        self.document_key = Some(document_key);
        self
    }

    /// Returns the token of the invalidate event caused by this event.
    #[must_use]
    pub fn invalidated(&self) -> Self {
        Self {
            from_invalidate: true,
            ..self.clone()
        }
    }

    /// Encodes the token in its wire form.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeStreamError::InvalidResumeToken`] if BSON serialization
    /// fails, which cannot happen for tokens built through this API.
    pub fn to_document(&self) -> Result<Document> {
        bson::to_document(self).map_err(|e| ChangeStreamError::InvalidResumeToken(e.to_string()))
    }

    /// Decodes a token from its wire form.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeStreamError::InvalidResumeToken`] when `clusterTime` is
    /// missing, a field has the wrong type, or an unknown field is present.
    pub fn from_document(doc: &Document) -> Result<Self> {
        bson::from_document(doc.clone())
            .map_err(|e| ChangeStreamError::InvalidResumeToken(format!("{e} in {doc}")))
    }

    /// Decodes a token from an arbitrary BSON value, which must be a document.
    pub fn from_bson(value: &Bson) -> Result<Self> {
        match value {
            Bson::Document(doc) => Self::from_document(doc),
            other => Err(ChangeStreamError::InvalidResumeToken(format!(
                "expected a document, found {:?}",
                other.element_type()
            ))),
        }
    }

    /// Compares only the position tuple `(clusterTime, txnOpIndex, uuid, documentKey)`.
    #[must_use]
    pub fn cmp_position(&self, other: &Self) -> Ordering {
        cmp_timestamps(self.cluster_time, other.cluster_time)
            .then_with(|| self.txn_op_index.cmp(&other.txn_op_index))
            .then_with(|| cmp_uuids(self.uuid.as_ref(), other.uuid.as_ref()))
            .then_with(|| match (&self.document_key, &other.document_key) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => compare_documents(a, b),
            })
    }
}

impl Ord for ResumeToken {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_position(other)
            .then_with(|| self.from_invalidate.cmp(&other.from_invalidate))
    }
}

impl PartialOrd for ResumeToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ResumeToken {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ResumeToken {}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{clusterTime: Timestamp({}, {}), txnOpIndex: {}",
            self.cluster_time.time, self.cluster_time.increment, self.txn_op_index
        )?;
        if let Some(uuid) = &self.uuid {
            write!(f, ", uuid: {uuid}")?;
        }
        if let Some(key) = &self.document_key {
            write!(f, ", documentKey: {key}")?;
        }
        if self.from_invalidate {
            write!(f, ", fromInvalidate: true")?;
        }
        write!(f, "}}")
    }
}

/// Orders timestamps by `(time, increment)`.
#[inline]
#[must_use]
pub fn cmp_timestamps(a: Timestamp, b: Timestamp) -> Ordering {
    (a.time, a.increment).cmp(&(b.time, b.increment))
}

fn cmp_uuids(a: Option<&Uuid>, b: Option<&Uuid>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.bytes().cmp(&b.bytes()),
    }
}

/// Total order over BSON documents.
///
/// Elements are compared pairwise by canonical type, then field name, then
/// value; a document that is a prefix of another sorts first. Numbers of
/// different BSON types compare by value and then by type, so documents
/// compare equal exactly when they are structurally equal.
#[must_use]
pub fn compare_documents(a: &Document, b: &Document) -> Ordering {
    let mut left = a.iter();
    let mut right = b.iter();
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some((ka, va)), Some((kb, vb))) => {
                let ord = canonical_rank(va)
                    .cmp(&canonical_rank(vb))
                    .then_with(|| ka.cmp(kb))
                    .then_with(|| compare_values(va, vb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Total order over BSON values, consistent with structural equality.
#[must_use]
pub fn compare_values(a: &Bson, b: &Bson) -> Ordering {
    let rank = canonical_rank(a).cmp(&canonical_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Symbol(x), Bson::Symbol(y)) => x.cmp(y),
        (Bson::Document(x), Bson::Document(y)) => compare_documents(x, y),
        (Bson::Array(x), Bson::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Binary(x), Bson::Binary(y)) => x
            .bytes
            .len()
            .cmp(&y.bytes.len())
            .then_with(|| u8::from(x.subtype).cmp(&u8::from(y.subtype)))
            .then_with(|| x.bytes.cmp(&y.bytes)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.timestamp_millis().cmp(&y.timestamp_millis()),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => cmp_timestamps(*x, *y),
        (Bson::RegularExpression(x), Bson::RegularExpression(y)) => x
            .pattern
            .cmp(&y.pattern)
            .then_with(|| x.options.cmp(&y.options)),
        (Bson::Decimal128(x), Bson::Decimal128(y)) => x.bytes().cmp(&y.bytes()),
        _ if is_number(a) && is_number(b) => compare_numbers(a, b),
        _ if a.element_type() == b.element_type() => {
            // Remaining types (code, db pointers, ...) have no natural order.
            format!("{a:?}").cmp(&format!("{b:?}"))
        }
        _ => (a.element_type() as u8).cmp(&(b.element_type() as u8)),
    }
}

fn is_number(value: &Bson) -> bool {
    matches!(value, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_))
}

fn compare_numbers(a: &Bson, b: &Bson) -> Ordering {
    let by_value = match (a, b) {
        (Bson::Double(x), Bson::Double(y)) => x.total_cmp(y),
        (Bson::Double(x), _) => x.total_cmp(&(as_i64(b) as f64)),
        (_, Bson::Double(y)) => (as_i64(a) as f64).total_cmp(y),
        _ => as_i64(a).cmp(&as_i64(b)),
    };
    by_value.then_with(|| (a.element_type() as u8).cmp(&(b.element_type() as u8)))
}

fn as_i64(value: &Bson) -> i64 {
    match value {
        Bson::Int32(v) => i64::from(*v),
        Bson::Int64(v) => *v,
        _ => 0,
    }
}

/// Canonical type ranks, following the server's cross-type sort order.
fn canonical_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Undefined | Bson::Null => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => 2,
        Bson::Decimal128(_) => 3,
        Bson::String(_) | Bson::Symbol(_) => 4,
        Bson::Document(_) => 5,
        Bson::Array(_) => 6,
        Bson::Binary(_) => 7,
        Bson::ObjectId(_) => 8,
        Bson::Boolean(_) => 9,
        Bson::DateTime(_) => 10,
        Bson::Timestamp(_) => 11,
        Bson::RegularExpression(_) => 12,
        Bson::DbPointer(_) => 13,
        Bson::JavaScriptCode(_) => 14,
        Bson::JavaScriptCodeWithScope(_) => 15,
        Bson::MaxKey => 16,
    }
}
