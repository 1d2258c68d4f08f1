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

//! Property tests for resume token encoding and ordering.

use bson::{doc, Bson, Document, Timestamp, Uuid};
use changefeed_core::resume_token::ResumeToken;
use proptest::prelude::*;
use std::cmp::Ordering;

// Small domains so that ties on every tuple component are common.
fn timestamp_strategy() -> impl Strategy<Value = Timestamp> {
    (0u32..4, 0u32..3).prop_map(|(time, increment)| Timestamp { time, increment })
}

fn uuid_strategy() -> impl Strategy<Value = Option<Uuid>> {
    prop::option::of((0u8..3).prop_map(|seed| Uuid::from_bytes([seed; 16])))
}

fn key_value_strategy() -> impl Strategy<Value = Bson> {
    prop_oneof![
        (0i32..4).prop_map(Bson::Int32),
        "[a-c]{0,2}".prop_map(Bson::String),
    ]
}

fn document_key_strategy() -> impl Strategy<Value = Option<Document>> {
    prop::option::of(
        (key_value_strategy(), prop::option::of(0i32..3)).prop_map(|(id, shard)| {
            let mut key = doc! { "_id": id };
            if let Some(shard) = shard {
                key.insert("shard", shard);
            }
            key
        }),
    )
}

fn token_strategy() -> impl Strategy<Value = ResumeToken> {
    (
        timestamp_strategy(),
        0i64..3,
        any::<bool>(),
        uuid_strategy(),
        document_key_strategy(),
    )
        .prop_map(|(ts, txn_op_index, from_invalidate, uuid, document_key)| {
            let token = ResumeToken::new(ts, uuid, document_key).with_txn_op_index(txn_op_index);
            if from_invalidate {
                token.invalidated()
            } else {
                token
            }
        })
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

    #[test]
    fn round_trip(token in token_strategy()) {
        let encoded = token.to_document().unwrap();
        let decoded = ResumeToken::from_document(&encoded).unwrap();
        prop_assert_eq!(&decoded, &token);
        prop_assert_eq!(decoded.to_document().unwrap(), encoded);
        prop_assert_eq!(decoded.uuid, token.uuid);
        prop_assert_eq!(decoded.document_key, token.document_key);
    }

    #[test]
    fn order_is_antisymmetric(a in token_strategy(), b in token_strategy()) {
        prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        prop_assert_eq!(a == b, a.cmp(&b) == Ordering::Equal);
    }

    #[test]
    fn order_is_irreflexive(a in token_strategy()) {
        prop_assert!(!(a < a));
        prop_assert_eq!(a.cmp(&a.clone()), Ordering::Equal);
    }

    #[test]
    fn order_is_transitive(
        a in token_strategy(),
        b in token_strategy(),
        c in token_strategy(),
    ) {
        let mut sorted = [a, b, c];
        sorted.sort();
        prop_assert!(sorted[0] <= sorted[1]);
        prop_assert!(sorted[1] <= sorted[2]);
        prop_assert!(sorted[0] <= sorted[2]);
        if sorted[0] < sorted[1] || sorted[1] < sorted[2] {
            prop_assert!(sorted[0] < sorted[2]);
        }
    }

    #[test]
    fn cluster_time_dominates(a in token_strategy(), b in token_strategy()) {
        let by_time = (a.cluster_time.time, a.cluster_time.increment)
            .cmp(&(b.cluster_time.time, b.cluster_time.increment));
        if by_time != Ordering::Equal {
            prop_assert_eq!(a.cmp(&b), by_time);
        }
    }
}

#[test]
fn test_unknown_field_rejected() {
    let doc = doc! { "clusterTime": Timestamp { time: 1, increment: 0 }, "bogus": 1 };
    assert!(ResumeToken::from_document(&doc).is_err());
}

#[test]
fn test_missing_cluster_time_rejected() {
    assert!(ResumeToken::from_document(&doc! { "txnOpIndex": 1_i64 }).is_err());
}

#[test]
fn test_txn_op_index_breaks_ties() {
    let ts = Timestamp { time: 7, increment: 1 };
    let uuid = Uuid::from_bytes([9; 16]);
    let first = ResumeToken::new(ts, Some(uuid), Some(doc! { "_id": 5 }));
    let second = ResumeToken::new(ts, Some(uuid), Some(doc! { "_id": 1 })).with_txn_op_index(1);
    assert!(first < second);
}
