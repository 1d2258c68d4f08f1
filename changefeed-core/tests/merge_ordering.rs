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

//! Merging three shard streams at a router.

mod common;

use bson::doc;
use changefeed_core::legality::FeatureCompatibilityVersion;
use changefeed_core::merge::MergedChangeStream;
use changefeed_core::oplog::OplogEntry;
use changefeed_core::options::ChangeStreamOptions;
use changefeed_core::resume::Role;
use changefeed_core::scope::Namespace;
use changefeed_core::source::CatalogSnapshot;
use changefeed_core::stage::{ChangeStreamPlan, StreamContext};
use changefeed_core::stream::{ChangeStream, EventSource, StreamConfig, StreamItem};
use changefeed_core::ChangeEvent;
use common::{command, insert, ts, VecReader};

const V4_0: FeatureCompatibilityVersion = FeatureCompatibilityVersion::V4_0;

fn coll() -> Namespace {
    Namespace::new("db", "coll")
}

fn router_plan() -> ChangeStreamPlan {
    ChangeStreamPlan::open(
        &coll(),
        &ChangeStreamOptions::default(),
        &StreamContext::new(Role::Router { cluster_time: ts(0) }, V4_0),
        &CatalogSnapshot::new(),
    )
    .unwrap()
}

/// Opens the merge point over one shard stream per log.
fn merged(logs: Vec<Vec<OplogEntry>>) -> MergedChangeStream {
    let router = router_plan();
    let shard_ctx = StreamContext::new(Role::Shard { last_applied: ts(0) }, V4_0);
    let shard_plan = ChangeStreamPlan::open(
        &coll(),
        &router.shard_options(),
        &shard_ctx,
        &CatalogSnapshot::new(),
    )
    .unwrap();
    assert!(!shard_plan.has_stage("closeCursor"));

    let shards: Vec<Box<dyn EventSource>> = logs
        .into_iter()
        .map(|log| {
            let stream =
                ChangeStream::new(&shard_plan, VecReader::closed(log), StreamConfig::default())
                    .unwrap();
            Box::new(stream) as Box<dyn EventSource>
        })
        .collect();
    MergedChangeStream::new(&router, shards).unwrap()
}

async fn drain(stream: &mut MergedChangeStream) -> Vec<StreamItem> {
    let mut items = Vec::new();
    loop {
        let item = stream.next().await.unwrap();
        match item {
            StreamItem::Pending => continue,
            StreamItem::Exhausted => {
                items.push(item);
                return items;
            }
            other => items.push(other),
        }
    }
}

fn events(items: &[StreamItem]) -> Vec<&ChangeEvent> {
    items
        .iter()
        .filter_map(|item| match item {
            StreamItem::Event(event) => Some(event),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_merged_output_is_non_decreasing() {
    let transaction = command(
        6,
        "admin",
        doc! { "applyOps": [
            { "op": "i", "ns": "db.coll", "o": { "_id": 60 } },
            { "op": "i", "ns": "db.coll", "o": { "_id": 61 } },
            { "op": "i", "ns": "db.coll", "o": { "_id": 62 } },
        ] },
    )
    .in_transaction(doc! { "id": 1 }, 1);

    let mut stream = merged(vec![
        vec![insert(1, "db.coll", 1), insert(4, "db.coll", 4), insert(9, "db.coll", 9)],
        vec![insert(2, "db.coll", 2), transaction, insert(8, "db.coll", 8)],
        vec![insert(3, "db.coll", 3), insert(5, "db.coll", 5), insert(7, "db.coll", 7)],
    ]);

    let items = drain(&mut stream).await;
    let events = events(&items);
    assert_eq!(events.len(), 11);
    assert!(events.windows(2).all(|pair| pair[0].id <= pair[1].id));

    let times: Vec<u32> = events.iter().map(|e| e.cluster_time.time).collect();
    assert_eq!(times, vec![1, 2, 3, 4, 5, 6, 6, 6, 7, 8, 9]);

    let txn_indexes: Vec<i64> = events
        .iter()
        .filter(|e| e.cluster_time == ts(6))
        .map(|e| e.id.txn_op_index)
        .collect();
    assert_eq!(txn_indexes, vec![0, 1, 2]);

    assert_eq!(items.last(), Some(&StreamItem::Exhausted));
    assert!(!items.contains(&StreamItem::Invalidated));
}

#[tokio::test]
async fn test_single_invalidation_after_earlier_events() {
    let mut stream = merged(vec![
        vec![command(10, "db", doc! { "drop": "coll" })],
        vec![insert(5, "db.coll", 5), insert(12, "db.coll", 12)],
        vec![insert(7, "db.coll", 7), insert(9, "db.coll", 9)],
    ]);

    let items = drain(&mut stream).await;
    let invalidated = items
        .iter()
        .filter(|item| **item == StreamItem::Invalidated)
        .count();
    assert_eq!(invalidated, 1);

    let events = events(&items);
    let times: Vec<u32> = events.iter().map(|e| e.cluster_time.time).collect();
    assert_eq!(times, vec![5, 7, 9, 10]);
    assert!(events[3].is_invalidate());

    // The terminal signal directly follows the invalidate event.
    let position = items
        .iter()
        .position(|item| *item == StreamItem::Invalidated)
        .unwrap();
    assert!(matches!(&items[position - 1], StreamItem::Event(e) if e.is_invalidate()));
    assert_eq!(items.len(), position + 2);
}

#[tokio::test]
async fn test_drop_on_every_shard_invalidates_once() {
    let mut stream = merged(vec![
        vec![insert(1, "db.coll", 1), command(10, "db", doc! { "drop": "coll" })],
        vec![command(10, "db", doc! { "drop": "coll" })],
        vec![insert(2, "db.coll", 2), command(10, "db", doc! { "drop": "coll" })],
    ]);

    let items = drain(&mut stream).await;
    let events = events(&items);
    assert_eq!(events.iter().filter(|e| e.is_invalidate()).count(), 1);
    assert_eq!(
        items.iter().filter(|item| **item == StreamItem::Invalidated).count(),
        1
    );
}
