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

#![cfg(feature = "mongodb-source")]

use bson::{doc, Bson, Document, Timestamp};
use changefeed_core::filter::FilterSpec;
use changefeed_core::legality::FeatureCompatibilityVersion;
use changefeed_core::options::{ChangeStreamOptions, FullDocument};
use changefeed_core::resume::Role;
use changefeed_core::scope::{Namespace, Scope};
use changefeed_core::source::OplogReader;
use changefeed_core::stage::{ChangeStreamPlan, StreamContext};
use changefeed_core::stream::{ChangeStream, StreamConfig, StreamItem};
use changefeed_core::ChangeEvent;
use changefeed_sources::mongodb::{
    load_catalog, MongoOplogConfig, MongoOplogReader, MongoPostImageLookup,
};
use mongodb::Client;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::mongo::Mongo;

/// Starts a single-node replica set and connects to it.
async fn start_replica_set() -> (ContainerAsync<Mongo>, Client, MongoOplogConfig) {
    let container = Mongo::repl_set()
        .start()
        .await
        .expect("failed to start MongoDB container");
    let port = container
        .get_host_port_ipv4(27017)
        .await
        .expect("failed to get port");

    let uri = format!("mongodb://127.0.0.1:{port}/?directConnection=true");
    let client = Client::with_uri_str(&uri).await.expect("failed to connect");
    let config = MongoOplogConfig::builder()
        .uri(uri)
        .build()
        .expect("valid config");
    (container, client, config)
}

async fn last_applied(client: &Client) -> Timestamp {
    let last = client
        .database("local")
        .collection::<Document>("oplog.rs")
        .find_one(doc! {})
        .sort(doc! { "$natural": -1 })
        .await
        .expect("failed to read oplog")
        .expect("oplog is empty");
    match last.get("ts") {
        Some(Bson::Timestamp(ts)) => *ts,
        other => panic!("unexpected ts: {other:?}"),
    }
}

async fn next_event(stream: &mut ChangeStream<MongoOplogReader>) -> ChangeEvent {
    for _ in 0..30 {
        match stream.next().await.expect("stream failed") {
            StreamItem::Event(event) => return event,
            StreamItem::Pending => continue,
            terminal => panic!("stream ended early: {terminal:?}"),
        }
    }
    panic!("no event within 30 pulls");
}

fn stream_config() -> StreamConfig {
    StreamConfig::builder()
        .await_data_timeout(Duration::from_millis(500))
        .build()
        .expect("valid config")
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_collection_stream_over_oplog() {
    let (_container, client, config) = start_replica_set().await;
    let orders = client.database("shop").collection::<Document>("orders");
    orders.insert_one(doc! { "_id": 0 }).await.expect("insert failed");

    let start = last_applied(&client).await;
    let catalog = load_catalog(&client).await.expect("failed to load catalog");
    assert!(!catalog.is_empty());

    let ctx = StreamContext::new(
        Role::ReplicaSetMember { last_applied: start },
        FeatureCompatibilityVersion::V4_0,
    );
    let plan = ChangeStreamPlan::open(
        &Namespace::new("shop", "orders"),
        &ChangeStreamOptions::builder()
            .full_document(FullDocument::UpdateLookup)
            .build(),
        &ctx,
        &catalog,
    )
    .expect("failed to open");

    let reader = MongoOplogReader::with_client(&client, &config);
    let mut stream = ChangeStream::new(&plan, reader, stream_config())
        .expect("failed to start")
        .with_post_image_lookup(Arc::new(MongoPostImageLookup::new(client.clone())));

    orders.insert_one(doc! { "_id": 1, "qty": 1 }).await.expect("insert failed");
    orders
        .update_one(doc! { "_id": 1 }, doc! { "$set": { "qty": 2 } })
        .await
        .expect("update failed");
    orders.delete_one(doc! { "_id": 0 }).await.expect("delete failed");

    let insert = next_event(&mut stream).await;
    assert!(insert.is_insert());
    assert_eq!(insert.document_key, Some(doc! { "_id": 1 }));

    let update = next_event(&mut stream).await;
    assert!(update.is_update());
    assert_eq!(update.full_document, Some(doc! { "_id": 1, "qty": 2 }));

    let delete = next_event(&mut stream).await;
    assert!(delete.is_delete());
    assert!(insert.id < update.id && update.id < delete.id);

    orders.drop().await.expect("drop failed");
    assert!(next_event(&mut stream).await.is_invalidate());
    assert_eq!(stream.next().await.expect("stream failed"), StreamItem::Invalidated);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_earliest_timestamp() {
    let (_container, client, config) = start_replica_set().await;
    let mut reader = MongoOplogReader::with_client(&client, &config);

    let earliest = reader
        .earliest_timestamp()
        .await
        .expect("failed to read oplog")
        .expect("oplog is empty");
    let latest = last_applied(&client).await;
    assert!((earliest.time, earliest.increment) <= (latest.time, latest.increment));
}

fn at_or_after(a: Timestamp, b: Timestamp) -> bool {
    (a.time, a.increment) >= (b.time, b.increment)
}

fn orders_filter(start: Timestamp) -> FilterSpec {
    FilterSpec::synthesize(
        &Scope::SingleCollection(Namespace::new("shop", "orders")),
        start,
        false,
        false,
    )
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_abandoned_fetch_keeps_cursor() {
    let (_container, client, config) = start_replica_set().await;
    let orders = client.database("shop").collection::<Document>("orders");
    let filter = orders_filter(last_applied(&client).await);
    let mut reader = MongoOplogReader::with_client(&client, &config);

    let idle = reader
        .next_batch(&filter, 100, Duration::from_millis(200))
        .await
        .expect("fetch failed")
        .expect("log closed");
    assert!(idle.entries.is_empty());
    assert!(reader.is_tailing());

    // The caller gives up long before the server-side await ends.
    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        reader.next_batch(&filter, 100, Duration::from_secs(2)),
    )
    .await;
    assert!(abandoned.is_err());
    assert!(reader.is_tailing());

    orders.insert_one(doc! { "_id": 1 }).await.expect("insert failed");
    let mut received = Vec::new();
    for _ in 0..20 {
        let batch = reader
            .next_batch(&filter, 100, Duration::from_millis(500))
            .await
            .expect("fetch failed")
            .expect("log closed");
        received.extend(batch.entries);
        if !received.is_empty() {
            break;
        }
    }
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].ns, "shop.orders");
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_noop_entries_advance_high_water_mark() {
    let (_container, client, config) = start_replica_set().await;
    let start = last_applied(&client).await;
    let filter = orders_filter(start);
    let mut reader = MongoOplogReader::with_client(&client, &config);

    client
        .database("shop")
        .collection::<Document>("customers")
        .insert_one(doc! { "_id": 1 })
        .await
        .expect("insert failed");
    client
        .database("admin")
        .run_command(doc! { "appendOplogNote": 1, "data": { "msg": "tick" } })
        .await
        .expect("appendOplogNote failed");
    let note = last_applied(&client).await;

    let mut high_water_mark = start;
    for _ in 0..20 {
        let batch = reader
            .next_batch(&filter, 100, Duration::from_millis(500))
            .await
            .expect("fetch failed")
            .expect("log closed");
        assert!(batch.entries.is_empty(), "unexpected entries: {:?}", batch.entries);
        high_water_mark = batch.high_water_mark;
        if at_or_after(high_water_mark, note) {
            break;
        }
    }
    // The server's periodic no-op writer may have moved it further still.
    assert!(at_or_after(high_water_mark, note), "{high_water_mark:?} < {note:?}");
}
