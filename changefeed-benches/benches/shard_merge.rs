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

//! Shard Merge Benchmarks
//!
//! These benchmarks measure end-to-end throughput of change streams read
//! from in-memory logs:
//! - A single unsharded stream
//! - Router-level merging across a growing number of shards
//!
//! # Running Benchmarks
//!
//! ```bash
//! cargo bench --package changefeed-benches --bench shard_merge
//! ```

use bson::Timestamp;
use changefeed_benches::shard_logs;
use changefeed_core::legality::FeatureCompatibilityVersion;
use changefeed_core::merge::MergedChangeStream;
use changefeed_core::options::ChangeStreamOptions;
use changefeed_core::resume::Role;
use changefeed_core::scope::Namespace;
use changefeed_core::source::CatalogSnapshot;
use changefeed_core::stage::{ChangeStreamPlan, StreamContext};
use changefeed_core::stream::{ChangeStream, EventSource, StreamConfig, StreamItem};
use changefeed_sources::memory::MemoryOplog;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

const EVENTS: usize = 5_000;
const V4_0: FeatureCompatibilityVersion = FeatureCompatibilityVersion::V4_0;
const ORIGIN: Timestamp = Timestamp { time: 1, increment: 0 };

fn orders() -> Namespace {
    Namespace::new("bench", "orders")
}

fn stream_config() -> StreamConfig {
    StreamConfig::builder()
        .batch_size(500)
        .await_data_timeout(Duration::from_millis(10))
        .build()
        .expect("valid config")
}

async fn closed_log(entries: Vec<changefeed_core::oplog::OplogEntry>) -> MemoryOplog {
    let log = MemoryOplog::with_entries(entries).await.expect("ordered log");
    log.close().await;
    log
}

/// Pulls until the source reports the end; returns the number of events.
async fn drain(source: &mut dyn EventSource) -> usize {
    let mut count = 0;
    loop {
        match source.next().await.expect("stream failed") {
            StreamItem::Event(_) => count += 1,
            StreamItem::Pending => {}
            StreamItem::Invalidated | StreamItem::Exhausted => return count,
        }
    }
}

/// Benchmark: One unsharded stream over a closed log
fn bench_single_stream(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let log = rt.block_on(closed_log(shard_logs(1, EVENTS).remove(0)));
    let plan = ChangeStreamPlan::open(
        &orders(),
        &ChangeStreamOptions::default(),
        &StreamContext::new(Role::ReplicaSetMember { last_applied: ORIGIN }, V4_0),
        &CatalogSnapshot::new(),
    )
    .expect("plan");

    let mut group = c.benchmark_group("single_stream");
    group.throughput(Throughput::Elements(EVENTS as u64));
    group.bench_function("drain", |b| {
        b.to_async(&rt).iter(|| async {
            let mut stream =
                ChangeStream::new(&plan, log.reader(), stream_config()).expect("stream");
            drain(&mut stream).await
        });
    });
    group.finish();
}

/// Benchmark: Router merge over N shards
fn bench_merge(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let router = ChangeStreamPlan::open(
        &orders(),
        &ChangeStreamOptions::default(),
        &StreamContext::new(Role::Router { cluster_time: ORIGIN }, V4_0),
        &CatalogSnapshot::new(),
    )
    .expect("router plan");
    let shard_plan = ChangeStreamPlan::open(
        &orders(),
        &router.shard_options(),
        &StreamContext::new(Role::Shard { last_applied: ORIGIN }, V4_0),
        &CatalogSnapshot::new(),
    )
    .expect("shard plan");

    let mut group = c.benchmark_group("merge");
    group.throughput(Throughput::Elements(EVENTS as u64));

    for shards in [1, 2, 4, 8] {
        let logs: Vec<MemoryOplog> = rt.block_on(async {
            let mut logs = Vec::new();
            for entries in shard_logs(shards, EVENTS / shards) {
                logs.push(closed_log(entries).await);
            }
            logs
        });

        group.bench_with_input(BenchmarkId::from_parameter(shards), &logs, |b, logs| {
            b.to_async(&rt).iter(|| async {
                let inputs: Vec<Box<dyn EventSource>> = logs
                    .iter()
                    .map(|log| {
                        let stream = ChangeStream::new(&shard_plan, log.reader(), stream_config())
                            .expect("shard stream");
                        Box::new(stream) as Box<dyn EventSource>
                    })
                    .collect();
                let mut merged = MergedChangeStream::new(&router, inputs).expect("merge");
                drain(&mut merged).await
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_single_stream, bench_merge);
criterion_main!(benches);
