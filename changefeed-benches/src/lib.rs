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

//! Synthetic oplog fixtures shared by the benchmarks.

use bson::{doc, Bson, Timestamp, Uuid};
use changefeed_core::oplog::{OpType, OplogEntry};

/// Collections the synthetic workload writes to, all in database `bench`.
pub const COLLECTIONS: [&str; 4] = ["orders", "users", "events", "system.views"];

/// Builds a log of `count` entries starting after timestamp `(1, 0)`.
///
/// The mix is roughly: inserts 40%, updates 30%, deletes 10%, periodic
/// no-ops 10%, commands on other databases 5%, three-op transactions 5%.
#[must_use]
pub fn synthetic_oplog(count: usize) -> Vec<OplogEntry> {
    let uuid = Uuid::from_bytes([7; 16]);
    (0..count)
        .map(|i| {
            let ts = Timestamp {
                time: 2 + (i / 1000) as u32,
                increment: (i % 1000) as u32,
            };
            let ns = format!("bench.{}", COLLECTIONS[i % COLLECTIONS.len()]);
            let id = i as i64;
            match i % 20 {
                0..=7 => OplogEntry::new(ts, OpType::Insert, ns, doc! { "_id": id, "v": i as i32 })
                    .with_uuid(uuid),
                8..=13 => OplogEntry::new(ts, OpType::Update, ns, doc! { "$set": { "v": 0 } })
                    .with_o2(doc! { "_id": id })
                    .with_uuid(uuid),
                14 | 15 => OplogEntry::new(ts, OpType::Delete, ns, doc! { "_id": id }).with_uuid(uuid),
                16 | 17 => OplogEntry::new(ts, OpType::Noop, "", doc! { "msg": "periodic noop" }),
                18 => OplogEntry::new(ts, OpType::Command, "other.$cmd", doc! { "create": "tmp" }),
                _ => transaction(ts, id),
            }
        })
        .collect()
}

fn transaction(ts: Timestamp, id: i64) -> OplogEntry {
    let ops: Vec<Bson> = (0..3)
        .map(|k| {
            Bson::Document(doc! {
                "op": "i",
                "ns": format!("bench.{}", COLLECTIONS[k % 2]),
                "o": { "_id": id * 10 + k as i64 },
            })
        })
        .collect();
    OplogEntry::new(ts, OpType::Command, "admin.$cmd", doc! { "applyOps": ops })
        .in_transaction(doc! { "id": id }, id)
}

/// Splits one workload of `per_shard * shards` inserts into `shards` logs.
///
/// Entry `i` lands on shard `i % shards`, so merged output must interleave
/// every shard. Every log opens with a no-op at `(1, 0)` so that streams
/// starting there pass the history check.
#[must_use]
pub fn shard_logs(shards: usize, per_shard: usize) -> Vec<Vec<OplogEntry>> {
    let origin = Timestamp { time: 1, increment: 0 };
    let mut logs = vec![
        vec![OplogEntry::new(origin, OpType::Noop, "", doc! { "msg": "initiating set" })];
        shards
    ];
    for i in 0..shards * per_shard {
        let ts = Timestamp {
            time: 2 + i as u32,
            increment: 0,
        };
        logs[i % shards].push(OplogEntry::new(
            ts,
            OpType::Insert,
            "bench.orders",
            doc! { "_id": i as i64 },
        ));
    }
    logs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_oplog_is_ordered() {
        let log = synthetic_oplog(2500);
        assert!(log
            .windows(2)
            .all(|w| (w[0].ts.time, w[0].ts.increment) < (w[1].ts.time, w[1].ts.increment)));
    }

    #[test]
    fn test_shard_logs_partition_workload() {
        let logs = shard_logs(3, 10);
        assert_eq!(logs.len(), 3);
        assert!(logs.iter().all(|log| log.len() == 11));
    }
}
