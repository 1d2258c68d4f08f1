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

//! Merge point for sharded change streams.
//!
//! Per-shard streams are merged in resume-token order. An event is only
//! released once no other shard can still produce an earlier one: every
//! other shard either holds a later head event, has passed the event's
//! cluster time (its high-water mark), or is exhausted. Shards that block
//! the release are pulled concurrently.
//!
//! The merge point owns the stream's single close-cursor instance and its
//! post-image lookup. Shard streams must be opened with shard plans, which
//! carry neither. Internal `newShardDetected` events are consumed here.

use crate::close_cursor::Gate;
use crate::error::{ChangeStreamError, Result};
use crate::event::{ChangeEvent, OperationType};
use crate::metrics;
use crate::resume_token::cmp_timestamps;
use crate::source::PostImageLookup;
use crate::stage::{ChangeStreamPlan, Stage};
use crate::stream::{Delivery, EventSource, Interrupt, StreamItem};
use async_trait::async_trait;
use bson::Timestamp;
use futures::future::join_all;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct MergeInput {
    source: Box<dyn EventSource>,
    head: Option<ChangeEvent>,
    exhausted: bool,
}

impl MergeInput {
    /// Returns true if this input may still produce an event sorting at or
    /// before `candidate`, so the candidate cannot be released yet.
    fn blocks(&self, candidate: Option<Timestamp>) -> bool {
        if self.exhausted || self.head.is_some() {
            return false;
        }
        match (candidate, self.source.high_water_mark()) {
            (Some(ts), Some(mark)) => cmp_timestamps(ts, mark) == Ordering::Greater,
            _ => true,
        }
    }
}

/// Change stream merging presorted per-shard streams.
pub struct MergedChangeStream {
    inputs: Vec<MergeInput>,
    delivery: Delivery,
    interrupt: Interrupt,
}

impl MergedChangeStream {
    /// Creates the merge point for a router `plan` over `shards`.
    ///
    /// # Errors
    ///
    /// Returns `ChangeStreamError::Configuration` if `plan` is not a router
    /// plan or no shard streams are given.
    pub fn new(plan: &ChangeStreamPlan, shards: Vec<Box<dyn EventSource>>) -> Result<Self> {
        if plan.stages().first() != Some(&Stage::MergePresorted) {
            return Err(ChangeStreamError::Configuration(
                "a merge point requires a router plan".to_string(),
            ));
        }
        if shards.is_empty() {
            return Err(ChangeStreamError::Configuration(
                "a merge point requires at least one shard stream".to_string(),
            ));
        }

        info!(scope = %plan.scope(), shards = shards.len(), "Starting merged change stream");

        Ok(Self {
            inputs: shards
                .into_iter()
                .map(|source| MergeInput {
                    source,
                    head: None,
                    exhausted: false,
                })
                .collect(),
            delivery: Delivery::from_stages(plan.stages(), plan.scope().kind()),
            interrupt: Interrupt::never(),
        })
    }

    #[must_use]
    pub fn with_post_image_lookup(mut self, lookup: Arc<dyn PostImageLookup>) -> Self {
        self.delivery.set_post_images(lookup);
        self
    }

    #[must_use]
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.inputs.len()
    }

    /// Pulls the next item of the merged stream.
    ///
    /// # Errors
    ///
    /// Propagates the first error of any shard stream, and
    /// [`ChangeStreamError::Interrupted`] if the interrupt fired.
    pub async fn next(&mut self) -> Result<StreamItem> {
        match self.delivery.gate() {
            Gate::Proceed => {}
            Gate::Terminate => return Ok(StreamItem::Invalidated),
            Gate::Closed => return Ok(StreamItem::Exhausted),
        }

        loop {
            if self.interrupt.is_interrupted() {
                return Err(ChangeStreamError::Interrupted);
            }

            let candidate = self.candidate();
            let candidate_ts = candidate
                .and_then(|i| self.inputs[i].head.as_ref())
                .map(|event| event.cluster_time);
            let blocking: Vec<usize> = self
                .inputs
                .iter()
                .enumerate()
                .filter(|(_, input)| input.blocks(candidate_ts))
                .map(|(index, _)| index)
                .collect();

            if blocking.is_empty() {
                let Some(event) = candidate.and_then(|i| self.inputs[i].head.take()) else {
                    debug!("All shard streams exhausted");
                    return Ok(StreamItem::Exhausted);
                };
                if event.operation == OperationType::NewShardDetected {
                    info!(token = %event.id, "New shard detected by merge point");
                    continue;
                }
                if let Some(event) = self.delivery.admit(event).await? {
                    return Ok(StreamItem::Event(event));
                }
                continue;
            }

            let only_pending = self.pull(&blocking).await?;
            if only_pending && self.inputs.iter().any(|input| input.blocks(candidate_ts)) {
                if candidate.is_some() {
                    metrics::increment_merge_stalls();
                    debug!(blocking = ?blocking, "Merge stalled on shards without data");
                }
                return Ok(StreamItem::Pending);
            }
        }
    }

    /// Index of the input holding the smallest head; ties go to the lower index.
    fn candidate(&self) -> Option<usize> {
        let mut best: Option<(usize, &ChangeEvent)> = None;
        for (index, input) in self.inputs.iter().enumerate() {
            let Some(head) = &input.head else { continue };
            match best {
                Some((_, current)) if head.id >= current.id => {}
                _ => best = Some((index, head)),
            }
        }
        best.map(|(index, _)| index)
    }

    /// Pulls every blocking input concurrently.
    ///
    /// Returns true if every pull came back `Pending`.
    async fn pull(&mut self, blocking: &[usize]) -> Result<bool> {
        let pulls = self
            .inputs
            .iter_mut()
            .enumerate()
            .filter(|(index, _)| blocking.contains(index))
            .map(|(index, input)| async move { (index, input.source.next().await) });
        let results = tokio::select! {
            biased;
            () = self.interrupt.interrupted() => return Err(ChangeStreamError::Interrupted),
            results = join_all(pulls) => results,
        };

        let mut only_pending = true;
        for (index, result) in results {
            let input = &mut self.inputs[index];
            match result? {
                StreamItem::Event(event) => {
                    input.head = Some(event);
                    only_pending = false;
                }
                StreamItem::Pending => {}
                StreamItem::Exhausted => {
                    debug!(shard = index, "Shard stream exhausted");
                    input.exhausted = true;
                    only_pending = false;
                }
                StreamItem::Invalidated => {
                    warn!(shard = index, "Shard stream reported invalidation; treating it as exhausted");
                    input.exhausted = true;
                    only_pending = false;
                }
            }
        }
        Ok(only_pending)
    }
}

#[async_trait]
impl EventSource for MergedChangeStream {
    async fn next(&mut self) -> Result<StreamItem> {
        MergedChangeStream::next(self).await
    }

    fn high_water_mark(&self) -> Option<Timestamp> {
        let mut mark: Option<Timestamp> = None;
        for input in self.inputs.iter().filter(|input| !input.exhausted) {
            if input.head.is_some() {
                return None;
            }
            let shard_mark = input.source.high_water_mark()?;
            mark = Some(match mark {
                Some(current) if cmp_timestamps(current, shard_mark) == Ordering::Less => current,
                _ => shard_mark,
            });
        }
        mark
    }
}
