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

//! Metrics instrumentation for change stream derivation.
//!
//! Recorded through the [`metrics`] facade; install any exporter (Prometheus,
//! StatsD, ...) in the host application to collect them. Nothing is recorded
//! unless a recorder is installed.
//!
//! # Metrics
//!
//! | name | type | labels |
//! |------|------|--------|
//! | `changefeed_events_delivered_total` | counter | scope, operation |
//! | `changefeed_oplog_entries_scanned_total` | counter | scope |
//! | `changefeed_transform_discards_total` | counter | scope |
//! | `changefeed_empty_batches_total` | counter | scope |
//! | `changefeed_streams_invalidated_total` | counter | scope |
//! | `changefeed_open_rejections_total` | counter | error_type |
//! | `changefeed_merge_stalls_total` | counter | |
//! | `changefeed_change_stream_lag_seconds` | histogram | scope |
//! | `changefeed_fetch_duration_seconds` | histogram | scope |
//! | `changefeed_active_streams` | gauge | |
//!
//! Labels are deliberately low-cardinality: scope kind rather than namespace.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric name prefix for all changefeed metrics.
#[doc(hidden)]
pub const METRIC_PREFIX: &str = "changefeed";

// ============================================================================
// Metric Name Constants
// ============================================================================

/// Events handed to the consumer.
#[doc(hidden)]
pub const EVENTS_DELIVERED_TOTAL: &str = "changefeed_events_delivered_total";

/// Raw log entries returned by the reader after filter push-down.
const OPLOG_ENTRIES_SCANNED_TOTAL: &str = "changefeed_oplog_entries_scanned_total";

/// Entries that passed the filter but produced no event.
const TRANSFORM_DISCARDS_TOTAL: &str = "changefeed_transform_discards_total";

/// Await-data waits that returned nothing.
const EMPTY_BATCHES_TOTAL: &str = "changefeed_empty_batches_total";

/// Streams that delivered their invalidate event.
const STREAMS_INVALIDATED_TOTAL: &str = "changefeed_streams_invalidated_total";

/// Stream-open requests rejected during validation or resume resolution.
const OPEN_REJECTIONS_TOTAL: &str = "changefeed_open_rejections_total";

/// Merge pulls that could not emit because a shard had not advanced.
const MERGE_STALLS_TOTAL: &str = "changefeed_merge_stalls_total";

/// Wall-clock delay between the logged operation and its delivery.
#[doc(hidden)]
pub const CHANGE_STREAM_LAG_SECONDS: &str = "changefeed_change_stream_lag_seconds";

/// Time spent in a single reader fetch, including the await.
#[doc(hidden)]
pub const FETCH_DURATION_SECONDS: &str = "changefeed_fetch_duration_seconds";

/// Streams currently open.
const ACTIVE_STREAMS: &str = "changefeed_active_streams";

// ============================================================================
// Initialization
// ============================================================================

/// Registers metric descriptions with the installed recorder.
///
/// Call once at startup, after installing an exporter.
///
/// ```rust
/// use changefeed_core::metrics;
///
/// metrics::init_metrics();
/// ```
pub fn init_metrics() {
    describe_counter!(
        EVENTS_DELIVERED_TOTAL,
        "Total number of change events delivered to consumers"
    );

    describe_counter!(
        OPLOG_ENTRIES_SCANNED_TOTAL,
        "Total number of oplog entries returned by the filtered log read"
    );

    describe_counter!(
        TRANSFORM_DISCARDS_TOTAL,
        "Total number of filtered oplog entries that produced no change event"
    );

    describe_counter!(
        EMPTY_BATCHES_TOTAL,
        "Total number of await-data waits that returned no entries"
    );

    describe_counter!(
        STREAMS_INVALIDATED_TOTAL,
        "Total number of change streams closed by an invalidate event"
    );

    describe_counter!(
        OPEN_REJECTIONS_TOTAL,
        "Total number of change stream open requests rejected"
    );

    describe_counter!(
        MERGE_STALLS_TOTAL,
        "Total number of merge pulls blocked waiting for a shard to advance"
    );

    describe_histogram!(
        CHANGE_STREAM_LAG_SECONDS,
        metrics::Unit::Seconds,
        "Time between the logged operation and delivery of its change event"
    );

    describe_histogram!(
        FETCH_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Time spent in a single oplog fetch, including await-data"
    );

    describe_gauge!(
        ACTIVE_STREAMS,
        metrics::Unit::Count,
        "Number of change streams currently open"
    );
}

// ============================================================================
// Counter Metrics
// ============================================================================

/// Counts one delivered event.
pub fn increment_events_delivered(scope: &'static str, operation: &str) {
    counter!(EVENTS_DELIVERED_TOTAL, "scope" => scope, "operation" => operation.to_string())
        .increment(1);
}

pub fn increment_entries_scanned(count: usize, scope: &'static str) {
    counter!(OPLOG_ENTRIES_SCANNED_TOTAL, "scope" => scope).increment(count as u64);
}

pub fn increment_transform_discards(scope: &'static str) {
    counter!(TRANSFORM_DISCARDS_TOTAL, "scope" => scope).increment(1);
}

pub fn increment_empty_batches(scope: &'static str) {
    counter!(EMPTY_BATCHES_TOTAL, "scope" => scope).increment(1);
}

pub fn increment_streams_invalidated(scope: &'static str) {
    counter!(STREAMS_INVALIDATED_TOTAL, "scope" => scope).increment(1);
}

/// Counts a rejected open, labelled with [`ChangeStreamError::category`](crate::error::ChangeStreamError::category).
pub fn increment_open_rejections(error_type: &'static str) {
    counter!(OPEN_REJECTIONS_TOTAL, "error_type" => error_type).increment(1);
}

pub fn increment_merge_stalls() {
    counter!(MERGE_STALLS_TOTAL).increment(1);
}

// ============================================================================
// Histogram Metrics
// ============================================================================

pub fn record_change_stream_lag(lag_seconds: f64, scope: &'static str) {
    histogram!(CHANGE_STREAM_LAG_SECONDS, "scope" => scope).record(lag_seconds);
}

pub fn record_fetch_duration(duration: Duration, scope: &str) {
    histogram!(FETCH_DURATION_SECONDS, "scope" => scope.to_string())
        .record(duration.as_secs_f64());
}

// ============================================================================
// Gauge Metrics
// ============================================================================

pub fn increment_active_streams() {
    gauge!(ACTIVE_STREAMS).increment(1.0);
}

pub fn decrement_active_streams() {
    gauge!(ACTIVE_STREAMS).decrement(1.0);
}

// ============================================================================
// Metric Helper Utilities
// ============================================================================

/// Records the elapsed time when dropped.
///
/// ```rust
/// use changefeed_core::metrics::{record_fetch_duration, Timer};
///
/// {
///     let _timer = Timer::new("collection", |duration, label| {
///         record_fetch_duration(duration, label);
///     });
///     // fetch...
/// }
/// ```
pub struct Timer<F>
where
    F: FnOnce(Duration, &str),
{
    start: std::time::Instant,
    label: String,
    record_fn: Option<F>,
}

impl<F> Timer<F>
where
    F: FnOnce(Duration, &str),
{
    pub fn new(label: impl Into<String>, record_fn: F) -> Self {
        Self {
            start: std::time::Instant::now(),
            label: label.into(),
            record_fn: Some(record_fn),
        }
    }
}

impl<F> Drop for Timer<F>
where
    F: FnOnce(Duration, &str),
{
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        if let Some(record_fn) = self.record_fn.take() {
            record_fn(duration, &self.label);
        }
    }
}
