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

//! Pull-based executor for an opened change stream.
//!
//! A [`ChangeStream`] runs the stages of a [`ChangeStreamPlan`] against an
//! [`OplogReader`]. Each call to [`ChangeStream::next`] yields exactly one
//! [`StreamItem`]:
//!
//! - `Event`: the next change event
//! - `Pending`: the bounded await elapsed with nothing to deliver
//! - `Invalidated`: the stream was invalidated; reported once, after the
//!   invalidate event itself
//! - `Exhausted`: the log was closed, or the stream is already closed
//!
//! The fetch from the reader is the only suspension point. It is bounded by
//! [`StreamConfig::await_data_timeout`] and raced against the stream's
//! [`Interrupt`], so an interrupted pull returns promptly with
//! [`ChangeStreamError::Interrupted`].
//!
//! # Example
//!
//! ```rust,ignore
//! use changefeed_core::stream::{ChangeStream, StreamConfig, StreamItem};
//!
//! let mut stream = ChangeStream::new(&plan, reader, StreamConfig::default())?;
//! loop {
//!     match stream.next().await? {
//!         StreamItem::Event(event) => println!("{event}"),
//!         StreamItem::Pending => continue,
//!         StreamItem::Invalidated | StreamItem::Exhausted => break,
//!     }
//! }
//! ```

use crate::close_cursor::{CloseCursor, Gate};
use crate::error::{ChangeStreamError, Result};
use crate::event::ChangeEvent;
use crate::filter::FilterSpec;
use crate::metrics::{self, Timer};
use crate::resume_token::{cmp_timestamps, ResumeToken};
use crate::source::{OplogReader, PostImageLookup};
use crate::stage::{ChangeStreamPlan, Stage};
use crate::transform::{DefaultTransform, Transform};
use async_trait::async_trait;
use bson::Timestamp;
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Default bound on a single await for new log entries.
pub const DEFAULT_AWAIT_DATA_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest accepted await bound.
pub const MAX_AWAIT_DATA_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of log entries requested per fetch.
pub const DEFAULT_BATCH_SIZE: usize = 101;

/// Slack granted to a reader past its await bound before the fetch is abandoned.
const READER_GRACE: Duration = Duration::from_millis(100);

/// Executor configuration.
///
/// ```rust
/// use changefeed_core::stream::StreamConfig;
/// use std::time::Duration;
///
/// let config = StreamConfig::builder()
///     .await_data_timeout(Duration::from_millis(250))
///     .batch_size(500)
///     .build()
///     .unwrap();
/// assert_eq!(config.batch_size, 500);
///
/// assert!(StreamConfig::builder().batch_size(0).build().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Longest a single pull waits for new log entries
    pub await_data_timeout: Duration,

    /// Log entries requested per fetch
    pub batch_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            await_data_timeout: DEFAULT_AWAIT_DATA_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl StreamConfig {
    #[must_use]
    pub fn builder() -> StreamConfigBuilder {
        StreamConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// Returns an error if:
    /// - `await_data_timeout` is zero or above [`MAX_AWAIT_DATA_TIMEOUT`]
    /// - `batch_size` is 0
    pub fn validate(&self) -> Result<()> {
        if self.await_data_timeout.is_zero() {
            return Err(ChangeStreamError::Configuration(
                "await_data_timeout must be greater than 0".to_string(),
            ));
        }

        if self.await_data_timeout > MAX_AWAIT_DATA_TIMEOUT {
            return Err(ChangeStreamError::Configuration(format!(
                "await_data_timeout ({:?}) must be <= {:?}",
                self.await_data_timeout, MAX_AWAIT_DATA_TIMEOUT
            )));
        }

        if self.batch_size == 0 {
            return Err(ChangeStreamError::Configuration(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for [`StreamConfig`].
#[derive(Debug, Default)]
pub struct StreamConfigBuilder {
    await_data_timeout: Option<Duration>,
    batch_size: Option<usize>,
}

impl StreamConfigBuilder {
    /// Sets the await bound of a single pull.
    ///
    /// Default: 1 second
    #[must_use]
    pub fn await_data_timeout(mut self, timeout: Duration) -> Self {
        self.await_data_timeout = Some(timeout);
        self
    }

    /// Sets the number of log entries requested per fetch.
    ///
    /// Default: 101
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ChangeStreamError::Configuration` if validation fails.
    pub fn build(self) -> Result<StreamConfig> {
        let config = StreamConfig {
            await_data_timeout: self.await_data_timeout.unwrap_or(DEFAULT_AWAIT_DATA_TIMEOUT),
            batch_size: self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Result of one pull.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// The next change event
    Event(ChangeEvent),

    /// Nothing deliverable within the await bound
    Pending,

    /// Terminal signal, reported once after the invalidate event
    Invalidated,

    /// No more events will ever be produced
    Exhausted,
}

impl StreamItem {
    /// Returns true if no further events can follow.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Invalidated | Self::Exhausted)
    }

    #[must_use]
    pub fn into_event(self) -> Option<ChangeEvent> {
        match self {
            Self::Event(event) => Some(event),
            _ => None,
        }
    }
}

/// Creates a connected interrupt handle and signal.
///
/// ```rust
/// use changefeed_core::stream::interrupt_channel;
///
/// let (handle, interrupt) = interrupt_channel();
/// assert!(!interrupt.is_interrupted());
/// handle.interrupt();
/// assert!(interrupt.is_interrupted());
/// ```
#[must_use]
pub fn interrupt_channel() -> (InterruptHandle, Interrupt) {
    let (tx, rx) = watch::channel(false);
    (InterruptHandle { tx: Arc::new(tx) }, Interrupt { rx })
}

/// Side of an interrupt channel that cancels pulls.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl InterruptHandle {
    /// Interrupts every stream holding the paired [`Interrupt`].
    pub fn interrupt(&self) {
        self.tx.send_replace(true);
    }
}

/// Cancellation signal observed at every pull boundary.
#[derive(Debug, Clone)]
pub struct Interrupt {
    rx: watch::Receiver<bool>,
}

impl Interrupt {
    /// A signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once the signal fires.
    pub async fn interrupted(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Handle dropped without interrupting.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::never()
    }
}

/// What a merge point pulls from.
#[async_trait]
pub trait EventSource: Send {
    /// Pulls the next item.
    ///
    /// # Errors
    ///
    /// Propagates reader faults and resumability failures.
    async fn next(&mut self) -> Result<StreamItem>;

    /// Highest log timestamp this source has fully passed.
    ///
    /// Every event the source produces from now on has a strictly later
    /// cluster time. `None` when no such bound is known yet.
    fn high_water_mark(&self) -> Option<Timestamp>;

    /// Adapts the source into a stream of events ending after the terminal signal.
    ///
    /// `Pending` pulls are retried; an error is yielded once and ends the stream.
    fn into_stream(self) -> BoxStream<'static, Result<ChangeEvent>>
    where
        Self: Sized + 'static,
    {
        futures::stream::unfold(Some(self), |state| async move {
            let mut source = state?;
            loop {
                match source.next().await {
                    Ok(StreamItem::Event(event)) => return Some((Ok(event), Some(source))),
                    Ok(StreamItem::Pending) => continue,
                    Ok(StreamItem::Invalidated | StreamItem::Exhausted) => return None,
                    Err(e) => return Some((Err(e), None)),
                }
            }
        })
        .boxed()
    }
}

/// Per-event stages shared by a single stream and a merge point:
/// resume-token verification, close-cursor and post-image lookup.
pub(crate) struct Delivery {
    scope_kind: &'static str,
    expected_token: Option<ResumeToken>,
    close_cursor: Option<CloseCursor>,
    lookup_post_image: bool,
    post_images: Option<Arc<dyn PostImageLookup>>,
}

impl Delivery {
    pub(crate) fn from_stages(stages: &[Stage], scope_kind: &'static str) -> Self {
        let mut delivery = Self {
            scope_kind,
            expected_token: None,
            close_cursor: None,
            lookup_post_image: false,
            post_images: None,
        };
        for stage in stages {
            match stage {
                Stage::EnsureResumeTokenPresent(token) => {
                    delivery.expected_token = Some(token.clone());
                }
                Stage::CloseCursor => delivery.close_cursor = Some(CloseCursor::new(scope_kind)),
                Stage::LookupPostImage => delivery.lookup_post_image = true,
                Stage::OplogMatch(_)
                | Stage::Transform
                | Stage::CheckResumability(_)
                | Stage::MergePresorted => {}
            }
        }
        delivery
    }

    pub(crate) fn set_post_images(&mut self, lookup: Arc<dyn PostImageLookup>) {
        self.post_images = Some(lookup);
    }

    pub(crate) fn gate(&mut self) -> Gate {
        self.close_cursor.as_mut().map_or(Gate::Proceed, CloseCursor::gate)
    }

    /// Runs the per-event stages; `None` means the event is not delivered.
    pub(crate) async fn admit(&mut self, mut event: ChangeEvent) -> Result<Option<ChangeEvent>> {
        if let Some(expected) = &self.expected_token {
            match event.id.cmp(expected) {
                Ordering::Less => {
                    trace!(token = %event.id, "Skipping event before resume token");
                    return Ok(None);
                }
                Ordering::Equal => {
                    debug!(token = %expected, "Resume token found in change stream");
                    self.expected_token = None;
                    return Ok(None);
                }
                Ordering::Greater => {
                    error!(expected = %expected, found = %event.id, "Resume token not found");
                    return Err(ChangeStreamError::ResumeTokenNotFound {
                        token: expected.to_string(),
                    });
                }
            }
        }

        if let Some(close_cursor) = &mut self.close_cursor {
            close_cursor.observe(&event);
        }

        if self.lookup_post_image && event.is_update() {
            event.full_document = self.post_image(&event).await?;
        }

        metrics::increment_events_delivered(self.scope_kind, event.operation.as_str());
        Ok(Some(event))
    }

    async fn post_image(&self, event: &ChangeEvent) -> Result<Option<bson::Document>> {
        let lookup = self.post_images.as_ref().ok_or_else(|| {
            ChangeStreamError::Configuration(
                "fullDocument 'updateLookup' requires a post-image lookup".to_string(),
            )
        })?;
        let Some(ns) = &event.namespace else {
            return Err(ChangeStreamError::unexpected_type("ns", "object", None));
        };
        let Some(key) = &event.document_key else {
            return Err(ChangeStreamError::unexpected_type("documentKey", "object", None));
        };
        Ok(lookup.lookup(ns, key).await?)
    }
}

enum Fetched {
    Entries,
    Empty,
    Closed,
}

/// A change stream reading one operation log.
///
/// Runs a replica-set member or shard plan. Router plans are run by
/// [`MergedChangeStream`](crate::merge::MergedChangeStream).
///
/// # Thread Safety
///
/// `ChangeStream` is `Send` but not `Sync`; it is owned by the task pulling from it.
pub struct ChangeStream<R> {
    reader: R,
    filter: FilterSpec,
    transform: Arc<dyn Transform>,
    config: StreamConfig,
    delivery: Delivery,
    history_check: Option<Timestamp>,
    buffer: VecDeque<ChangeEvent>,
    high_water_mark: Option<Timestamp>,
    exhausted: bool,
    interrupt: Interrupt,
    scope_kind: &'static str,
}

impl<R: OplogReader> ChangeStream<R> {
    /// Creates an executor for `plan` reading from `reader`.
    ///
    /// Events are produced by [`DefaultTransform`] unless another transform
    /// is supplied with [`with_transform`](Self::with_transform).
    ///
    /// # Errors
    ///
    /// Returns `ChangeStreamError::Configuration` if `config` is invalid or
    /// `plan` has no oplog match stage (a router plan).
    pub fn new(plan: &ChangeStreamPlan, reader: R, config: StreamConfig) -> Result<Self> {
        config.validate()?;

        let filter = plan.filter().cloned().ok_or_else(|| {
            ChangeStreamError::Configuration(
                "a plan without an oplog match stage must be run by a merge point".to_string(),
            )
        })?;
        let history_check = plan.stages().iter().find_map(|stage| match stage {
            Stage::CheckResumability(ts) => Some(*ts),
            _ => None,
        });
        let scope_kind = plan.scope().kind();

        // Entries at or before an exclusive start are already behind us.
        let high_water_mark = (!filter.is_inclusive()).then(|| filter.start());

        info!(
            scope = %plan.scope(),
            role = %plan.role(),
            start = ?filter.start(),
            inclusive = filter.is_inclusive(),
            "Starting change stream"
        );
        metrics::increment_active_streams();

        Ok(Self {
            reader,
            transform: Arc::new(DefaultTransform::new(filter.clone())),
            filter,
            config,
            delivery: Delivery::from_stages(plan.stages(), scope_kind),
            history_check,
            buffer: VecDeque::new(),
            high_water_mark,
            exhausted: false,
            interrupt: Interrupt::never(),
            scope_kind,
        })
    }

    /// Replaces the transform.
    #[must_use]
    pub fn with_transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transform = transform;
        self
    }

    /// Sets the post-image lookup used when the plan has `LookupPostImage`.
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
    pub fn filter(&self) -> &FilterSpec {
        &self.filter
    }

    /// Pulls the next item.
    ///
    /// # Errors
    ///
    /// - [`ChangeStreamError::Interrupted`] if the interrupt fired.
    /// - [`ChangeStreamError::HistoryLost`] if the log no longer reaches the
    ///   resume point.
    /// - [`ChangeStreamError::ResumeTokenNotFound`] if the resumed-from event
    ///   is missing.
    /// - [`ChangeStreamError::Source`] for reader faults, unmodified.
    pub async fn next(&mut self) -> Result<StreamItem> {
        match self.delivery.gate() {
            Gate::Proceed => {}
            Gate::Terminate => return Ok(StreamItem::Invalidated),
            Gate::Closed => return Ok(StreamItem::Exhausted),
        }

        if self.interrupt.is_interrupted() {
            return Err(ChangeStreamError::Interrupted);
        }

        if let Some(requested) = self.history_check {
            self.check_history(requested).await?;
            self.history_check = None;
        }

        loop {
            while let Some(event) = self.buffer.pop_front() {
                if let Some(event) = self.delivery.admit(event).await? {
                    return Ok(StreamItem::Event(event));
                }
            }

            if self.exhausted {
                return Ok(StreamItem::Exhausted);
            }

            match self.fetch().await? {
                Fetched::Entries => {}
                Fetched::Empty => return Ok(StreamItem::Pending),
                Fetched::Closed => self.exhausted = true,
            }
        }
    }

    async fn check_history(&mut self, requested: Timestamp) -> Result<()> {
        let earliest = self.reader.earliest_timestamp().await?;
        match earliest {
            Some(earliest) if cmp_timestamps(earliest, requested) == Ordering::Greater => {
                error!(
                    requested = ?requested,
                    earliest = ?earliest,
                    "Oplog no longer reaches the resume point"
                );
                Err(ChangeStreamError::HistoryLost {
                    requested: format_timestamp(requested),
                    earliest: format_timestamp(earliest),
                })
            }
            _ => Ok(()),
        }
    }

    async fn fetch(&mut self) -> Result<Fetched> {
        let scope = self.scope_kind;
        let max_await = self.config.await_data_timeout;

        let outcome = {
            let _timer = Timer::new(scope, |duration, label| {
                metrics::record_fetch_duration(duration, label);
            });
            let fetch = self
                .reader
                .next_batch(&self.filter, self.config.batch_size, max_await);
            tokio::select! {
                biased;
                () = self.interrupt.interrupted() => {
                    debug!(scope, "Change stream fetch interrupted");
                    return Err(ChangeStreamError::Interrupted);
                }
                outcome = tokio::time::timeout(max_await + READER_GRACE, fetch) => outcome,
            }
        };

        let batch = match outcome {
            Ok(result) => result?,
            Err(_) => {
                warn!(scope, ?max_await, "Oplog reader overran its await bound");
                metrics::increment_empty_batches(scope);
                return Ok(Fetched::Empty);
            }
        };

        let Some(batch) = batch else {
            info!(scope, "Oplog closed; change stream exhausted");
            return Ok(Fetched::Closed);
        };

        self.advance_high_water_mark(batch.high_water_mark);
        if batch.is_empty() {
            metrics::increment_empty_batches(scope);
            return Ok(Fetched::Empty);
        }

        metrics::increment_entries_scanned(batch.entries.len(), scope);
        for entry in &batch.entries {
            // Readers may push down a coarser predicate.
            if !self.filter.matches(entry) {
                trace!(ts = ?entry.ts, ns = %entry.ns, "Entry outside filter");
                continue;
            }

            let events = self.transform.apply(entry)?;
            if events.is_empty() {
                metrics::increment_transform_discards(scope);
                continue;
            }

            if let Some(wall) = entry.wall {
                let lag = (Utc::now() - wall).num_milliseconds() as f64 / 1000.0;
                metrics::record_change_stream_lag(lag.max(0.0), scope);
            }
            self.buffer.extend(events);
        }

        Ok(Fetched::Entries)
    }

    fn advance_high_water_mark(&mut self, ts: Timestamp) {
        let advanced = match self.high_water_mark {
            Some(current) => cmp_timestamps(ts, current) == Ordering::Greater,
            None => true,
        };
        if advanced {
            self.high_water_mark = Some(ts);
        }
    }
}

#[async_trait]
impl<R: OplogReader> EventSource for ChangeStream<R> {
    async fn next(&mut self) -> Result<StreamItem> {
        ChangeStream::next(self).await
    }

    fn high_water_mark(&self) -> Option<Timestamp> {
        // Buffered events may sit at or below the mark.
        if self.buffer.is_empty() {
            self.high_water_mark
        } else {
            None
        }
    }
}

impl<R> Drop for ChangeStream<R> {
    fn drop(&mut self) {
        metrics::decrement_active_streams();
    }
}

fn format_timestamp(ts: Timestamp) -> String {
    format!("Timestamp({}, {})", ts.time, ts.increment)
}
