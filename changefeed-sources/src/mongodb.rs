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

//! `MongoDB` oplog tailing.
//!
//! [`MongoOplogReader`] reads `local.oplog.rs` of a replica set member with a
//! tailable await-data cursor, pushing the synthesized filter down to the
//! server. [`load_catalog`] and [`MongoPostImageLookup`] provide the other two
//! collaborators a change stream needs.
//!
//! Besides matching entries the server also returns no-op entries, which a
//! replica set writes periodically. They are dropped locally but move the
//! reader's high-water mark, so an idle member does not hold back a merge.
//!
//! # Example
//!
//! ```rust,no_run
//! use changefeed_sources::mongodb::{MongoOplogConfig, MongoOplogReader};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MongoOplogConfig::builder()
//!     .uri("mongodb://localhost:27017/?replicaSet=rs0")
//!     .batch_size(500)
//!     .build()?;
//!
//! let reader = MongoOplogReader::connect(&config).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bson::{doc, Bson, Document, Timestamp};
use changefeed_core::error::{ChangeStreamError, Result};
use changefeed_core::filter::FilterSpec;
use changefeed_core::oplog::OplogEntry;
use changefeed_core::scope::{Namespace, INTERNAL_DBS};
use changefeed_core::source::{
    CatalogSnapshot, OplogBatch, OplogReader, PostImageLookup, SourceError,
};
use futures::{FutureExt, StreamExt, TryStreamExt};
use mongodb::error::ErrorKind;
use mongodb::options::CursorType;
use mongodb::results::CollectionType;
use mongodb::{Client, Collection, Cursor};
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

/// Default oplog namespace of a replica set member.
pub const DEFAULT_OPLOG_NAMESPACE: &str = "local.oplog.rs";

/// Default number of entries requested per server round trip.
pub const DEFAULT_BATCH_SIZE: u32 = 1000;

/// Slack added to the server-side await when waiting on the client side.
///
/// Kept below the executor's fetch grace so the reader gives up first.
const CLIENT_AWAIT_SLACK: Duration = Duration::from_millis(50);

/// Connection settings for [`MongoOplogReader`].
#[derive(Debug, Clone)]
pub struct MongoOplogConfig {
    /// Connection string of a replica set member or the replica set
    pub uri: String,

    /// Namespace of the oplog collection
    pub oplog_namespace: String,

    /// Entries requested per round trip
    pub batch_size: u32,
}

impl MongoOplogConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> MongoOplogConfigBuilder {
        MongoOplogConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// Returns an error if:
    /// - `uri` is empty or not a `mongodb://` / `mongodb+srv://` URI
    /// - `oplog_namespace` has no collection part
    /// - `batch_size` is 0
    pub fn validate(&self) -> Result<()> {
        if !(self.uri.starts_with("mongodb://") || self.uri.starts_with("mongodb+srv://")) {
            return Err(ChangeStreamError::Configuration(format!(
                "uri must start with mongodb:// or mongodb+srv://, got '{}'",
                self.uri
            )));
        }

        if Namespace::parse(&self.oplog_namespace).is_collectionless() {
            return Err(ChangeStreamError::Configuration(format!(
                "oplog_namespace must be <db>.<collection>, got '{}'",
                self.oplog_namespace
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

/// Builder for [`MongoOplogConfig`].
#[derive(Debug, Default)]
pub struct MongoOplogConfigBuilder {
    uri: Option<String>,
    oplog_namespace: Option<String>,
    batch_size: Option<u32>,
}

impl MongoOplogConfigBuilder {
    /// Sets the connection string. Required.
    #[must_use]
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Sets the oplog namespace.
    ///
    /// Default: `local.oplog.rs`
    #[must_use]
    pub fn oplog_namespace(mut self, ns: impl Into<String>) -> Self {
        self.oplog_namespace = Some(ns.into());
        self
    }

    /// Sets the number of entries requested per round trip.
    ///
    /// Default: 1000
    #[must_use]
    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeStreamError::Configuration`] if `uri` is missing or
    /// validation fails.
    pub fn build(self) -> Result<MongoOplogConfig> {
        let uri = self
            .uri
            .ok_or_else(|| ChangeStreamError::Configuration("uri is required".to_string()))?;

        let config = MongoOplogConfig {
            uri,
            oplog_namespace: self
                .oplog_namespace
                .unwrap_or_else(|| DEFAULT_OPLOG_NAMESPACE.to_string()),
            batch_size: self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Maps a driver error onto the collaborator fault kinds.
fn source_error(err: &mongodb::error::Error) -> SourceError {
    match err.kind.as_ref() {
        ErrorKind::ServerSelection { .. } | ErrorKind::Io(_) | ErrorKind::DnsResolve { .. } => {
            SourceError::Connection(err.to_string())
        }
        ErrorKind::Command(_) | ErrorKind::Write(_) | ErrorKind::InvalidArgument { .. } => {
            SourceError::Query(err.to_string())
        }
        ErrorKind::BsonDeserialization(_) => SourceError::Decode(err.to_string()),
        _ => SourceError::Other(err.to_string()),
    }
}

fn oplog_collection(client: &Client, config: &MongoOplogConfig) -> Collection<Document> {
    let ns = Namespace::parse(&config.oplog_namespace);
    client
        .database(&ns.db)
        .collection(ns.coll.as_deref().unwrap_or_default())
}

/// Tailing reader over a `MongoDB` oplog.
///
/// The cursor is opened lazily on the first fetch and reopened after the
/// last scanned entry whenever the server closes it. It stays in the reader
/// while a fetch awaits, so a fetch abandoned by its caller keeps the cursor
/// and its in-flight `getMore` for the next one.
pub struct MongoOplogReader {
    oplog: Collection<Document>,
    batch_size: u32,
    cursor: Option<Cursor<Document>>,
    /// Timestamp of the last entry scanned, matching or not.
    scanned_through: Option<Timestamp>,
}

impl MongoOplogReader {
    /// Connects to the deployment described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeStreamError::Source`] if the client cannot be created.
    #[instrument(skip(config), fields(oplog = %config.oplog_namespace))]
    pub async fn connect(config: &MongoOplogConfig) -> Result<Self> {
        let client = Client::with_uri_str(&config.uri)
            .await
            .map_err(|e| source_error(&e))?;
        info!("Connected oplog reader");
        Ok(Self::with_client(&client, config))
    }

    /// Creates a reader sharing an existing client.
    #[must_use]
    pub fn with_client(client: &Client, config: &MongoOplogConfig) -> Self {
        Self {
            oplog: oplog_collection(client, config),
            batch_size: config.batch_size,
            cursor: None,
            scanned_through: None,
        }
    }

    /// Returns true while a tailable cursor is open.
    #[must_use]
    pub fn is_tailing(&self) -> bool {
        self.cursor.is_some()
    }

    fn open_cursor<'a>(
        &'a self,
        filter: &FilterSpec,
        max_await: Duration,
    ) -> impl std::future::Future<Output = std::result::Result<Cursor<Document>, SourceError>>
           + Send
           + 'a {
        let filter = match self.scanned_through {
            Some(ts) => filter.resumed_after(ts),
            None => filter.clone(),
        };
        debug!(
            start = ?filter.start(),
            inclusive = filter.is_inclusive(),
            "Opening tailable oplog cursor"
        );
        // Borrow only the collection so the future stays `Send`.
        let oplog = &self.oplog;
        let batch_size = self.batch_size;
        async move {
            oplog
                .find(server_filter(&filter))
                .cursor_type(CursorType::TailableAwait)
                .max_await_time(max_await)
                .batch_size(batch_size)
                .no_cursor_timeout(true)
                .await
                .map_err(|e| source_error(&e))
        }
    }

    fn high_water_mark(&self, filter: &FilterSpec) -> Timestamp {
        self.scanned_through.unwrap_or_else(|| filter.start())
    }

    fn idle_batch(&self, filter: &FilterSpec) -> OplogBatch {
        OplogBatch {
            entries: Vec::new(),
            high_water_mark: self.high_water_mark(filter),
        }
    }
}

/// The query sent to the server: the stream's predicate or any no-op entry,
/// both past the start bound. The bound stays top-level so the server can
/// seek to it.
fn server_filter(filter: &FilterSpec) -> Document {
    let ts_op = if filter.is_inclusive() { "$gte" } else { "$gt" };
    doc! {
        "ts": { ts_op: filter.start() },
        "$or": [filter.to_document(), { "op": "n" }],
    }
}

#[async_trait]
impl OplogReader for MongoOplogReader {
    async fn next_batch(
        &mut self,
        filter: &FilterSpec,
        batch_size: usize,
        max_await: Duration,
    ) -> std::result::Result<Option<OplogBatch>, SourceError> {
        if self.cursor.is_none() {
            let cursor = self.open_cursor(filter, max_await).await?;
            self.cursor = Some(cursor);
        }
        let idle = self.idle_batch(filter);
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(Some(idle));
        };

        // The driver keeps an in-flight getMore inside the cursor, so a
        // timed-out `next` loses nothing.
        let first = match tokio::time::timeout(max_await + CLIENT_AWAIT_SLACK, cursor.next()).await {
            Err(_elapsed) => return Ok(Some(idle)),
            Ok(None) => {
                debug!("Oplog cursor exhausted; will reopen");
                self.cursor = None;
                return Ok(Some(idle));
            }
            Ok(Some(Err(e))) => {
                self.cursor = None;
                return Err(source_error(&e));
            }
            Ok(Some(Ok(doc))) => doc,
        };

        let mut scanned = vec![first];
        // Drain what is already buffered without another round trip.
        while scanned.len() < batch_size {
            match cursor.next().now_or_never() {
                Some(Some(Ok(doc))) => scanned.push(doc),
                Some(Some(Err(e))) => {
                    self.cursor = None;
                    return Err(source_error(&e));
                }
                _ => break,
            }
        }

        let mut entries = Vec::with_capacity(scanned.len());
        for doc in &scanned {
            let entry = decode(doc)?;
            self.scanned_through = Some(entry.ts);
            if filter.matches(&entry) {
                entries.push(entry);
            }
        }
        trace!(
            scanned = scanned.len(),
            matched = entries.len(),
            "Fetched oplog batch"
        );

        Ok(Some(OplogBatch {
            entries,
            high_water_mark: self.high_water_mark(filter),
        }))
    }

    async fn earliest_timestamp(&mut self) -> std::result::Result<Option<Timestamp>, SourceError> {
        let first = self
            .oplog
            .find_one(doc! {})
            .sort(doc! { "$natural": 1 })
            .await
            .map_err(|e| source_error(&e))?;
        match first {
            Some(doc) => match doc.get("ts") {
                Some(Bson::Timestamp(ts)) => Ok(Some(*ts)),
                _ => Err(SourceError::Decode(
                    "first oplog entry has no timestamp".to_string(),
                )),
            },
            None => Ok(None),
        }
    }
}

fn decode(doc: &Document) -> std::result::Result<OplogEntry, SourceError> {
    OplogEntry::from_document(doc).map_err(|e| SourceError::Decode(e.to_string()))
}

/// Builds a catalog snapshot of every user collection.
///
/// Views are skipped; they have no uuid and no oplog entries.
///
/// # Errors
///
/// Returns [`ChangeStreamError::Source`] if listing databases or collections fails.
#[instrument(skip(client))]
pub async fn load_catalog(client: &Client) -> Result<CatalogSnapshot> {
    let mut catalog = CatalogSnapshot::new();
    let databases = client
        .list_database_names()
        .await
        .map_err(|e| source_error(&e))?;

    for db in databases.iter().filter(|db| !INTERNAL_DBS.contains(&db.as_str())) {
        let specs: Vec<_> = client
            .database(db)
            .list_collections()
            .await
            .map_err(|e| source_error(&e))?
            .try_collect()
            .await
            .map_err(|e| source_error(&e))?;

        for spec in specs {
            if !matches!(spec.collection_type, CollectionType::Collection) {
                continue;
            }
            match spec.info.uuid.as_ref().map(bson::Binary::to_uuid) {
                Some(Ok(uuid)) => catalog.insert(uuid, Namespace::new(db.as_str(), spec.name)),
                Some(Err(e)) => {
                    warn!(database = %db, collection = %spec.name, error = %e, "Skipping collection with malformed uuid");
                }
                None => {}
            }
        }
    }

    debug!(collections = catalog.len(), "Loaded collection catalog");
    Ok(catalog)
}

/// Post-image lookup by `documentKey` against the live collection.
#[derive(Debug, Clone)]
pub struct MongoPostImageLookup {
    client: Client,
}

impl MongoPostImageLookup {
    /// Creates a lookup issuing queries through `client`.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PostImageLookup for MongoPostImageLookup {
    async fn lookup(
        &self,
        ns: &Namespace,
        document_key: &Document,
    ) -> std::result::Result<Option<Document>, SourceError> {
        let Some(coll) = ns.coll.as_deref() else {
            return Err(SourceError::Query(format!(
                "cannot look up a document in collectionless namespace {ns}"
            )));
        };
        self.client
            .database(&ns.db)
            .collection::<Document>(coll)
            .find_one(document_key.clone())
            .await
            .map_err(|e| source_error(&e))
    }
}
