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

//! Stream-open options.
//!
//! [`ChangeStreamOptions`] is the parsed body of a `$changeStream` stage:
//!
//! ```text
//! { $changeStream: {
//!     resumeAfter: <resume token>,
//!     startAtClusterTime: { ts: <timestamp> },
//!     $_resumeAfterClusterTime: { ts: <timestamp> },   // deprecated
//!     fullDocument: "default" | "updateLookup",
//!     allChangesForCluster: <bool>,
//! } }
//! ```
//!
//! At most one of the three position options may be given; that rule is
//! enforced by [`crate::legality::validate`], not by parsing, so that the
//! rejection carries the proper error kind.

use crate::error::{ChangeStreamError, Result};
use crate::resume_token::ResumeToken;
use bson::{doc, Bson, Document, Timestamp};
use std::fmt;
use std::str::FromStr;

/// Name of the stage carrying the options.
pub const STAGE_NAME: &str = "$changeStream";

const RESUME_AFTER: &str = "resumeAfter";
const START_AT_CLUSTER_TIME: &str = "startAtClusterTime";
const RESUME_AFTER_CLUSTER_TIME: &str = "$_resumeAfterClusterTime";
const FULL_DOCUMENT: &str = "fullDocument";
const ALL_CHANGES_FOR_CLUSTER: &str = "allChangesForCluster";

/// Whether update events carry the current document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FullDocument {
    /// Updates carry only their delta.
    #[default]
    Default,

    /// Updates are enriched with a post-image lookup.
    UpdateLookup,
}

impl FullDocument {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::UpdateLookup => "updateLookup",
        }
    }
}

impl FromStr for FullDocument {
    type Err = ChangeStreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(Self::Default),
            "updateLookup" => Ok(Self::UpdateLookup),
            other => Err(ChangeStreamError::InvalidOptions(format!(
                "unrecognized value for the 'fullDocument' option. Expected \"default\" or \"updateLookup\", got \"{other}\""
            ))),
        }
    }
}

impl fmt::Display for FullDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options recognised when opening a change stream.
///
/// ```rust
/// use bson::Timestamp;
/// use changefeed_core::options::{ChangeStreamOptions, FullDocument};
///
/// let options = ChangeStreamOptions::builder()
///     .start_at_cluster_time(Timestamp { time: 42, increment: 0 })
///     .full_document(FullDocument::UpdateLookup)
///     .build();
///
/// let reparsed = ChangeStreamOptions::from_document(&options.to_document().unwrap()).unwrap();
/// assert_eq!(reparsed, options);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeStreamOptions {
    /// Resume just after this event
    pub resume_after: Option<ResumeToken>,

    /// Start from this cluster time
    pub start_at_cluster_time: Option<Timestamp>,

    /// Legacy spelling of `start_at_cluster_time`
    pub resume_after_cluster_time: Option<Timestamp>,

    /// Post-image enrichment of updates
    pub full_document: FullDocument,

    /// Watch every user database of the cluster
    pub all_changes_for_cluster: bool,
}

impl ChangeStreamOptions {
    #[must_use]
    pub fn builder() -> ChangeStreamOptionsBuilder {
        ChangeStreamOptionsBuilder::default()
    }

    /// Names of the position options that are set.
    #[must_use]
    pub fn position_options(&self) -> Vec<&'static str> {
        let mut set = Vec::new();
        if self.resume_after.is_some() {
            set.push(RESUME_AFTER);
        }
        if self.resume_after_cluster_time.is_some() {
            set.push(RESUME_AFTER_CLUSTER_TIME);
        }
        if self.start_at_cluster_time.is_some() {
            set.push(START_AT_CLUSTER_TIME);
        }
        set
    }

    /// Returns true if no starting position was given.
    #[must_use]
    pub fn has_no_position(&self) -> bool {
        self.position_options().is_empty()
    }

    /// Returns a copy resuming after `token`, with any timestamp start cleared.
    #[must_use]
    pub fn with_resume_token(&self, token: ResumeToken) -> Self {
        Self {
            resume_after: Some(token),
            start_at_cluster_time: None,
            resume_after_cluster_time: None,
            ..self.clone()
        }
    }

    /// Parses the body of a `$changeStream` stage.
    ///
    /// # Errors
    ///
    /// - [`ChangeStreamError::InvalidOptions`] for unknown fields, wrongly
    ///   typed values or an unrecognised `fullDocument`.
    /// - [`ChangeStreamError::InvalidResumeToken`] for a malformed `resumeAfter`.
    pub fn from_document(body: &Document) -> Result<Self> {
        let mut options = Self::default();
        for (key, value) in body {
            match key.as_str() {
                RESUME_AFTER => options.resume_after = Some(ResumeToken::from_bson(value)?),
                START_AT_CLUSTER_TIME => {
                    options.start_at_cluster_time = Some(parse_cluster_time(key, value)?);
                }
                RESUME_AFTER_CLUSTER_TIME => {
                    options.resume_after_cluster_time = Some(parse_cluster_time(key, value)?);
                }
                FULL_DOCUMENT => match value {
                    Bson::String(s) => options.full_document = s.parse()?,
                    other => return Err(wrong_type(key, "string", other)),
                },
                ALL_CHANGES_FOR_CLUSTER => match value {
                    Bson::Boolean(b) => options.all_changes_for_cluster = *b,
                    other => return Err(wrong_type(key, "bool", other)),
                },
                unknown => {
                    return Err(ChangeStreamError::InvalidOptions(format!(
                        "unrecognized field '{unknown}' in {STAGE_NAME} stage"
                    )))
                }
            }
        }
        Ok(options)
    }

    /// Renders the options as a `$changeStream` stage body.
    ///
    /// Defaults are written explicitly for `fullDocument`; unset positions
    /// and a false cluster flag are omitted.
    pub fn to_document(&self) -> Result<Document> {
        let mut body = Document::new();
        if let Some(token) = &self.resume_after {
            body.insert(RESUME_AFTER, token.to_document()?);
        }
        if let Some(ts) = self.start_at_cluster_time {
            body.insert(START_AT_CLUSTER_TIME, doc! { "ts": ts });
        }
        if let Some(ts) = self.resume_after_cluster_time {
            body.insert(RESUME_AFTER_CLUSTER_TIME, doc! { "ts": ts });
        }
        body.insert(FULL_DOCUMENT, self.full_document.as_str());
        if self.all_changes_for_cluster {
            body.insert(ALL_CHANGES_FOR_CLUSTER, true);
        }
        Ok(body)
    }
}

/// Builder for [`ChangeStreamOptions`].
#[derive(Debug, Default)]
pub struct ChangeStreamOptionsBuilder {
    options: ChangeStreamOptions,
}

impl ChangeStreamOptionsBuilder {
    #[must_use]
    pub fn resume_after(mut self, token: ResumeToken) -> Self {
        self.options.resume_after = Some(token);
        self
    }

    #[must_use]
    pub fn start_at_cluster_time(mut self, ts: Timestamp) -> Self {
        self.options.start_at_cluster_time = Some(ts);
        self
    }

    /// Sets the deprecated `$_resumeAfterClusterTime` option.
    #[must_use]
    pub fn resume_after_cluster_time(mut self, ts: Timestamp) -> Self {
        self.options.resume_after_cluster_time = Some(ts);
        self
    }

    #[must_use]
    pub fn full_document(mut self, full_document: FullDocument) -> Self {
        self.options.full_document = full_document;
        self
    }

    #[must_use]
    pub fn all_changes_for_cluster(mut self, all: bool) -> Self {
        self.options.all_changes_for_cluster = all;
        self
    }

    /// Builds the options.
    ///
    /// Mutually exclusive positions are accepted here and rejected when
    /// the stream is opened.
    #[must_use]
    pub fn build(self) -> ChangeStreamOptions {
        self.options
    }
}

/// Substitutes `token` into a previously issued aggregate command.
///
/// The first pipeline stage must be `$changeStream`. Its `resumeAfter` is set
/// to `token` and any `startAtClusterTime` or `$_resumeAfterClusterTime` is
/// removed; every other option, stage and command field is preserved.
///
/// # Errors
///
/// Returns [`ChangeStreamError::InvalidOptions`] if the command has no
/// pipeline or its first stage is not `$changeStream`.
///
/// ```rust
/// use bson::{doc, Timestamp};
/// use changefeed_core::options::replace_resume_token_in_command;
/// use changefeed_core::resume_token::ResumeToken;
///
/// let cmd = doc! {
///     "aggregate": "orders",
///     "pipeline": [
///         { "$changeStream": { "startAtClusterTime": { "ts": Timestamp { time: 1, increment: 0 } } } },
///         { "$match": { "operationType": "insert" } },
///     ],
/// };
/// let token = ResumeToken::from_timestamp(Timestamp { time: 5, increment: 0 });
/// let updated = replace_resume_token_in_command(&cmd, &token).unwrap();
///
/// let pipeline = updated.get_array("pipeline").unwrap();
/// let stage = pipeline[0].as_document().unwrap().get_document("$changeStream").unwrap();
/// assert!(stage.contains_key("resumeAfter"));
/// assert!(!stage.contains_key("startAtClusterTime"));
/// assert_eq!(pipeline.len(), 2);
/// ```
pub fn replace_resume_token_in_command(cmd: &Document, token: &ResumeToken) -> Result<Document> {
    let mut pipeline = cmd
        .get_array("pipeline")
        .map_err(|_| ChangeStreamError::InvalidOptions("command has no pipeline".to_string()))?
        .clone();

    let stage = pipeline
        .first_mut()
        .and_then(|first| match first {
            Bson::Document(first) => first.get_document_mut(STAGE_NAME).ok(),
            _ => None,
        })
        .ok_or_else(|| {
            ChangeStreamError::InvalidOptions(format!(
                "the first pipeline stage must be {STAGE_NAME} to substitute a resume token"
            ))
        })?;

    stage.insert(RESUME_AFTER, token.to_document()?);
    stage.remove(START_AT_CLUSTER_TIME);
    stage.remove(RESUME_AFTER_CLUSTER_TIME);

    let mut updated = cmd.clone();
    updated.insert("pipeline", pipeline);
    Ok(updated)
}

fn parse_cluster_time(field: &str, value: &Bson) -> Result<Timestamp> {
    match value {
        Bson::Document(d) => match d.get("ts") {
            Some(Bson::Timestamp(ts)) if d.len() == 1 => Ok(*ts),
            _ => Err(ChangeStreamError::InvalidOptions(format!(
                "'{field}' must be of the form {{ts: <timestamp>}}, found {d}"
            ))),
        },
        other => Err(wrong_type(field, "object", other)),
    }
}

fn wrong_type(field: &str, expected: &str, found: &Bson) -> ChangeStreamError {
    ChangeStreamError::InvalidOptions(format!(
        "'{field}' must be of type {expected}, found {:?}",
        found.element_type()
    ))
}
