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

//! Error types shared by every stage of a change stream.
//!
//! Errors raised while a stream is being opened (validation, resume
//! resolution) are configuration errors: they are fatal and never retried.
//! Errors raised while pulling are either faults from the log reader, which
//! are passed through untouched, or fatal resumability failures.
//!
//! Invalidation is deliberately absent from this enum. It is a terminal
//! signal ([`StreamItem::Invalidated`](crate::stream::StreamItem::Invalidated)),
//! not an error.

use crate::legality::FeatureCompatibilityVersion;
use crate::source::SourceError;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ChangeStreamError>;

/// Errors that can occur while opening or pulling from a change stream.
#[derive(Debug, Error)]
pub enum ChangeStreamError {
    /// Malformed resume token, a token missing its collection uuid, or the
    /// terminal token of an invalidated stream.
    #[error("Invalid resume token: {0}")]
    InvalidResumeToken(String),

    /// Internal database/collection targeted, or a cluster-wide stream
    /// opened on something other than the admin database.
    #[error("Namespace not allowed: {0}")]
    NamespaceNotAllowed(String),

    /// Feature requested below the feature compatibility version that supports it.
    #[error("{feature} is not allowed at feature compatibility version {current} (requires {required})")]
    FeatureNotAllowedAtVersion {
        feature: &'static str,
        current: FeatureCompatibilityVersion,
        required: FeatureCompatibilityVersion,
    },

    /// More than one starting position option was supplied.
    #[error("Only one type of resume option is allowed, but multiple were found: {0}")]
    ConflictingResumeOptions(String),

    /// The resume token's collection no longer exists.
    #[error("The resume token UUID {uuid} does not exist. Has the collection been dropped?")]
    CollectionNotFound { uuid: String },

    /// A field of a transformed event or log entry has the wrong BSON type.
    #[error("Entry field \"{field}\" should be {expected}, found: {found}")]
    UnexpectedFieldType {
        field: String,
        expected: &'static str,
        found: String,
    },

    /// Unrecognised or malformed stream-open option.
    #[error("Invalid change stream options: {0}")]
    InvalidOptions(String),

    /// Change streams need a replicated log to read from.
    #[error("Change streams are only supported on replica sets")]
    ReplicaSetRequired,

    /// The event named by `resumeAfter` was not found in the filtered log.
    #[error("Resume token {token} was not found in the change stream")]
    ResumeTokenNotFound { token: String },

    /// The log no longer reaches back far enough to resume.
    #[error("Resume of change stream was not possible, as the resume point {requested} may no longer be in the oplog (earliest entry: {earliest})")]
    HistoryLost { requested: String, earliest: String },

    /// The pull was cancelled through its interrupt handle.
    #[error("Change stream operation was interrupted")]
    Interrupted,

    /// Fault raised by the external log reader, propagated unmodified.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Invalid runtime configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ChangeStreamError {
    /// Builds an [`ChangeStreamError::UnexpectedFieldType`] from a BSON value.
    pub(crate) fn unexpected_type(
        field: impl Into<String>,
        expected: &'static str,
        found: Option<&bson::Bson>,
    ) -> Self {
        Self::UnexpectedFieldType {
            field: field.into(),
            expected,
            found: found.map_or_else(
                || "missing".to_string(),
                |value| format!("{:?}", value.element_type()),
            ),
        }
    }

    /// Returns true for errors raised while opening a stream.
    ///
    /// These describe a request that can never succeed as written.
    #[must_use]
    pub fn is_open_time(&self) -> bool {
        matches!(
            self,
            Self::InvalidResumeToken(_)
                | Self::NamespaceNotAllowed(_)
                | Self::FeatureNotAllowedAtVersion { .. }
                | Self::ConflictingResumeOptions(_)
                | Self::CollectionNotFound { .. }
                | Self::InvalidOptions(_)
                | Self::ReplicaSetRequired
                | Self::Configuration(_)
        )
    }

    /// Returns the error category for metrics/logging.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidResumeToken(_) => "invalid_token",
            Self::NamespaceNotAllowed(_) => "namespace_not_allowed",
            Self::FeatureNotAllowedAtVersion { .. } => "feature_not_allowed",
            Self::ConflictingResumeOptions(_) => "conflicting_options",
            Self::CollectionNotFound { .. } => "collection_not_found",
            Self::UnexpectedFieldType { .. } => "unexpected_field_type",
            Self::InvalidOptions(_) => "invalid_options",
            Self::ReplicaSetRequired => "replica_set_required",
            Self::ResumeTokenNotFound { .. } => "token_not_found",
            Self::HistoryLost { .. } => "history_lost",
            Self::Interrupted => "interrupted",
            Self::Source(_) => "source",
            Self::Configuration(_) => "configuration",
        }
    }
}
