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

//! Resume position resolution.
//!
//! Reconciles the ways of naming a starting point into one canonical
//! `(timestamp, inclusive)` pair plus an optional resumability check:
//!
//! | option | start | check |
//! |--------|-------|-------|
//! | `resumeAfter` | token's `clusterTime`, inclusive | token presence (shards: history) |
//! | `$_resumeAfterClusterTime` | given time, exclusive | none |
//! | `startAtClusterTime` | given time, exclusive | history (not on a router) |
//! | nothing | last applied, exclusive (router: none) | none |

use crate::error::{ChangeStreamError, Result};
use crate::legality::FeatureCompatibilityVersion;
use crate::options::ChangeStreamOptions;
use crate::resume_token::ResumeToken;
use crate::scope::Scope;
use crate::source::CollectionCatalog;
use bson::Timestamp;
use std::fmt;
use std::sync::Once;
use tracing::{debug, instrument, warn};

static DEPRECATED_CLUSTER_TIME_WARNING: Once = Once::new();

/// Where the stream is being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Replica set member serving the stream directly.
    ReplicaSetMember {
        /// Timestamp of the last entry applied locally
        last_applied: Timestamp,
    },

    /// Shard producing one input of a router-level merge.
    Shard {
        /// Timestamp of the last entry applied locally
        last_applied: Timestamp,
    },

    /// Routing node merging per-shard streams.
    Router {
        /// The router's current view of cluster time
        cluster_time: Timestamp,
    },

    /// Server without a replicated log.
    Standalone,
}

impl Role {
    #[must_use]
    pub fn is_router(&self) -> bool {
        matches!(self, Self::Router { .. })
    }

    /// Returns true for a node whose output feeds a merge.
    #[must_use]
    pub fn needs_merge(&self) -> bool {
        matches!(self, Self::Shard { .. })
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ReplicaSetMember { .. } => "replica_set_member",
            Self::Shard { .. } => "shard",
            Self::Router { .. } => "router",
            Self::Standalone => "standalone",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First log position a stream reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPosition {
    pub ts: Timestamp,
    pub inclusive: bool,
}

/// Verification applied to the head of a resumed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeCheck {
    /// The event with this token must be the first one read; it is swallowed.
    EnsureTokenPresent(ResumeToken),

    /// The log must still reach back to this time.
    CheckHistory(Timestamp),
}

/// Canonical result of resume resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePosition {
    /// `None` only on a router opened without an explicit position
    pub start: Option<StartPosition>,

    pub check: Option<ResumeCheck>,
}

/// Resolves the starting position of a stream.
///
/// `options` is expected to have passed [`crate::legality::validate`];
/// conflicting positions are nevertheless rejected again here.
///
/// # Errors
///
/// - [`ChangeStreamError::ReplicaSetRequired`] on a standalone server.
/// - [`ChangeStreamError::InvalidResumeToken`] for a token without a uuid
///   or one taken from an invalidate event.
/// - [`ChangeStreamError::CollectionNotFound`] when a single-collection
///   stream resumes on a collection that no longer exists.
/// - [`ChangeStreamError::ConflictingResumeOptions`] for several positions.
#[instrument(level = "debug", skip(options, scope, catalog), fields(scope = %scope))]
pub fn resolve(
    options: &ChangeStreamOptions,
    scope: &Scope,
    role: Role,
    fcv: FeatureCompatibilityVersion,
    catalog: &dyn CollectionCatalog,
) -> Result<ResumePosition> {
    let default_start = match role {
        Role::Standalone => return Err(ChangeStreamError::ReplicaSetRequired),
        Role::ReplicaSetMember { last_applied } | Role::Shard { last_applied } => {
            Some(StartPosition {
                ts: last_applied,
                inclusive: false,
            })
        }
        Role::Router { .. } => None,
    };

    let given = options.position_options();
    if given.len() > 1 {
        return Err(ChangeStreamError::ConflictingResumeOptions(given.join(", ")));
    }

    if let Some(token) = &options.resume_after {
        return resolve_token(token, scope, role, catalog);
    }

    if let Some(ts) = options.resume_after_cluster_time {
        // Nothing replaces it below 4.0, where routers still forward it.
        if fcv >= FeatureCompatibilityVersion::START_AT_CLUSTER_TIME {
            DEPRECATED_CLUSTER_TIME_WARNING.call_once(|| {
                warn!(
                    fcv = %fcv,
                    "The '$_resumeAfterClusterTime' option is deprecated, please use 'startAtClusterTime' instead"
                );
            });
        }
        return Ok(ResumePosition {
            start: Some(StartPosition { ts, inclusive: false }),
            check: None,
        });
    }

    if let Some(ts) = options.start_at_cluster_time {
        // A router has no log of its own; the shards it forwards to verify history.
        let check = (!role.is_router()).then_some(ResumeCheck::CheckHistory(ts));
        return Ok(ResumePosition {
            start: Some(StartPosition { ts, inclusive: false }),
            check,
        });
    }

    debug!(role = %role, "No explicit start position; starting after last applied entry");
    Ok(ResumePosition {
        start: default_start,
        check: None,
    })
}

fn resolve_token(
    token: &ResumeToken,
    scope: &Scope,
    role: Role,
    catalog: &dyn CollectionCatalog,
) -> Result<ResumePosition> {
    if token.from_invalidate {
        return Err(ChangeStreamError::InvalidResumeToken(
            "the resume token is from an invalidate event; the stream it ended cannot be resumed"
                .to_string(),
        ));
    }
    let Some(uuid) = &token.uuid else {
        return Err(ChangeStreamError::InvalidResumeToken(
            "the resume token has no collection UUID".to_string(),
        ));
    };

    // Database and cluster streams have no single default collation to
    // preserve, so a dropped collection does not prevent resuming them.
    if scope.is_collection() && !role.is_router() && catalog.lookup_namespace(uuid).is_none() {
        return Err(ChangeStreamError::CollectionNotFound {
            uuid: uuid.to_string(),
        });
    }

    let check = if role.needs_merge() {
        ResumeCheck::CheckHistory(token.cluster_time)
    } else {
        ResumeCheck::EnsureTokenPresent(token.clone())
    };

    debug!(token = %token, role = %role, "Resuming change stream after token");
    Ok(ResumePosition {
        start: Some(StartPosition {
            ts: token.cluster_time,
            inclusive: true,
        }),
        check: Some(check),
    })
}
