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

//! Stage assembly for an opened change stream.
//!
//! Opening a stream runs legality validation, resume resolution and filter
//! synthesis, then lays out the stages the executor will run. The layout
//! depends on where the stream runs:
//!
//! | role | stages |
//! |------|--------|
//! | replica set member | `OplogMatch`, `Transform`, resume check, `CloseCursor`, `LookupPostImage` |
//! | shard feeding a merge | `OplogMatch`, `Transform`, `CheckResumability` |
//! | router | `MergePresorted`, `EnsureResumeTokenPresent`, `CloseCursor`, `LookupPostImage` |
//!
//! Resume checks and post-image lookup only appear when the options ask for
//! them. A shard never runs `CloseCursor` or `LookupPostImage`: the merge
//! point owns both.
//!
//! # Example
//!
//! ```rust
//! use bson::Timestamp;
//! use changefeed_core::legality::FeatureCompatibilityVersion;
//! use changefeed_core::options::ChangeStreamOptions;
//! use changefeed_core::resume::Role;
//! use changefeed_core::scope::Namespace;
//! use changefeed_core::source::CatalogSnapshot;
//! use changefeed_core::stage::{ChangeStreamPlan, StreamContext};
//!
//! let ctx = StreamContext::new(
//!     Role::ReplicaSetMember { last_applied: Timestamp { time: 100, increment: 0 } },
//!     FeatureCompatibilityVersion::V4_0,
//! );
//! let plan = ChangeStreamPlan::open(
//!     &Namespace::new("shop", "orders"),
//!     &ChangeStreamOptions::default(),
//!     &ctx,
//!     &CatalogSnapshot::new(),
//! )
//! .unwrap();
//!
//! assert_eq!(plan.stage_names(), vec!["oplogMatch", "transform", "closeCursor"]);
//! ```

use crate::error::{ChangeStreamError, Result};
use crate::filter::FilterSpec;
use crate::legality::{self, FeatureCompatibilityVersion};
use crate::metrics;
use crate::options::{ChangeStreamOptions, FullDocument};
use crate::resume::{self, ResumeCheck, ResumePosition, Role, StartPosition};
use crate::resume_token::ResumeToken;
use crate::scope::{Namespace, Scope};
use crate::source::CollectionCatalog;
use bson::Timestamp;
use std::fmt;
use tracing::{info, instrument, warn};

/// One stage of an assembled change stream.
///
/// The set of stage kinds is closed; executors match on it exhaustively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    /// Reads the operation log through the synthesized predicate.
    OplogMatch(FilterSpec),

    /// Turns raw log entries into change events.
    Transform,

    /// Verifies the resumed-from event is still in the stream, then swallows it.
    EnsureResumeTokenPresent(ResumeToken),

    /// Verifies the log still reaches back to the given time.
    CheckResumability(Timestamp),

    /// Ends the stream after an invalidate event.
    CloseCursor,

    /// Fetches the current document for update events.
    LookupPostImage,

    /// Merges presorted per-shard streams.
    MergePresorted,
}

impl Stage {
    /// Short name, used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::OplogMatch(_) => "oplogMatch",
            Self::Transform => "transform",
            Self::EnsureResumeTokenPresent(_) => "ensureResumeTokenPresent",
            Self::CheckResumability(_) => "checkResumability",
            Self::CloseCursor => "closeCursor",
            Self::LookupPostImage => "lookupPostImage",
            Self::MergePresorted => "mergePresorted",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Deployment facts a stream is opened against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamContext {
    /// Where the stream runs
    pub role: Role,

    /// Feature compatibility version of the deployment
    pub fcv: FeatureCompatibilityVersion,

    /// Whether the request carried its own collation
    pub explicit_collation: bool,
}

impl StreamContext {
    #[must_use]
    pub fn new(role: Role, fcv: FeatureCompatibilityVersion) -> Self {
        Self {
            role,
            fcv,
            explicit_collation: false,
        }
    }

    #[must_use]
    pub fn with_explicit_collation(mut self) -> Self {
        self.explicit_collation = true;
        self
    }
}

/// An opened change stream: its scope, resolved position and stages.
#[derive(Debug, Clone)]
pub struct ChangeStreamPlan {
    namespace: Namespace,
    scope: Scope,
    options: ChangeStreamOptions,
    role: Role,
    fcv: FeatureCompatibilityVersion,
    position: ResumePosition,
    stages: Vec<Stage>,
}

impl ChangeStreamPlan {
    /// Opens a change stream on `ns`.
    ///
    /// # Errors
    ///
    /// Any error of [`legality::validate`] or [`resume::resolve`]. Rejections
    /// are counted in the `changefeed_open_rejections_total` metric.
    #[instrument(skip(options, ctx, catalog), fields(namespace = %ns, role = %ctx.role))]
    pub fn open(
        ns: &Namespace,
        options: &ChangeStreamOptions,
        ctx: &StreamContext,
        catalog: &dyn CollectionCatalog,
    ) -> Result<Self> {
        match Self::assemble(ns, options, ctx, catalog) {
            Ok(plan) => {
                info!(
                    scope = %plan.scope,
                    stages = ?plan.stage_names(),
                    "Change stream opened"
                );
                Ok(plan)
            }
            Err(e) => {
                metrics::increment_open_rejections(e.category());
                warn!(error = %e, category = e.category(), "Change stream open rejected");
                Err(e)
            }
        }
    }

    fn assemble(
        ns: &Namespace,
        options: &ChangeStreamOptions,
        ctx: &StreamContext,
        catalog: &dyn CollectionCatalog,
    ) -> Result<Self> {
        let scope = legality::validate(ns, options, ctx.fcv)?;
        let position = resume::resolve(options, &scope, ctx.role, ctx.fcv, catalog)?;

        let mut stages = Vec::with_capacity(5);
        if ctx.role.is_router() {
            stages.push(Stage::MergePresorted);
        } else {
            let StartPosition { ts, inclusive } = position.start.ok_or_else(|| {
                ChangeStreamError::Configuration(format!(
                    "no start position resolved for a stream on a {}",
                    ctx.role
                ))
            })?;
            let filter = FilterSpec::synthesize(&scope, ts, inclusive, ctx.explicit_collation);
            stages.push(Stage::OplogMatch(filter));
            stages.push(Stage::Transform);
        }

        match &position.check {
            Some(ResumeCheck::EnsureTokenPresent(token)) => {
                stages.push(Stage::EnsureResumeTokenPresent(token.clone()));
            }
            Some(ResumeCheck::CheckHistory(ts)) => stages.push(Stage::CheckResumability(*ts)),
            None => {}
        }

        if !ctx.role.needs_merge() {
            stages.push(Stage::CloseCursor);
            if options.full_document == FullDocument::UpdateLookup {
                stages.push(Stage::LookupPostImage);
            }
        }

        Ok(Self {
            namespace: ns.clone(),
            scope,
            options: options.clone(),
            role: ctx.role,
            fcv: ctx.fcv,
            position,
            stages,
        })
    }

    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    #[must_use]
    pub fn options(&self) -> &ChangeStreamOptions {
        &self.options
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Resolved start, `None` on a router opened without a position.
    #[must_use]
    pub fn start(&self) -> Option<StartPosition> {
        self.position.start
    }

    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(Stage::name).collect()
    }

    /// The log predicate, absent on a router.
    #[must_use]
    pub fn filter(&self) -> Option<&FilterSpec> {
        self.stages.iter().find_map(|stage| match stage {
            Stage::OplogMatch(filter) => Some(filter),
            _ => None,
        })
    }

    #[must_use]
    pub fn has_stage(&self, name: &str) -> bool {
        self.stages.iter().any(|stage| stage.name() == name)
    }

    #[must_use]
    pub fn fcv(&self) -> FeatureCompatibilityVersion {
        self.fcv
    }

    /// Options the router forwards to each shard.
    ///
    /// When the client gave no position, every shard starts at the router's
    /// current cluster time so that all of them agree on the start. Below
    /// version 4.0 that time travels as `$_resumeAfterClusterTime`, the only
    /// time-based option those shards accept. On any other role the options
    /// are returned unchanged.
    #[must_use]
    pub fn shard_options(&self) -> ChangeStreamOptions {
        let mut options = self.options.clone();
        if let Role::Router { cluster_time } = self.role {
            if options.has_no_position() {
                if self.fcv >= FeatureCompatibilityVersion::START_AT_CLUSTER_TIME {
                    options.start_at_cluster_time = Some(cluster_time);
                } else {
                    options.resume_after_cluster_time = Some(cluster_time);
                }
            }
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::CatalogSnapshot;
    use bson::Uuid;
    use FeatureCompatibilityVersion::{V3_6, V4_0};

    fn ts(time: u32) -> Timestamp {
        Timestamp { time, increment: 0 }
    }

    fn member() -> StreamContext {
        StreamContext::new(Role::ReplicaSetMember { last_applied: ts(100) }, V4_0)
    }

    fn shard() -> StreamContext {
        StreamContext::new(Role::Shard { last_applied: ts(100) }, V4_0)
    }

    fn router() -> StreamContext {
        StreamContext::new(Role::Router { cluster_time: ts(200) }, V4_0)
    }

    fn orders() -> Namespace {
        Namespace::new("shop", "orders")
    }

    #[test]
    fn test_replica_set_member_default_plan() {
        let plan =
            ChangeStreamPlan::open(&orders(), &ChangeStreamOptions::default(), &member(), &CatalogSnapshot::new())
                .unwrap();

        assert_eq!(plan.stage_names(), vec!["oplogMatch", "transform", "closeCursor"]);
        assert_eq!(plan.start(), Some(StartPosition { ts: ts(100), inclusive: false }));
        let filter = plan.filter().unwrap();
        assert_eq!(filter.start(), ts(100));
        assert!(!filter.is_inclusive());
    }

    #[test]
    fn test_resume_from_token_on_member() {
        let uuid = Uuid::new();
        let catalog = CatalogSnapshot::new().with_collection(uuid, orders());
        let token = ResumeToken::new(ts(50), Some(uuid), None);
        let options = ChangeStreamOptions::builder()
            .resume_after(token.clone())
            .full_document(FullDocument::UpdateLookup)
            .build();

        let plan = ChangeStreamPlan::open(&orders(), &options, &member(), &catalog).unwrap();
        assert_eq!(
            plan.stages()[2..],
            [
                Stage::EnsureResumeTokenPresent(token),
                Stage::CloseCursor,
                Stage::LookupPostImage,
            ]
        );
        assert!(plan.filter().unwrap().is_inclusive());
    }

    #[test]
    fn test_shard_plan_has_no_close_cursor() {
        let options = ChangeStreamOptions::builder()
            .start_at_cluster_time(ts(10))
            .full_document(FullDocument::UpdateLookup)
            .build();
        let plan =
            ChangeStreamPlan::open(&orders(), &options, &shard(), &CatalogSnapshot::new()).unwrap();

        assert_eq!(
            plan.stage_names(),
            vec!["oplogMatch", "transform", "checkResumability"]
        );
        assert!(!plan.has_stage("closeCursor"));
        assert!(!plan.has_stage("lookupPostImage"));
    }

    #[test]
    fn test_router_plan() {
        let plan = ChangeStreamPlan::open(
            &Namespace::database("admin"),
            &ChangeStreamOptions::builder().all_changes_for_cluster(true).build(),
            &router(),
            &CatalogSnapshot::new(),
        )
        .unwrap();

        assert_eq!(plan.stage_names(), vec!["mergePresorted", "closeCursor"]);
        assert!(plan.filter().is_none());
        assert!(plan.start().is_none());
        assert!(plan.scope().is_cluster());
    }

    #[test]
    fn test_router_forwards_cluster_time() {
        let plan = ChangeStreamPlan::open(
            &orders(),
            &ChangeStreamOptions::default(),
            &router(),
            &CatalogSnapshot::new(),
        )
        .unwrap();
        assert_eq!(plan.shard_options().start_at_cluster_time, Some(ts(200)));

        let options = ChangeStreamOptions::builder().start_at_cluster_time(ts(5)).build();
        let plan = ChangeStreamPlan::open(&orders(), &options, &router(), &CatalogSnapshot::new())
            .unwrap();
        assert_eq!(plan.shard_options(), options);
    }

    #[test]
    fn test_router_forwards_legacy_cluster_time_below_4_0() {
        let ctx = StreamContext::new(Role::Router { cluster_time: ts(200) }, V3_6);
        let plan = ChangeStreamPlan::open(
            &orders(),
            &ChangeStreamOptions::default(),
            &ctx,
            &CatalogSnapshot::new(),
        )
        .unwrap();
        assert_eq!(plan.fcv(), V3_6);

        let forwarded = plan.shard_options();
        assert_eq!(forwarded.start_at_cluster_time, None);
        assert_eq!(forwarded.resume_after_cluster_time, Some(ts(200)));

        let shard = StreamContext::new(Role::Shard { last_applied: ts(300) }, V3_6);
        let shard_plan =
            ChangeStreamPlan::open(&orders(), &forwarded, &shard, &CatalogSnapshot::new()).unwrap();
        assert_eq!(shard_plan.stage_names(), vec!["oplogMatch", "transform"]);
        assert_eq!(shard_plan.start(), Some(StartPosition { ts: ts(200), inclusive: false }));
    }

    #[test]
    fn test_rejected_open() {
        let err = ChangeStreamPlan::open(
            &Namespace::database("shop"),
            &ChangeStreamOptions::default(),
            &StreamContext::new(Role::ReplicaSetMember { last_applied: ts(1) }, V3_6),
            &CatalogSnapshot::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ChangeStreamError::FeatureNotAllowedAtVersion { .. }));

        let err = ChangeStreamPlan::open(
            &orders(),
            &ChangeStreamOptions::default(),
            &StreamContext::new(Role::Standalone, V4_0),
            &CatalogSnapshot::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ChangeStreamError::ReplicaSetRequired));
    }

    #[test]
    fn test_explicit_collation_drops_create_invalidation() {
        let with = ChangeStreamPlan::open(
            &orders(),
            &ChangeStreamOptions::default(),
            &member().with_explicit_collation(),
            &CatalogSnapshot::new(),
        )
        .unwrap();
        let without =
            ChangeStreamPlan::open(&orders(), &ChangeStreamOptions::default(), &member(), &CatalogSnapshot::new())
                .unwrap();

        assert_eq!(
            without.filter().unwrap().invalidating_commands().len(),
            with.filter().unwrap().invalidating_commands().len() + 1
        );
    }
}
