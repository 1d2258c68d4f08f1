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

//! Stream-open legality checks.
//!
//! Runs before resume resolution and filter synthesis. Checks are applied
//! in a fixed order, so a request that is wrong in several ways always
//! reports the same error:
//!
//! 1. namespace rules (cluster flag, internal databases, system collections)
//! 2. conflicting position options
//! 3. feature compatibility version gates

use crate::error::{ChangeStreamError, Result};
use crate::options::ChangeStreamOptions;
use crate::scope::{Namespace, Scope};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Feature compatibility version of the deployment.
///
/// Passed explicitly to every check that depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeatureCompatibilityVersion {
    /// Single-collection streams only; no `startAtClusterTime`.
    V3_6,

    /// Database and cluster streams, `startAtClusterTime`.
    V4_0,
}

impl FeatureCompatibilityVersion {
    /// Lowest version supporting database-wide and cluster-wide streams.
    pub const COLLECTIONLESS_STREAMS: Self = Self::V4_0;

    /// Lowest version supporting `startAtClusterTime`.
    pub const START_AT_CLUSTER_TIME: Self = Self::V4_0;

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::V3_6 => "3.6",
            Self::V4_0 => "4.0",
        }
    }
}

impl fmt::Display for FeatureCompatibilityVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureCompatibilityVersion {
    type Err = ChangeStreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "3.6" => Ok(Self::V3_6),
            "4.0" => Ok(Self::V4_0),
            other => Err(ChangeStreamError::Configuration(format!(
                "unknown feature compatibility version '{other}'"
            ))),
        }
    }
}

/// Validates a stream-open request and returns its scope.
///
/// # Errors
///
/// - [`ChangeStreamError::NamespaceNotAllowed`]: cluster flag on anything but
///   the collectionless admin database, the admin database without the flag,
///   the `local`/`config` databases, or a `system.*` collection.
/// - [`ChangeStreamError::ConflictingResumeOptions`]: more than one of
///   `resumeAfter`, `startAtClusterTime`, `$_resumeAfterClusterTime`.
/// - [`ChangeStreamError::FeatureNotAllowedAtVersion`]: database or cluster
///   scope, or `startAtClusterTime`, below version 4.0.
///
/// ```rust
/// use changefeed_core::legality::{validate, FeatureCompatibilityVersion};
/// use changefeed_core::options::ChangeStreamOptions;
/// use changefeed_core::scope::{Namespace, Scope};
///
/// let options = ChangeStreamOptions::builder().all_changes_for_cluster(true).build();
/// let scope = validate(&Namespace::database("admin"), &options, FeatureCompatibilityVersion::V4_0).unwrap();
/// assert_eq!(scope, Scope::WholeCluster);
///
/// assert!(validate(&Namespace::database("shop"), &options, FeatureCompatibilityVersion::V4_0).is_err());
/// ```
pub fn validate(
    ns: &Namespace,
    options: &ChangeStreamOptions,
    fcv: FeatureCompatibilityVersion,
) -> Result<Scope> {
    check_namespace(ns, options.all_changes_for_cluster)?;
    check_position_conflicts(options)?;

    if ns.is_collectionless() && fcv < FeatureCompatibilityVersion::COLLECTIONLESS_STREAMS {
        return Err(ChangeStreamError::FeatureNotAllowedAtVersion {
            feature: "$changeStream on an entire database or cluster",
            current: fcv,
            required: FeatureCompatibilityVersion::COLLECTIONLESS_STREAMS,
        });
    }

    if options.start_at_cluster_time.is_some()
        && fcv < FeatureCompatibilityVersion::START_AT_CLUSTER_TIME
    {
        return Err(ChangeStreamError::FeatureNotAllowedAtVersion {
            feature: "startAtClusterTime",
            current: fcv,
            required: FeatureCompatibilityVersion::START_AT_CLUSTER_TIME,
        });
    }

    let scope = Scope::resolve(ns, options.all_changes_for_cluster);
    debug!(namespace = %ns, scope = %scope, fcv = %fcv, "Change stream request is legal");
    Ok(scope)
}

fn check_namespace(ns: &Namespace, all_changes_for_cluster: bool) -> Result<()> {
    if all_changes_for_cluster && !(ns.is_admin_db() && ns.is_collectionless()) {
        return Err(ChangeStreamError::NamespaceNotAllowed(format!(
            "a change stream with 'allChangesForCluster: true' may only be opened on the 'admin' database with no collection name; found {ns}"
        )));
    }

    let internal_db = if ns.is_admin_db() {
        !all_changes_for_cluster
    } else {
        ns.is_local_db() || ns.is_config_db()
    };
    if internal_db {
        return Err(ChangeStreamError::NamespaceNotAllowed(format!(
            "a change stream may not be opened on the internal {} database",
            ns.db
        )));
    }

    if ns.is_system() {
        return Err(ChangeStreamError::NamespaceNotAllowed(format!(
            "a change stream may not be opened on the internal {ns} collection"
        )));
    }

    Ok(())
}

fn check_position_conflicts(options: &ChangeStreamOptions) -> Result<()> {
    let given = options.position_options();
    if given.len() > 1 {
        return Err(ChangeStreamError::ConflictingResumeOptions(given.join(", ")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resume_token::ResumeToken;
    use bson::Timestamp;
    use FeatureCompatibilityVersion::{V3_6, V4_0};

    fn ts(time: u32) -> Timestamp {
        Timestamp { time, increment: 0 }
    }

    fn defaults() -> ChangeStreamOptions {
        ChangeStreamOptions::default()
    }

    fn cluster() -> ChangeStreamOptions {
        ChangeStreamOptions::builder().all_changes_for_cluster(true).build()
    }

    #[test]
    fn test_fcv_parse_and_order() {
        assert_eq!("4.0".parse::<FeatureCompatibilityVersion>().unwrap(), V4_0);
        assert!("4.2".parse::<FeatureCompatibilityVersion>().is_err());
        assert!(V3_6 < V4_0);
        assert_eq!(V3_6.to_string(), "3.6");
    }

    #[test]
    fn test_collection_stream_allowed_at_3_6() {
        let scope = validate(&Namespace::new("db", "coll"), &defaults(), V3_6).unwrap();
        assert!(scope.is_collection());
    }

    #[test]
    fn test_cluster_flag_requires_collectionless_admin() {
        for ns in [
            Namespace::database("db"),
            Namespace::new("admin", "coll"),
            Namespace::new("db", "coll"),
        ] {
            for fcv in [V3_6, V4_0] {
                assert!(matches!(
                    validate(&ns, &cluster(), fcv),
                    Err(ChangeStreamError::NamespaceNotAllowed(_))
                ));
            }
        }
    }

    #[test]
    fn test_admin_requires_cluster_flag() {
        assert!(matches!(
            validate(&Namespace::database("admin"), &defaults(), V4_0),
            Err(ChangeStreamError::NamespaceNotAllowed(_))
        ));
    }

    #[test]
    fn test_internal_databases_rejected() {
        for ns in [
            Namespace::database("local"),
            Namespace::new("local", "oplog.rs"),
            Namespace::new("config", "chunks"),
        ] {
            assert!(matches!(
                validate(&ns, &defaults(), V4_0),
                Err(ChangeStreamError::NamespaceNotAllowed(_))
            ));
        }
    }

    #[test]
    fn test_system_collection_rejected() {
        let err = validate(&Namespace::new("db", "system.views"), &defaults(), V4_0).unwrap_err();
        assert!(matches!(err, ChangeStreamError::NamespaceNotAllowed(_)));
        assert!(err.to_string().contains("db.system.views"));
    }

    #[test]
    fn test_database_scope_gated_by_fcv() {
        assert!(matches!(
            validate(&Namespace::database("db"), &defaults(), V3_6),
            Err(ChangeStreamError::FeatureNotAllowedAtVersion { .. })
        ));
        assert!(validate(&Namespace::database("db"), &defaults(), V4_0)
            .unwrap()
            .is_database());
        assert!(matches!(
            validate(&Namespace::database("admin"), &cluster(), V3_6),
            Err(ChangeStreamError::FeatureNotAllowedAtVersion { .. })
        ));
    }

    #[test]
    fn test_start_at_gated_by_fcv() {
        let options = ChangeStreamOptions::builder().start_at_cluster_time(ts(1)).build();
        let err = validate(&Namespace::new("db", "c"), &options, V3_6).unwrap_err();
        match err {
            ChangeStreamError::FeatureNotAllowedAtVersion { feature, current, required } => {
                assert_eq!(feature, "startAtClusterTime");
                assert_eq!(current, V3_6);
                assert_eq!(required, V4_0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_conflicting_positions() {
        let token = ResumeToken::from_timestamp(ts(1));
        let options = ChangeStreamOptions::builder()
            .resume_after(token)
            .start_at_cluster_time(ts(2))
            .build();
        let err = validate(&Namespace::new("db", "c"), &options, V4_0).unwrap_err();
        assert!(matches!(err, ChangeStreamError::ConflictingResumeOptions(_)));

        let options = ChangeStreamOptions::builder()
            .start_at_cluster_time(ts(2))
            .resume_after_cluster_time(ts(1))
            .build();
        assert!(matches!(
            validate(&Namespace::new("db", "c"), &options, V4_0),
            Err(ChangeStreamError::ConflictingResumeOptions(_))
        ));
    }
}
