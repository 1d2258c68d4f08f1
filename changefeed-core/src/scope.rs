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

//! Change stream scopes and their namespace patterns.
//!
//! A stream watches one of three scopes:
//!
//! | Scope | Opened on | Matches |
//! |-------|-----------|---------|
//! | [`Scope::SingleCollection`] | `db.coll` | exactly `db.coll` |
//! | [`Scope::SingleDatabase`] | `db` | every user collection of `db` |
//! | [`Scope::WholeCluster`] | `admin`, with `allChangesForCluster` | every user collection outside `admin`, `config`, `local` |
//!
//! "User collection" excludes the command namespace (`db.$cmd`) and
//! `system.*` collections.
//!
//! ```rust
//! use changefeed_core::scope::{Namespace, Scope};
//!
//! let scope = Scope::resolve(&Namespace::database("shop"), false);
//! assert!(scope.is_database());
//!
//! let pattern = scope.pattern();
//! assert!(pattern.matches("shop.orders"));
//! assert!(!pattern.matches("shop.system.views"));
//! assert_eq!(pattern.regex(), r"^shop\.(?!(\$|system\.))");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// The administrative database; the only legal target of a cluster-wide stream.
pub const ADMIN_DB: &str = "admin";

/// Internal databases excluded from cluster-wide matching.
pub const INTERNAL_DBS: [&str; 3] = ["admin", "config", "local"];

/// Anchored fragment matching any database name other than the internal ones.
const REGEX_ALL_DBS: &str = r"(?!(admin|config|local)\.)[^.]+";

/// Fragment matching a collection that is neither a command nor a system collection.
const REGEX_ALL_COLLECTIONS: &str = r"\.(?!(\$|system\.))";

/// Fragment matching the command pseudo-collection.
const REGEX_CMD_COLL: &str = r"\.\$cmd$";

/// Database + optional collection.
///
/// With no collection this names a whole database; oplog command entries
/// live in its `$cmd` pseudo-collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name
    #[serde(rename = "db")]
    pub db: String,

    /// Collection name, absent for database-level namespaces
    #[serde(rename = "coll", skip_serializing_if = "Option::is_none")]
    pub coll: Option<String>,
}

impl Namespace {
    /// Creates a collection namespace.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: Some(coll.into()),
        }
    }

    /// Creates a database-level namespace with no collection selected.
    pub fn database(db: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: None,
        }
    }

    /// Parses `"db"` or `"db.coll"`; the collection part may itself contain dots.
    #[must_use]
    pub fn parse(ns: &str) -> Self {
        match ns.split_once('.') {
            Some((db, coll)) => Self::new(db, coll),
            None => Self::database(ns),
        }
    }

    /// Returns `db.coll`, or just `db` when no collection is selected.
    #[must_use]
    pub fn full_name(&self) -> String {
        match &self.coll {
            Some(coll) => format!("{}.{}", self.db, coll),
            None => self.db.clone(),
        }
    }

    /// Returns the namespace under which commands on this database are logged.
    #[must_use]
    pub fn command_ns(&self) -> String {
        format!("{}.$cmd", self.db)
    }

    /// Returns true when no collection is selected.
    #[inline]
    #[must_use]
    pub fn is_collectionless(&self) -> bool {
        self.coll.is_none()
    }

    #[inline]
    #[must_use]
    pub fn is_admin_db(&self) -> bool {
        self.db == ADMIN_DB
    }

    #[inline]
    #[must_use]
    pub fn is_local_db(&self) -> bool {
        self.db == "local"
    }

    #[inline]
    #[must_use]
    pub fn is_config_db(&self) -> bool {
        self.db == "config"
    }

    /// Returns true for `system.*` collections.
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.coll
            .as_deref()
            .is_some_and(|coll| coll.starts_with("system."))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

/// The logical target of a change stream.
///
/// Derived once per stream and immutable for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// One collection.
    SingleCollection(Namespace),

    /// Every user collection of one database.
    SingleDatabase(String),

    /// Every user collection of every non-internal database.
    WholeCluster,
}

impl Scope {
    /// Classifies a stream target.
    ///
    /// Total: every namespace maps to exactly one scope. A collection always
    /// yields [`Scope::SingleCollection`]; a collectionless namespace yields
    /// [`Scope::WholeCluster`] when it is the admin database or the cluster
    /// flag is set, and [`Scope::SingleDatabase`] otherwise. Inconsistent
    /// combinations (flag plus collection, flag on a non-admin database) are
    /// rejected by [`crate::legality::validate`], not here.
    #[must_use]
    pub fn resolve(ns: &Namespace, all_changes_for_cluster: bool) -> Self {
        match &ns.coll {
            Some(_) => Self::SingleCollection(ns.clone()),
            None if all_changes_for_cluster || ns.is_admin_db() => Self::WholeCluster,
            None => Self::SingleDatabase(ns.db.clone()),
        }
    }

    #[must_use]
    pub fn is_collection(&self) -> bool {
        matches!(self, Self::SingleCollection(_))
    }

    #[must_use]
    pub fn is_database(&self) -> bool {
        matches!(self, Self::SingleDatabase(_))
    }

    #[must_use]
    pub fn is_cluster(&self) -> bool {
        matches!(self, Self::WholeCluster)
    }

    /// Returns the namespace-matching pattern for this scope.
    #[must_use]
    pub fn pattern(&self) -> NamespacePattern {
        match self {
            Self::SingleCollection(ns) => NamespacePattern::Exact(ns.full_name()),
            Self::SingleDatabase(db) => NamespacePattern::Database(db.clone()),
            Self::WholeCluster => NamespacePattern::AllUserDatabases,
        }
    }

    /// Returns a short label suitable for logs and metric labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SingleCollection(_) => "collection",
            Self::SingleDatabase(_) => "database",
            Self::WholeCluster => "cluster",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleCollection(ns) => write!(f, "SingleCollection({ns})"),
            Self::SingleDatabase(db) => write!(f, "SingleDatabase({db})"),
            Self::WholeCluster => write!(f, "WholeCluster"),
        }
    }
}

/// Anchored namespace pattern.
///
/// [`NamespacePattern::regex`] renders the PCRE form sent to the log
/// storage; [`NamespacePattern::matches`] evaluates the same language in
/// process (the PCRE form relies on lookahead, which the `regex` crate does
/// not support, so matching is done structurally).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NamespacePattern {
    /// `^ns$`
    Exact(String),

    /// `^db\.` not followed by `$` or `system.`
    Database(String),

    /// Any database other than `admin`, `config`, `local`, then as [`NamespacePattern::Database`].
    AllUserDatabases,
}

impl NamespacePattern {
    /// Returns true if `ns` matches this pattern.
    #[must_use]
    pub fn matches(&self, ns: &str) -> bool {
        match self {
            Self::Exact(expected) => ns == expected,
            Self::Database(db) => ns
                .strip_prefix(db.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
                .is_some_and(is_user_collection),
            Self::AllUserDatabases => match ns.split_once('.') {
                Some((db, coll)) => is_user_database(db) && is_user_collection(coll),
                None => false,
            },
        }
    }

    /// Returns the anchored regular expression for this pattern.
    #[must_use]
    pub fn regex(&self) -> String {
        match self {
            Self::Exact(ns) => format!("^{}$", regex::escape(ns)),
            Self::Database(db) => format!("^{}{REGEX_ALL_COLLECTIONS}", regex::escape(db)),
            Self::AllUserDatabases => format!("^{REGEX_ALL_DBS}{REGEX_ALL_COLLECTIONS}"),
        }
    }
}

/// Regex matching the command namespace of every non-internal database.
#[must_use]
pub fn all_user_command_ns_regex() -> String {
    format!("^{REGEX_ALL_DBS}{REGEX_CMD_COLL}")
}

/// Returns true if `ns` is the command namespace of a non-internal database.
#[must_use]
pub fn is_user_command_ns(ns: &str) -> bool {
    ns.strip_suffix(".$cmd")
        .is_some_and(|db| is_user_database(db) && !db.contains('.'))
}

/// `[^.]+` that is not one of the internal databases.
fn is_user_database(db: &str) -> bool {
    !db.is_empty() && !db.contains('.') && !INTERNAL_DBS.contains(&db)
}

/// Collection suffix that is not `$...` or `system....`.
fn is_user_collection(coll: &str) -> bool {
    !coll.starts_with('$') && !coll.starts_with("system.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_parse() {
        let ns = Namespace::parse("db.coll.with.dots");
        assert_eq!(ns.db, "db");
        assert_eq!(ns.coll.as_deref(), Some("coll.with.dots"));
        assert_eq!(ns.full_name(), "db.coll.with.dots");

        let ns = Namespace::parse("db");
        assert!(ns.is_collectionless());
        assert_eq!(ns.command_ns(), "db.$cmd");
    }

    #[test]
    fn test_system_collections() {
        assert!(Namespace::new("db", "system.views").is_system());
        assert!(!Namespace::new("db", "systemic").is_system());
        assert!(!Namespace::database("db").is_system());
    }

    #[test]
    fn test_resolve_is_total() {
        assert_eq!(
            Scope::resolve(&Namespace::new("db", "coll"), false),
            Scope::SingleCollection(Namespace::new("db", "coll"))
        );
        assert_eq!(
            Scope::resolve(&Namespace::database("db"), false),
            Scope::SingleDatabase("db".to_string())
        );
        assert_eq!(
            Scope::resolve(&Namespace::database("admin"), true),
            Scope::WholeCluster
        );
        // Flag with a collection is left to the legality check.
        assert!(Scope::resolve(&Namespace::new("admin", "x"), true).is_collection());
    }

    #[test]
    fn test_collection_pattern() {
        let pattern = Scope::SingleCollection(Namespace::new("db", "coll")).pattern();
        assert!(pattern.matches("db.coll"));
        assert!(!pattern.matches("db.coll2"));
        assert!(!pattern.matches("db.col"));
        assert_eq!(pattern.regex(), r"^db\.coll$");
    }

    #[test]
    fn test_database_pattern() {
        let pattern = Scope::SingleDatabase("db".into()).pattern();
        assert!(pattern.matches("db.foo"));
        assert!(pattern.matches("db.foo.bar"));
        assert!(!pattern.matches("db.system.x"));
        assert!(!pattern.matches("db.$cmd"));
        assert!(!pattern.matches("db$cmd"));
        assert!(!pattern.matches("dbx.foo"));
        assert!(!pattern.matches("other.foo"));
    }

    #[test]
    fn test_cluster_pattern() {
        let pattern = Scope::WholeCluster.pattern();
        assert!(pattern.matches("db.foo"));
        assert!(pattern.matches("adminish.foo"));
        for ns in ["admin.foo", "config.chunks", "local.oplog.rs", "db.system.js", "db.$cmd"] {
            assert!(!pattern.matches(ns), "{ns} should not match");
        }
        assert_eq!(
            pattern.regex(),
            r"^(?!(admin|config|local)\.)[^.]+\.(?!(\$|system\.))"
        );
    }

    #[test]
    fn test_user_command_ns() {
        assert!(is_user_command_ns("shop.$cmd"));
        assert!(!is_user_command_ns("admin.$cmd"));
        assert!(!is_user_command_ns("local.$cmd"));
        assert!(!is_user_command_ns("shop.orders"));
        assert_eq!(
            all_user_command_ns_regex(),
            r"^(?!(admin|config|local)\.)[^.]+\.\$cmd$"
        );
    }

    #[test]
    fn test_regex_escapes_names() {
        let pattern = NamespacePattern::Database("a+b".into());
        assert_eq!(pattern.regex(), r"^a\+b\.(?!(\$|system\.))");
    }

    #[test]
    fn test_scope_display() {
        assert_eq!(
            Scope::SingleCollection(Namespace::new("db", "c")).to_string(),
            "SingleCollection(db.c)"
        );
        assert_eq!(Scope::WholeCluster.kind(), "cluster");
    }
}
