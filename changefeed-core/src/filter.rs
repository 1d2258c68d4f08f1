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

//! Oplog filter synthesis.
//!
//! Translates a [`Scope`] and start position into a predicate over raw log
//! entries. The predicate must never reject an entry that is relevant to the
//! scope; it may accept irrelevant ones, which the transform step discards.
//!
//! The predicate is
//!
//! ```text
//! ts >= start (or > start when exclusive)
//! AND fromMigrate != true
//! AND ( invalidating command
//!     OR namespace-matched operation
//!     OR transaction batch touching the scope )
//! ```
//!
//! where each family is an independent branch of the disjunction:
//!
//! - **Invalidating commands**: `op: "c"` on the scope's command namespace
//!   with `dropDatabase`, `drop`, `renameCollection` or (single collection,
//!   default collation only) `create` carrying a collation; plus any rename
//!   whose target (`o.to`) lands in the scope.
//! - **Namespace-matched operations**: `ns` matches the scope's pattern and
//!   the entry is not a no-op, unless it is a chunk-migration marker.
//! - **Transaction batches**: `applyOps` commands carrying `lsid` and
//!   `txnNumber` with at least one sub-operation whose `ns` matches.
//!
//! A [`FilterSpec`] can be evaluated in process with [`FilterSpec::matches`]
//! or rendered for push-down to a server with [`FilterSpec::to_document`].

use crate::oplog::{OpType, OplogEntry, MIGRATE_CHUNK_TO_NEW_SHARD};
use crate::resume_token::cmp_timestamps;
use crate::scope::{all_user_command_ns_regex, is_user_command_ns, NamespacePattern, Scope};
use bson::{doc, Bson, Document, Regex, Timestamp};
use std::cmp::Ordering;

/// A command that ends a stream's validity for its scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidatingCommand {
    /// `{dropDatabase: 1}`
    DropDatabase,

    /// `{drop: <coll>}`; `None` matches any collection
    Drop(Option<String>),

    /// `{renameCollection: <db.coll>}` naming the source; `None` matches any source
    RenameFrom(Option<String>),

    /// `{create: <coll>, collation: ...}`
    CreateWithCollation(String),
}

impl InvalidatingCommand {
    /// Returns true if the command payload `o` is this command.
    #[must_use]
    pub fn matches(&self, o: &Document) -> bool {
        match self {
            Self::DropDatabase => o.contains_key("dropDatabase"),
            Self::Drop(None) => o.contains_key("drop"),
            Self::Drop(Some(coll)) => o.get_str("drop").is_ok_and(|c| c == coll),
            Self::RenameFrom(None) => o.contains_key("renameCollection"),
            Self::RenameFrom(Some(ns)) => o.get_str("renameCollection").is_ok_and(|s| s == ns),
            Self::CreateWithCollation(coll) => {
                o.get_str("create").is_ok_and(|c| c == coll) && o.contains_key("collation")
            }
        }
    }

    fn to_document(&self) -> Document {
        match self {
            Self::DropDatabase => doc! { "o.dropDatabase": 1 },
            Self::Drop(None) => doc! { "o.drop": { "$exists": true } },
            Self::Drop(Some(coll)) => doc! { "o.drop": coll.as_str() },
            Self::RenameFrom(None) => doc! { "o.renameCollection": { "$exists": true } },
            Self::RenameFrom(Some(ns)) => doc! { "o.renameCollection": ns.as_str() },
            Self::CreateWithCollation(coll) => {
                doc! { "o.create": coll.as_str(), "o.collation": { "$exists": true } }
            }
        }
    }
}

/// Where command entries for the scope are logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandNamespace {
    /// `db.$cmd` of one database
    Exact(String),

    /// `$cmd` of every non-internal database
    AllUserDatabases,
}

impl CommandNamespace {
    #[must_use]
    pub fn matches(&self, ns: &str) -> bool {
        match self {
            Self::Exact(expected) => ns == expected,
            Self::AllUserDatabases => is_user_command_ns(ns),
        }
    }

    fn to_bson(&self) -> Bson {
        match self {
            Self::Exact(ns) => Bson::String(ns.clone()),
            Self::AllUserDatabases => regex(all_user_command_ns_regex()),
        }
    }
}

/// Which rename targets (`o.to`) invalidate the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenameTarget {
    /// Exactly this namespace
    Exact(String),

    /// Any namespace matching the pattern
    Pattern(NamespacePattern),

    /// Any rename at all
    Exists,
}

impl RenameTarget {
    #[must_use]
    pub fn matches(&self, o: &Document) -> bool {
        match self {
            Self::Exact(ns) => o.get_str("to").is_ok_and(|to| to == ns),
            Self::Pattern(pattern) => o.get_str("to").is_ok_and(|to| pattern.matches(to)),
            Self::Exists => o.contains_key("to"),
        }
    }

    fn to_bson(&self) -> Bson {
        match self {
            Self::Exact(ns) => Bson::String(ns.clone()),
            Self::Pattern(pattern) => regex(pattern.regex()),
            Self::Exists => Bson::Document(doc! { "$exists": true }),
        }
    }
}

/// The synthesized log predicate.
///
/// A pure function of `(scope, start, inclusive, explicit_collation)`;
/// immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSpec {
    scope: Scope,
    start: Timestamp,
    inclusive: bool,
    pattern: NamespacePattern,
    command_ns: CommandNamespace,
    invalidating: Vec<InvalidatingCommand>,
    rename_target: RenameTarget,
}

impl FilterSpec {
    /// Builds the predicate for `scope` starting at `start`.
    ///
    /// `explicit_collation` is true when the stream was opened with a
    /// collation of its own; a later `create` with a collation then does not
    /// change the stream's semantics and is not treated as invalidating.
    #[must_use]
    pub fn synthesize(
        scope: &Scope,
        start: Timestamp,
        inclusive: bool,
        explicit_collation: bool,
    ) -> Self {
        let pattern = scope.pattern();
        let (command_ns, invalidating, rename_target) = match scope {
            Scope::SingleCollection(ns) => {
                let coll = ns.coll.clone().unwrap_or_default();
                let mut commands = vec![
                    InvalidatingCommand::DropDatabase,
                    InvalidatingCommand::Drop(Some(coll.clone())),
                    InvalidatingCommand::RenameFrom(Some(ns.full_name())),
                ];
                if !explicit_collation {
                    commands.push(InvalidatingCommand::CreateWithCollation(coll));
                }
                (
                    CommandNamespace::Exact(ns.command_ns()),
                    commands,
                    RenameTarget::Exact(ns.full_name()),
                )
            }
            Scope::SingleDatabase(db) => (
                CommandNamespace::Exact(format!("{db}.$cmd")),
                vec![
                    InvalidatingCommand::DropDatabase,
                    InvalidatingCommand::Drop(None),
                    InvalidatingCommand::RenameFrom(None),
                ],
                RenameTarget::Pattern(pattern.clone()),
            ),
            Scope::WholeCluster => (
                CommandNamespace::AllUserDatabases,
                vec![
                    InvalidatingCommand::DropDatabase,
                    InvalidatingCommand::Drop(None),
                    InvalidatingCommand::RenameFrom(None),
                ],
                RenameTarget::Exists,
            ),
        };

        Self {
            scope: scope.clone(),
            start,
            inclusive,
            pattern,
            command_ns,
            invalidating,
            rename_target,
        }
    }

    /// Returns the same predicate restarted just after `ts`.
    ///
    /// Used by readers that must reissue their query after having already
    /// delivered entries up to `ts`.
    #[must_use]
    pub fn resumed_after(&self, ts: Timestamp) -> Self {
        Self {
            start: ts,
            inclusive: false,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    #[must_use]
    pub fn start(&self) -> Timestamp {
        self.start
    }

    #[must_use]
    pub fn is_inclusive(&self) -> bool {
        self.inclusive
    }

    #[must_use]
    pub fn pattern(&self) -> &NamespacePattern {
        &self.pattern
    }

    #[must_use]
    pub fn invalidating_commands(&self) -> &[InvalidatingCommand] {
        &self.invalidating
    }

    /// Returns true if `entry` satisfies the predicate.
    #[must_use]
    pub fn matches(&self, entry: &OplogEntry) -> bool {
        self.after_start(entry.ts)
            && !entry.from_migrate
            && (self.matches_invalidating_command(entry)
                || self.matches_namespace(entry)
                || self.matches_transaction(entry))
    }

    /// Returns true if `ts` is inside the filter's time window.
    #[must_use]
    pub fn after_start(&self, ts: Timestamp) -> bool {
        match cmp_timestamps(ts, self.start) {
            Ordering::Greater => true,
            Ordering::Equal => self.inclusive,
            Ordering::Less => false,
        }
    }

    /// Invalidating-command family, including rename targets.
    #[must_use]
    pub fn matches_invalidating_command(&self, entry: &OplogEntry) -> bool {
        if entry.op != OpType::Command {
            return false;
        }
        let on_command_ns = self.command_ns.matches(&entry.ns)
            && self.invalidating.iter().any(|cmd| cmd.matches(&entry.o));
        on_command_ns || self.rename_target.matches(&entry.o)
    }

    /// Namespace-matched family, including chunk-migration markers.
    #[must_use]
    pub fn matches_namespace(&self, entry: &OplogEntry) -> bool {
        self.pattern.matches(&entry.ns)
            && (entry.op != OpType::Noop || entry.is_chunk_migration_marker())
    }

    /// Transaction-batch family.
    #[must_use]
    pub fn matches_transaction(&self, entry: &OplogEntry) -> bool {
        entry.is_transaction_batch()
            && entry
                .apply_ops()
                .any(|op| op.get_str("ns").is_ok_and(|ns| self.pattern.matches(ns)))
    }

    /// Renders the predicate as a query document for the log storage.
    #[must_use]
    pub fn to_document(&self) -> Document {
        let ts_op = if self.inclusive { "$gte" } else { "$gt" };
        let pattern = regex(self.pattern.regex());

        let op_match = doc! {
            "ns": pattern.clone(),
            "$or": [
                { "op": { "$ne": OpType::Noop.as_code() } },
                { "op": OpType::Noop.as_code(), "o2.type": MIGRATE_CHUNK_TO_NEW_SHARD },
            ],
        };

        let invalidating: Vec<Bson> = self
            .invalidating
            .iter()
            .map(|cmd| Bson::Document(cmd.to_document()))
            .collect();
        let command_match = doc! {
            "op": OpType::Command.as_code(),
            "$or": [
                { "ns": self.command_ns.to_bson(), "$or": invalidating },
                { "o.to": self.rename_target.to_bson() },
            ],
        };

        let apply_ops_match = doc! {
            "op": OpType::Command.as_code(),
            "lsid": { "$exists": true },
            "txnNumber": { "$exists": true },
            "o.applyOps.ns": pattern,
        };

        doc! {
            "$and": [
                { "ts": { ts_op: self.start } },
                { "$or": [op_match, command_match, apply_ops_match] },
                { "fromMigrate": { "$ne": true } },
            ]
        }
    }
}

fn regex(pattern: String) -> Bson {
    Bson::RegularExpression(Regex {
        pattern,
        options: String::new(),
    })
}
