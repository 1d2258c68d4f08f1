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

//! Invalidation state machine.
//!
//! ```text
//!        invalidate event delivered        next pull
//! Open ─────────────────────────────▶ Invalidated ─────────▶ Closed
//! ```
//!
//! The invalidate event itself is delivered; termination is reported on the
//! pull after it. Exactly one instance runs per logical stream: on an
//! unsharded stream, or at the merge point of a sharded one, never on the
//! shard streams feeding a merge.

use crate::event::ChangeEvent;
use crate::metrics;
use std::fmt;
use tracing::{debug, info};

/// Lifecycle of a logical stream. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamState {
    Open,
    Invalidated,
    Closed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Invalidated => "invalidated",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// What a pull may do, decided before any data is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Fetch and deliver the next event.
    Proceed,

    /// Report the terminal signal; the stream is now closed.
    Terminate,

    /// The terminal signal was already reported; nothing more to deliver.
    Closed,
}

/// The close-cursor stage.
#[derive(Debug)]
pub struct CloseCursor {
    state: StreamState,
    scope_kind: &'static str,
}

impl CloseCursor {
    /// Creates an open instance; `scope_kind` labels metrics.
    #[must_use]
    pub fn new(scope_kind: &'static str) -> Self {
        Self {
            state: StreamState::Open,
            scope_kind,
        }
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Called at the start of every pull.
    pub fn gate(&mut self) -> Gate {
        match self.state {
            StreamState::Open => Gate::Proceed,
            StreamState::Invalidated => {
                self.state = StreamState::Closed;
                debug!(scope = self.scope_kind, "Change stream closed after invalidation");
                Gate::Terminate
            }
            StreamState::Closed => Gate::Closed,
        }
    }

    /// Called for every event about to be delivered.
    pub fn observe(&mut self, event: &ChangeEvent) {
        if self.state == StreamState::Open && event.is_invalidate() {
            self.state = StreamState::Invalidated;
            metrics::increment_streams_invalidated(self.scope_kind);
            info!(
                scope = self.scope_kind,
                token = %event.id,
                "Change stream invalidated; delivering final event"
            );
        }
    }
}
