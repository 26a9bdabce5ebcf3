//! Change and subscription event types shared by the backends.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Accumulated set of changed file paths since the last drain.
///
/// Uniqueness is enforced by the set; ordering carries no meaning.
pub type ChangeSet = HashSet<PathBuf>;

/// Bookkeeping accumulated alongside the change set between drains.
///
/// Reset to the zero value on every drain, unconditionally — even when the
/// drained change set happened to be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherMetadata {
    /// Sum of the reported distances of every working-copy update since the
    /// last drain.
    pub total_update_distance: u64,
    /// Whether the tracked mergebase moved since the last drain.
    pub changed_mergebase: bool,
}

impl WatcherMetadata {
    /// Fold another metadata record into this one.
    pub fn merge(&mut self, other: &WatcherMetadata) {
        self.total_update_distance += other.total_update_distance;
        self.changed_mergebase = self.changed_mergebase || other.changed_mergebase;
    }
}

/// One event delivered by the change-subscription transport.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// A batch of changed paths.
    FilesChanged(ChangeSet),
    /// A named transaction scope opened, with an optional opaque payload.
    StateEnter {
        name: String,
        payload: Option<serde_json::Value>,
    },
    /// A named transaction scope closed, with an optional opaque payload.
    StateLeave {
        name: String,
        payload: Option<serde_json::Value>,
    },
    /// The transport has no live connection right now; it reconnects on its
    /// own and will resume delivering events.
    Unavailable,
    /// Catch-all for event kinds our subscription settings should never
    /// produce. Treated as an invariant violation by the listen loop.
    Other(String),
}

/// The two fields we read out of a transaction-scope payload.
///
/// Everything else in the payload is deliberately left uninterpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopePayload {
    /// How far the working copy moved, in the source-control tool's units.
    pub distance: u64,
    /// The revision the working copy landed on, for log attribution.
    pub revision: Option<String>,
}

impl ScopePayload {
    /// Extract the named fields from an optional payload value. Missing or
    /// mistyped fields fall back to the zero value rather than failing; the
    /// payload schema is not ours to validate.
    pub fn from_value(value: Option<&serde_json::Value>) -> Self {
        let Some(value) = value else {
            return Self::default();
        };
        Self {
            distance: value.get("distance").and_then(|d| d.as_u64()).unwrap_or(0),
            revision: value
                .get("revision")
                .and_then(|r| r.as_str())
                .map(str::to_owned),
        }
    }
}
