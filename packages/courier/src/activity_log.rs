//! Append-only record of completed activities, consumed LIFO on compensation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{Address, ExecutionId};

/// One completed activity.
///
/// Immutable once appended. `data` is the compensation log the activity
/// returned; the engine stores and replays it verbatim and never looks inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub execution_id: ExecutionId,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    /// Execute address of the host that ran the activity.
    pub host: Address,
    /// Where to send the slip to undo this activity. `None` for activities
    /// that cannot be compensated.
    pub compensate_address: Option<Address>,
    #[serde(default)]
    pub data: Value,
}

impl ActivityLogEntry {
    pub fn is_compensable(&self) -> bool {
        self.compensate_address.is_some()
    }
}

/// Stack of completed activities, most recent last.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityLog(Vec<ActivityLogEntry>);

impl ActivityLog {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub(crate) fn push(&mut self, entry: ActivityLogEntry) {
        self.0.push(entry);
    }

    /// Take the most recently completed entry.
    pub(crate) fn pop(&mut self) -> Option<ActivityLogEntry> {
        self.0.pop()
    }

    /// Drop entries at the top of the stack that have nothing to undo.
    ///
    /// Returns the dropped entries, most recent first.
    pub(crate) fn discard_uncompensable(&mut self) -> Vec<ActivityLogEntry> {
        let mut discarded = Vec::new();
        while self.0.last().is_some_and(|entry| !entry.is_compensable()) {
            if let Some(entry) = self.0.pop() {
                discarded.push(entry);
            }
        }
        discarded
    }

    /// The entry compensation would visit next.
    pub fn peek(&self) -> Option<&ActivityLogEntry> {
        self.0.last()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries in completion order.
    pub fn iter(&self) -> impl Iterator<Item = &ActivityLogEntry> {
        self.0.iter()
    }
}
