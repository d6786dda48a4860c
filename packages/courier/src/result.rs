//! Outcomes reported by activities.
//!
//! Activities build these through the helpers on
//! [`ExecuteContext`](crate::ExecuteContext) and
//! [`CompensateContext`](crate::CompensateContext) rather than by hand.

use serde_json::Value;

use crate::itinerary::ItineraryRevision;
use crate::variables::Variables;

/// Result of executing an activity.
#[derive(Debug)]
pub enum ExecutionResult {
    /// The activity did its work.
    Completed {
        /// Compensation data, replayed verbatim to `compensate`. `None` for
        /// activities that leave nothing to undo.
        log: Option<Value>,
        /// Variables to merge into the slip (overwrite on collision).
        variables: Variables,
        itinerary: ItineraryRevision,
    },
    /// The activity failed. The slip starts compensating.
    Faulted(anyhow::Error),
}

impl ExecutionResult {
    pub fn is_completed(&self) -> bool {
        matches!(self, ExecutionResult::Completed { .. })
    }
}

/// Result of compensating an activity.
#[derive(Debug)]
pub enum CompensationResult {
    /// The activity's effect was undone. Variables are merged into the slip.
    Compensated { variables: Variables },
    /// Undo failed. Compensation stops here.
    Failed(anyhow::Error),
}

impl CompensationResult {
    pub fn is_compensated(&self) -> bool {
        matches!(self, CompensationResult::Compensated { .. })
    }
}
