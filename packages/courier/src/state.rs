//! Per-slip lifecycle state machine.
//!
//! ```text
//! Pending ──► Executing ──► Completed
//!                 │
//!                 ▼
//!             Faulting ──► Faulted
//!                 │           ▲
//!                 ▼           │
//!           Compensating ─────┤
//!              │   ▲          │
//!              └───┘          ▼
//!                      CompensationFailed
//! ```
//!
//! The state travels with the routing slip so every host validates the edge
//! it is about to take. No edge leads back to `Executing` once a fault has
//! been observed.

use serde::{Deserialize, Serialize};

/// Logical state of one routing slip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingSlipState {
    /// Built, not yet dispatched.
    Pending,
    /// Itinerary non-empty, no fault yet.
    Executing,
    /// Terminal: itinerary exhausted without a fault.
    Completed,
    /// Transient: fault detected, first compensation not yet dispatched.
    Faulting,
    /// Compensations in flight, most recent first.
    Compensating,
    /// Terminal: every required compensation succeeded after a fault.
    Faulted,
    /// Terminal: a compensation failed; remaining entries stay uncompensated.
    CompensationFailed,
}

impl RoutingSlipState {
    /// Returns true if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RoutingSlipState) -> bool {
        use RoutingSlipState::*;

        matches!(
            (self, next),
            (Pending, Executing)
                | (Executing, Executing)
                | (Executing, Completed)
                | (Executing, Faulting)
                | (Faulting, Compensating)
                | (Faulting, Faulted)
                | (Compensating, Compensating)
                | (Compensating, Faulted)
                | (Compensating, CompensationFailed)
        )
    }

    /// Returns true for states no routing slip ever leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RoutingSlipState::Completed
                | RoutingSlipState::Faulted
                | RoutingSlipState::CompensationFailed
        )
    }

    /// Returns true once a fault has been observed.
    pub fn is_faulted_branch(&self) -> bool {
        matches!(
            self,
            RoutingSlipState::Faulting
                | RoutingSlipState::Compensating
                | RoutingSlipState::Faulted
                | RoutingSlipState::CompensationFailed
        )
    }
}

impl std::fmt::Display for RoutingSlipState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RoutingSlipState::Pending => "pending",
            RoutingSlipState::Executing => "executing",
            RoutingSlipState::Completed => "completed",
            RoutingSlipState::Faulting => "faulting",
            RoutingSlipState::Compensating => "compensating",
            RoutingSlipState::Faulted => "faulted",
            RoutingSlipState::CompensationFailed => "compensation_failed",
        };
        write!(f, "{}", name)
    }
}
