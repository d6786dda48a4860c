//! Structured error types and the serializable fault model for courier.
//!
//! `CourierError` provides pattern-matchable errors instead of generic `anyhow::Error`.
//! `ExceptionInfo` is the sanitized shape of a fault once it is recorded on a
//! routing slip or carried by a lifecycle event.
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` ever crosses a host boundary.**
//!
//! - `anyhow` is the ergonomic error type inside activities
//! - `ExceptionInfo` is the only externalized fault (serialized into the slip and events)
//!
//! # Fault Taxonomy
//!
//! | Fault                | Source                          | Outcome                          |
//! |----------------------|---------------------------------|----------------------------------|
//! | Activity fault       | `execute` returned `Faulted`/Err | Compensation phase               |
//! | Routing mismatch     | Slip arrived at the wrong host  | Fatal, dead-lettered             |
//! | Compensation fault   | `compensate` returned `Failed`  | `CompensationFailed` terminal    |
//! | Publish fault        | Event delivery failed           | Logged only                      |

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Address, ExecutionId, TrackingNumber};
use crate::state::RoutingSlipState;

// =============================================================================
// Courier Error
// =============================================================================

/// Structured error type for courier operations.
///
/// Each variant includes context about what went wrong.
#[derive(Debug, Error)]
pub enum CourierError {
    /// `build()` was called without any activity.
    #[error("routing slip itinerary is empty: at least one activity is required")]
    EmptyItinerary,

    /// A host received a routing slip whose itinerary (or activity log) head
    /// names a different activity.
    #[error("routing mismatch on {tracking_number}: host runs {expected}, slip names {actual}")]
    RoutingMismatch {
        tracking_number: TrackingNumber,
        /// Activity hosted at the receiving address.
        expected: String,
        /// Activity named by the routing slip.
        actual: String,
    },

    /// A routing slip attempted a transition the state machine forbids.
    #[error("invalid routing slip transition on {tracking_number}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        tracking_number: TrackingNumber,
        from: RoutingSlipState,
        to: RoutingSlipState,
    },

    /// No activity with this name was registered.
    #[error("no activity registered with name {name}")]
    UnknownActivity { name: String },

    /// An activity with this name is already registered.
    #[error("activity already registered with name {name}")]
    ActivityAlreadyRegistered { name: String },

    /// An address string could not be parsed.
    #[error("invalid address {address}: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: url::ParseError,
    },

    /// No endpoint is connected at the destination address.
    #[error("no endpoint connected at {address}")]
    EndpointNotFound { address: Address },

    /// The endpoint at the destination address stopped receiving.
    #[error("endpoint at {address} is closed")]
    EndpointClosed { address: Address },

    /// An endpoint is already connected at this address.
    #[error("an endpoint is already connected at {address}")]
    EndpointAlreadyConnected { address: Address },

    /// A send filter did not pass the message on.
    #[error("message to {address} was filtered out by the send pipe")]
    SendFiltered { address: Address },

    /// Activity arguments could not be deserialized.
    #[error("failed to deserialize arguments for activity {activity}: {source}")]
    ArgumentDeserialization {
        activity: String,
        #[source]
        source: serde_json::Error,
    },

    /// Stored compensation data could not be deserialized.
    #[error("failed to deserialize compensation log for activity {activity}: {source}")]
    LogDeserialization {
        activity: String,
        #[source]
        source: serde_json::Error,
    },

    /// A variable lookup found nothing.
    #[error("variable {name} not found")]
    VariableNotFound { name: String },

    /// A variable exists but does not have the requested type.
    #[error("variable {name} has an unexpected type: {source}")]
    VariableType {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    /// A value could not be stored because it does not serialize to a JSON object.
    #[error("expected a JSON object for {what}")]
    NotAnObject { what: &'static str },

    /// The activity panicked while executing or compensating.
    #[error("activity {activity} panicked: {message}")]
    ActivityPanicked { activity: String, message: String },

    /// The message time-to-live elapsed before the activity started.
    #[error("time-to-live for activity {activity} expired at {expired_at}")]
    TimeToLiveExpired {
        activity: String,
        expired_at: DateTime<Utc>,
    },

    /// Timeout waiting for a routing slip to reach a terminal state.
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// The engine cannot observe the events of this routing slip.
    #[error("routing slip {tracking_number} does not deliver events to this engine")]
    UntrackedRoutingSlip { tracking_number: TrackingNumber },

    /// JSON serialization failure.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CourierError {
    /// Returns true for errors that must never be converted into a saga fault.
    ///
    /// Fatal errors indicate a configuration or build defect: the slip is
    /// dead-lettered instead of compensated.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CourierError::RoutingMismatch { .. } | CourierError::InvalidStateTransition { .. }
        )
    }

    /// The fault kind this error maps to when it is recorded on a slip.
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            CourierError::ArgumentDeserialization { .. } => FaultKind::Arguments,
            CourierError::LogDeserialization { .. } => FaultKind::Log,
            CourierError::ActivityPanicked { .. } => FaultKind::Panic,
            CourierError::TimeToLiveExpired { .. } | CourierError::Timeout { .. } => {
                FaultKind::Timeout
            }
            CourierError::EndpointNotFound { .. }
            | CourierError::EndpointClosed { .. }
            | CourierError::SendFiltered { .. } => FaultKind::Transport,
            _ => FaultKind::Activity,
        }
    }
}

// =============================================================================
// Exception Info
// =============================================================================

/// Category of a recorded fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The activity reported a business fault or returned an error.
    Activity,
    /// Arguments could not be deserialized for the activity.
    Arguments,
    /// Compensation data could not be deserialized for the activity.
    Log,
    /// The message expired before the activity ran.
    Timeout,
    /// The activity panicked.
    Panic,
    /// The routing slip could not be handed to the next host.
    Transport,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Activity => write!(f, "activity_fault"),
            FaultKind::Arguments => write!(f, "argument_error"),
            FaultKind::Log => write!(f, "log_error"),
            FaultKind::Timeout => write!(f, "timeout"),
            FaultKind::Panic => write!(f, "panic"),
            FaultKind::Transport => write!(f, "transport_error"),
        }
    }
}

/// Serializable description of a fault.
///
/// Built from an `anyhow::Error` at the host that observed the failure. The
/// message is the error's display string; `causes` holds the source chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub kind: FaultKind,
    pub message: String,
    #[serde(default)]
    pub causes: Vec<String>,
}

impl ExceptionInfo {
    /// Create exception info from an anyhow error.
    ///
    /// Courier's own errors are classified through [`CourierError::fault_kind`];
    /// anything else is an activity fault.
    pub fn from_error(error: &anyhow::Error) -> Self {
        let kind = error
            .downcast_ref::<CourierError>()
            .map(CourierError::fault_kind)
            .unwrap_or(FaultKind::Activity);

        Self {
            kind,
            message: error.to_string(),
            causes: error.chain().skip(1).map(|cause| cause.to_string()).collect(),
        }
    }

    /// Create exception info with an explicit kind and message.
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            causes: Vec::new(),
        }
    }
}

impl fmt::Display for ExceptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

/// A fault recorded on a routing slip.
///
/// Every faulted execution appends one of these to the slip; they are
/// reported together by `RoutingSlipFaulted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityException {
    pub execution_id: ExecutionId,
    /// Name of the activity that faulted.
    pub name: String,
    /// Execute address of the faulting host.
    pub host: Address,
    pub timestamp: DateTime<Utc>,
    /// Time spent in the activity before it faulted.
    pub elapsed: std::time::Duration,
    pub exception_info: ExceptionInfo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_routing_mismatch_display() {
        let err = CourierError::RoutingMismatch {
            tracking_number: TrackingNumber::NONE,
            expected: "Test".into(),
            actual: "SecondTest".into(),
        };
        let message = err.to_string();
        assert!(message.contains("routing mismatch"));
        assert!(message.contains("Test"));
        assert!(message.contains("SecondTest"));
    }

    #[test]
    fn test_only_routing_errors_are_fatal() {
        let mismatch = CourierError::RoutingMismatch {
            tracking_number: TrackingNumber::NONE,
            expected: "A".into(),
            actual: "B".into(),
        };
        assert!(mismatch.is_fatal());

        let transition = CourierError::InvalidStateTransition {
            tracking_number: TrackingNumber::NONE,
            from: RoutingSlipState::Faulted,
            to: RoutingSlipState::Executing,
        };
        assert!(transition.is_fatal());

        assert!(!CourierError::EmptyItinerary.is_fatal());
        assert!(!CourierError::ActivityPanicked {
            activity: "A".into(),
            message: "boom".into(),
        }
        .is_fatal());
    }

    #[test]
    fn test_exception_info_classifies_courier_errors() {
        let err: anyhow::Error = CourierError::ActivityPanicked {
            activity: "Test".into(),
            message: "boom".into(),
        }
        .into();
        let info = ExceptionInfo::from_error(&err);
        assert_eq!(info.kind, FaultKind::Panic);
        assert!(info.message.contains("boom"));
    }

    #[test]
    fn test_exception_info_defaults_to_activity_fault() {
        let err = anyhow::anyhow!("card declined");
        let info = ExceptionInfo::from_error(&err);
        assert_eq!(info.kind, FaultKind::Activity);
        assert_eq!(info.message, "card declined");
        assert!(info.causes.is_empty());
    }

    #[test]
    fn test_exception_info_keeps_cause_chain() {
        let err = Err::<(), _>(anyhow::anyhow!("socket reset"))
            .context("payment gateway unavailable")
            .unwrap_err();
        let info = ExceptionInfo::from_error(&err);
        assert_eq!(info.message, "payment gateway unavailable");
        assert_eq!(info.causes, vec!["socket reset".to_string()]);
    }

    #[test]
    fn test_error_can_be_downcast_from_anyhow() {
        let err: anyhow::Error = CourierError::UnknownActivity {
            name: "Missing".into(),
        }
        .into();

        match err.downcast_ref::<CourierError>() {
            Some(CourierError::UnknownActivity { name }) => assert_eq!(name, "Missing"),
            _ => panic!("Expected UnknownActivity"),
        }
    }
}
