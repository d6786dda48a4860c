//! The routing slip: the unit of work handed from host to host.
//!
//! A routing slip is built once by [`RoutingSlipBuilder`](crate::RoutingSlipBuilder),
//! then owned by exactly one host at a time. Hand-offs serialize the slip into
//! an envelope and drop the local value, so the type is intentionally not
//! `Clone`: a host that forwarded a slip has nothing left to mutate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::activity_log::ActivityLog;
use crate::core::TrackingNumber;
use crate::error::{ActivityException, CourierError};
use crate::itinerary::Itinerary;
use crate::state::RoutingSlipState;
use crate::subscription::Subscription;
use crate::variables::Variables;

/// Execution envelope of one saga instance.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingSlip {
    tracking_number: TrackingNumber,
    create_timestamp: DateTime<Utc>,
    state: RoutingSlipState,
    itinerary: Itinerary,
    activity_log: ActivityLog,
    #[serde(default)]
    variables: Variables,
    #[serde(default)]
    activity_exceptions: Vec<ActivityException>,
    #[serde(default)]
    subscriptions: Vec<Subscription>,
}

impl RoutingSlip {
    pub(crate) fn new(
        tracking_number: TrackingNumber,
        itinerary: Itinerary,
        variables: Variables,
        subscriptions: Vec<Subscription>,
    ) -> Self {
        Self {
            tracking_number,
            create_timestamp: Utc::now(),
            state: RoutingSlipState::Pending,
            itinerary,
            activity_log: ActivityLog::new(),
            variables,
            activity_exceptions: Vec::new(),
            subscriptions,
        }
    }

    pub fn tracking_number(&self) -> TrackingNumber {
        self.tracking_number
    }

    pub fn create_timestamp(&self) -> DateTime<Utc> {
        self.create_timestamp
    }

    /// Wall-clock time since the slip was built.
    pub fn elapsed(&self) -> std::time::Duration {
        (Utc::now() - self.create_timestamp)
            .to_std()
            .unwrap_or_default()
    }

    pub fn state(&self) -> RoutingSlipState {
        self.state
    }

    pub fn itinerary(&self) -> &Itinerary {
        &self.itinerary
    }

    pub fn activity_log(&self) -> &ActivityLog {
        &self.activity_log
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn activity_exceptions(&self) -> &[ActivityException] {
        &self.activity_exceptions
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub(crate) fn itinerary_mut(&mut self) -> &mut Itinerary {
        &mut self.itinerary
    }

    pub(crate) fn activity_log_mut(&mut self) -> &mut ActivityLog {
        &mut self.activity_log
    }

    pub(crate) fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }

    pub(crate) fn record_exception(&mut self, exception: ActivityException) {
        self.activity_exceptions.push(exception);
    }

    /// Move to `next`, rejecting edges the state machine forbids.
    pub(crate) fn transition(&mut self, next: RoutingSlipState) -> Result<(), CourierError> {
        if !self.state.can_transition_to(next) {
            return Err(CourierError::InvalidStateTransition {
                tracking_number: self.tracking_number,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Serialize for a hand-off. The sender drops its copy once the
    /// transport has accepted the bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CourierError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CourierError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::activity_log::ActivityLogEntry;
    use crate::core::{Address, ExecutionId};
    use crate::error::{ExceptionInfo, FaultKind};
    use crate::itinerary::Activity;
    use crate::subscription::RoutingSlipEvents;

    fn slip() -> RoutingSlip {
        let mut itinerary = Itinerary::new();
        itinerary.push(Activity::new(
            "Test",
            Address::parse("loopback://localhost/execute_test").unwrap(),
        ));
        let mut variables = Variables::new();
        variables.set("Variable", "Knife").unwrap();
        let subscriptions = vec![Subscription::new(
            Address::parse("loopback://localhost/bus").unwrap(),
            RoutingSlipEvents::ALL,
        )];
        RoutingSlip::new(TrackingNumber::new(), itinerary, variables, subscriptions)
    }

    #[test]
    fn test_new_slip_is_pending() {
        let slip = slip();
        assert_eq!(slip.state(), RoutingSlipState::Pending);
        assert!(slip.activity_log().is_empty());
        assert_eq!(slip.itinerary().len(), 1);
    }

    #[test]
    fn test_transition_rejects_forbidden_edge() {
        let mut slip = slip();
        let err = slip.transition(RoutingSlipState::Completed).unwrap_err();
        assert!(matches!(
            err,
            CourierError::InvalidStateTransition {
                from: RoutingSlipState::Pending,
                to: RoutingSlipState::Completed,
                ..
            }
        ));
        assert_eq!(slip.state(), RoutingSlipState::Pending);

        slip.transition(RoutingSlipState::Executing).unwrap();
        assert_eq!(slip.state(), RoutingSlipState::Executing);
    }

    #[test]
    fn test_round_trips_losslessly() {
        let mut slip = slip();
        slip.transition(RoutingSlipState::Executing).unwrap();
        let host = Address::parse("loopback://localhost/execute_test").unwrap();
        slip.activity_log_mut().push(ActivityLogEntry {
            execution_id: ExecutionId::new(),
            name: "Test".into(),
            timestamp: Utc::now(),
            duration: Duration::from_millis(12),
            host: host.clone(),
            compensate_address: Some(
                Address::parse("loopback://localhost/compensate_test").unwrap(),
            ),
            data: json!({ "OriginalValue": "Hello", "raw": [0, 255, null] }),
        });
        slip.record_exception(ActivityException {
            execution_id: ExecutionId::new(),
            name: "Faulty".into(),
            host,
            timestamp: Utc::now(),
            elapsed: Duration::from_millis(3),
            exception_info: ExceptionInfo::new(FaultKind::Activity, "boom"),
        });

        let tracking_number = slip.tracking_number();
        let expected = serde_json::to_value(&slip).unwrap();
        let bytes = slip.to_bytes().unwrap();
        drop(slip);
        let back = RoutingSlip::from_bytes(&bytes).unwrap();

        assert_eq!(back.tracking_number(), tracking_number);
        assert_eq!(serde_json::to_value(&back).unwrap(), expected);
    }
}
