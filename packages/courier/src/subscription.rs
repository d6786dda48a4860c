//! Event subscriptions carried on a routing slip.
//!
//! A subscription names an address and the set of lifecycle event kinds it
//! wants. Activity-level subscriptions may additionally restrict delivery to
//! events about a single activity name.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

use crate::core::Address;

/// One kind of routing slip lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Completed,
    Faulted,
    CompensationFailed,
    ActivityCompleted,
    ActivityFaulted,
    ActivityCompensated,
    ActivityCompensationFailed,
}

impl EventKind {
    /// True for events that describe a single activity.
    pub fn is_activity_event(&self) -> bool {
        matches!(
            self,
            EventKind::ActivityCompleted
                | EventKind::ActivityFaulted
                | EventKind::ActivityCompensated
                | EventKind::ActivityCompensationFailed
        )
    }

    fn bit(self) -> u16 {
        match self {
            EventKind::Completed => 1 << 0,
            EventKind::Faulted => 1 << 1,
            EventKind::CompensationFailed => 1 << 2,
            EventKind::ActivityCompleted => 1 << 3,
            EventKind::ActivityFaulted => 1 << 4,
            EventKind::ActivityCompensated => 1 << 5,
            EventKind::ActivityCompensationFailed => 1 << 6,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Completed => "RoutingSlipCompleted",
            EventKind::Faulted => "RoutingSlipFaulted",
            EventKind::CompensationFailed => "RoutingSlipCompensationFailed",
            EventKind::ActivityCompleted => "RoutingSlipActivityCompleted",
            EventKind::ActivityFaulted => "RoutingSlipActivityFaulted",
            EventKind::ActivityCompensated => "RoutingSlipActivityCompensated",
            EventKind::ActivityCompensationFailed => "RoutingSlipActivityCompensationFailed",
        };
        f.write_str(name)
    }
}

/// Set of event kinds a subscription wants.
///
/// ```ignore
/// let events = RoutingSlipEvents::ACTIVITY_COMPLETED | RoutingSlipEvents::ACTIVITY_COMPENSATED;
/// assert!(events.contains(EventKind::ActivityCompleted));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingSlipEvents(u16);

impl RoutingSlipEvents {
    pub const NONE: Self = Self(0);
    pub const COMPLETED: Self = Self(1 << 0);
    pub const FAULTED: Self = Self(1 << 1);
    pub const COMPENSATION_FAILED: Self = Self(1 << 2);
    pub const ACTIVITY_COMPLETED: Self = Self(1 << 3);
    pub const ACTIVITY_FAULTED: Self = Self(1 << 4);
    pub const ACTIVITY_COMPENSATED: Self = Self(1 << 5);
    pub const ACTIVITY_COMPENSATION_FAILED: Self = Self(1 << 6);
    /// Every routing slip and activity event.
    pub const ALL: Self = Self(0b111_1111);

    /// Terminal slip-level events only.
    pub const TERMINAL: Self = Self(1 << 0 | 1 << 1 | 1 << 2);

    pub fn contains(&self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn kinds(&self) -> impl Iterator<Item = EventKind> {
        let events = *self;
        [
            EventKind::Completed,
            EventKind::Faulted,
            EventKind::CompensationFailed,
            EventKind::ActivityCompleted,
            EventKind::ActivityFaulted,
            EventKind::ActivityCompensated,
            EventKind::ActivityCompensationFailed,
        ]
        .into_iter()
        .filter(move |kind| events.contains(*kind))
    }
}

impl Default for RoutingSlipEvents {
    fn default() -> Self {
        Self::ALL
    }
}

impl From<EventKind> for RoutingSlipEvents {
    fn from(kind: EventKind) -> Self {
        Self(kind.bit())
    }
}

impl BitOr for RoutingSlipEvents {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for RoutingSlipEvents {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A consumer registered on a routing slip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub address: Address,
    pub events: RoutingSlipEvents,
    /// Restricts activity-level events to this activity. Slip-level events
    /// are delivered regardless.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_name: Option<String>,
}

impl Subscription {
    pub fn new(address: Address, events: RoutingSlipEvents) -> Self {
        Self {
            address,
            events,
            activity_name: None,
        }
    }

    pub fn for_activity(
        address: Address,
        events: RoutingSlipEvents,
        activity_name: impl Into<String>,
    ) -> Self {
        Self {
            address,
            events,
            activity_name: Some(activity_name.into()),
        }
    }

    /// Returns true if an event of `kind` about `activity_name` should be
    /// delivered to this subscription.
    pub fn matches(&self, kind: EventKind, activity_name: Option<&str>) -> bool {
        if !self.events.contains(kind) {
            return false;
        }
        match (&self.activity_name, kind.is_activity_event()) {
            (Some(filter), true) => activity_name == Some(filter.as_str()),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> Address {
        Address::parse("loopback://localhost/observer").unwrap()
    }

    #[test]
    fn test_all_contains_every_kind() {
        assert_eq!(RoutingSlipEvents::ALL.kinds().count(), 7);
        assert!(RoutingSlipEvents::NONE.is_empty());
    }

    #[test]
    fn test_bitor_combines_kinds() {
        let events = RoutingSlipEvents::ACTIVITY_COMPLETED | RoutingSlipEvents::ACTIVITY_COMPENSATED;
        assert!(events.contains(EventKind::ActivityCompleted));
        assert!(events.contains(EventKind::ActivityCompensated));
        assert!(!events.contains(EventKind::ActivityFaulted));
        assert!(!events.contains(EventKind::Completed));
    }

    #[test]
    fn test_subscription_filters_by_kind() {
        let subscription = Subscription::new(address(), RoutingSlipEvents::FAULTED);
        assert!(subscription.matches(EventKind::Faulted, None));
        assert!(!subscription.matches(EventKind::Completed, None));
        assert!(!subscription.matches(EventKind::ActivityFaulted, Some("Test")));
    }

    #[test]
    fn test_activity_filter_only_applies_to_activity_events() {
        let subscription = Subscription::for_activity(
            address(),
            RoutingSlipEvents::ACTIVITY_COMPLETED | RoutingSlipEvents::COMPLETED,
            "Test",
        );

        assert!(subscription.matches(EventKind::ActivityCompleted, Some("Test")));
        assert!(!subscription.matches(EventKind::ActivityCompleted, Some("SecondTest")));
        assert!(subscription.matches(EventKind::Completed, None));
    }

    #[test]
    fn test_events_serialize_as_bits() {
        let json = serde_json::to_string(&RoutingSlipEvents::TERMINAL).unwrap();
        assert_eq!(json, "7");
    }
}
