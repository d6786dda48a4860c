//! Routing slip lifecycle events.
//!
//! Every step of a routing slip publishes one of these. They are facts:
//! consumers observe them, they never steer the slip.
//!
//! | Event                                  | Published when                           |
//! |----------------------------------------|------------------------------------------|
//! | `RoutingSlipActivityCompleted`         | an activity completed                    |
//! | `RoutingSlipActivityFaulted`           | an activity faulted                      |
//! | `RoutingSlipActivityCompensated`       | an activity was undone                   |
//! | `RoutingSlipActivityCompensationFailed`| undoing an activity failed               |
//! | `RoutingSlipCompleted`                 | the itinerary ran out without a fault    |
//! | `RoutingSlipFaulted`                   | every required compensation succeeded    |
//! | `RoutingSlipCompensationFailed`        | compensation stopped on a failure        |

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{Address, ExecutionId, TrackingNumber};
use crate::error::{ActivityException, CourierError, ExceptionInfo};
use crate::subscription::EventKind;
use crate::variables::Variables;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingSlipCompleted {
    pub tracking_number: TrackingNumber,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    pub variables: Variables,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingSlipFaulted {
    pub tracking_number: TrackingNumber,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    pub activity_exceptions: Vec<ActivityException>,
    pub variables: Variables,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingSlipCompensationFailed {
    pub tracking_number: TrackingNumber,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    /// Activity whose compensation failed.
    pub activity_name: String,
    pub exception_info: ExceptionInfo,
    /// Log entries left uncompensated.
    pub remaining: usize,
    pub activity_exceptions: Vec<ActivityException>,
    pub variables: Variables,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingSlipActivityCompleted {
    pub tracking_number: TrackingNumber,
    pub execution_id: ExecutionId,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    pub activity_name: String,
    pub host: Address,
    pub arguments: Variables,
    /// The compensation log the activity returned (`null` if none).
    pub results: Value,
    pub variables: Variables,
}

impl RoutingSlipActivityCompleted {
    /// Read one field of the activity's results.
    pub fn get_result<T: DeserializeOwned>(&self, key: &str) -> Result<T, CourierError> {
        let value = self
            .results
            .get(key)
            .ok_or_else(|| CourierError::VariableNotFound {
                name: key.to_string(),
            })?;
        serde_json::from_value(value.clone()).map_err(|source| CourierError::VariableType {
            name: key.to_string(),
            source,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingSlipActivityFaulted {
    pub tracking_number: TrackingNumber,
    pub execution_id: ExecutionId,
    pub timestamp: DateTime<Utc>,
    pub elapsed: Duration,
    pub activity_name: String,
    pub host: Address,
    pub exception_info: ExceptionInfo,
    pub arguments: Variables,
    pub variables: Variables,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingSlipActivityCompensated {
    pub tracking_number: TrackingNumber,
    /// Execution id of the run that was undone.
    pub execution_id: ExecutionId,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    pub activity_name: String,
    /// The compensation log that was replayed.
    pub data: Value,
    pub variables: Variables,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingSlipActivityCompensationFailed {
    pub tracking_number: TrackingNumber,
    pub execution_id: ExecutionId,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    pub activity_name: String,
    pub exception_info: ExceptionInfo,
    pub data: Value,
    /// Log entries left uncompensated.
    pub remaining: usize,
    pub variables: Variables,
}

/// Any routing slip lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RoutingSlipEvent {
    #[serde(rename = "RoutingSlipCompleted")]
    Completed(RoutingSlipCompleted),
    #[serde(rename = "RoutingSlipFaulted")]
    Faulted(RoutingSlipFaulted),
    #[serde(rename = "RoutingSlipCompensationFailed")]
    CompensationFailed(RoutingSlipCompensationFailed),
    #[serde(rename = "RoutingSlipActivityCompleted")]
    ActivityCompleted(RoutingSlipActivityCompleted),
    #[serde(rename = "RoutingSlipActivityFaulted")]
    ActivityFaulted(RoutingSlipActivityFaulted),
    #[serde(rename = "RoutingSlipActivityCompensated")]
    ActivityCompensated(RoutingSlipActivityCompensated),
    #[serde(rename = "RoutingSlipActivityCompensationFailed")]
    ActivityCompensationFailed(RoutingSlipActivityCompensationFailed),
}

impl RoutingSlipEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RoutingSlipEvent::Completed(_) => EventKind::Completed,
            RoutingSlipEvent::Faulted(_) => EventKind::Faulted,
            RoutingSlipEvent::CompensationFailed(_) => EventKind::CompensationFailed,
            RoutingSlipEvent::ActivityCompleted(_) => EventKind::ActivityCompleted,
            RoutingSlipEvent::ActivityFaulted(_) => EventKind::ActivityFaulted,
            RoutingSlipEvent::ActivityCompensated(_) => EventKind::ActivityCompensated,
            RoutingSlipEvent::ActivityCompensationFailed(_) => {
                EventKind::ActivityCompensationFailed
            }
        }
    }

    pub fn tracking_number(&self) -> TrackingNumber {
        match self {
            RoutingSlipEvent::Completed(e) => e.tracking_number,
            RoutingSlipEvent::Faulted(e) => e.tracking_number,
            RoutingSlipEvent::CompensationFailed(e) => e.tracking_number,
            RoutingSlipEvent::ActivityCompleted(e) => e.tracking_number,
            RoutingSlipEvent::ActivityFaulted(e) => e.tracking_number,
            RoutingSlipEvent::ActivityCompensated(e) => e.tracking_number,
            RoutingSlipEvent::ActivityCompensationFailed(e) => e.tracking_number,
        }
    }

    /// The activity an activity-level event is about. Slip-level events
    /// return `None`, except compensation failure which names the activity
    /// that stopped the unwind.
    pub fn activity_name(&self) -> Option<&str> {
        match self {
            RoutingSlipEvent::Completed(_) | RoutingSlipEvent::Faulted(_) => None,
            RoutingSlipEvent::CompensationFailed(e) => Some(&e.activity_name),
            RoutingSlipEvent::ActivityCompleted(e) => Some(&e.activity_name),
            RoutingSlipEvent::ActivityFaulted(e) => Some(&e.activity_name),
            RoutingSlipEvent::ActivityCompensated(e) => Some(&e.activity_name),
            RoutingSlipEvent::ActivityCompensationFailed(e) => Some(&e.activity_name),
        }
    }

    pub fn variables(&self) -> &Variables {
        match self {
            RoutingSlipEvent::Completed(e) => &e.variables,
            RoutingSlipEvent::Faulted(e) => &e.variables,
            RoutingSlipEvent::CompensationFailed(e) => &e.variables,
            RoutingSlipEvent::ActivityCompleted(e) => &e.variables,
            RoutingSlipEvent::ActivityFaulted(e) => &e.variables,
            RoutingSlipEvent::ActivityCompensated(e) => &e.variables,
            RoutingSlipEvent::ActivityCompensationFailed(e) => &e.variables,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            RoutingSlipEvent::Completed(e) => e.timestamp,
            RoutingSlipEvent::Faulted(e) => e.timestamp,
            RoutingSlipEvent::CompensationFailed(e) => e.timestamp,
            RoutingSlipEvent::ActivityCompleted(e) => e.timestamp,
            RoutingSlipEvent::ActivityFaulted(e) => e.timestamp,
            RoutingSlipEvent::ActivityCompensated(e) => e.timestamp,
            RoutingSlipEvent::ActivityCompensationFailed(e) => e.timestamp,
        }
    }

    /// Read a variable as it stood when the event was published.
    pub fn get_variable<T: DeserializeOwned>(&self, name: &str) -> Result<T, CourierError> {
        self.variables().get(name)
    }

    /// True for the three events that end a routing slip.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RoutingSlipEvent::Completed(_)
                | RoutingSlipEvent::Faulted(_)
                | RoutingSlipEvent::CompensationFailed(_)
        )
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CourierError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CourierError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
