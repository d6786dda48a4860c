//! Identity types shared by every routing slip, host, and event.
//!
//! # Overview
//!
//! - [`TrackingNumber`] identifies one routing slip for its whole lifetime and
//!   correlates every lifecycle event it produces.
//! - [`ExecutionId`] identifies one execution of one activity within a slip.
//! - [`Address`] is the endpoint a routing slip or event is sent to.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::CourierError;

/// Globally unique identifier of a routing slip.
///
/// Assigned once by the builder and never changed. Tracking numbers are
/// UUID v7, so they carry their creation time.
///
/// # Example
///
/// ```ignore
/// use courier::TrackingNumber;
///
/// let tracking_number = TrackingNumber::new();
/// assert!(tracking_number.is_some());
///
/// // Convert from an existing Uuid
/// let tracking_number = TrackingNumber::from(my_uuid);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingNumber(Uuid);

impl TrackingNumber {
    /// Sentinel value for "no routing slip".
    pub const NONE: Self = Self(Uuid::nil());

    /// Create a new time-ordered tracking number.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// True for [`TrackingNumber::NONE`].
    pub fn is_none(&self) -> bool {
        self.0.is_nil()
    }

    pub fn is_some(&self) -> bool {
        !self.is_none()
    }

    pub fn into_inner(self) -> Uuid {
        self.0
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TrackingNumber {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TrackingNumber {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<TrackingNumber> for Uuid {
    fn from(tracking_number: TrackingNumber) -> Uuid {
        tracking_number.0
    }
}

impl fmt::Display for TrackingNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Identifier of a single activity execution.
///
/// The same activity executed twice in one itinerary gets two execution ids;
/// the id links an activity log entry to its completion, fault, and
/// compensation events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message endpoint address.
///
/// Addresses are URLs (`loopback://localhost/execute_test`). The engine never
/// interprets them beyond equality; the transport resolves them to endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(Url);

impl Address {
    /// Parse an address from a string.
    pub fn parse(address: &str) -> Result<Self, CourierError> {
        Url::parse(address)
            .map(Self)
            .map_err(|source| CourierError::InvalidAddress {
                address: address.to_string(),
                source,
            })
    }

    /// Build the address of a named endpoint below a base address.
    ///
    /// `Address::endpoint("loopback://localhost", "execute_test")` yields
    /// `loopback://localhost/execute_test`.
    pub fn endpoint(base: &str, name: &str) -> Result<Self, CourierError> {
        Self::parse(&format!("{}/{}", base.trim_end_matches('/'), name))
    }

    pub fn as_url(&self) -> &Url {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<Url> for Address {
    fn from(url: Url) -> Self {
        Self(url)
    }
}

impl FromStr for Address {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
