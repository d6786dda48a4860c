//! The ordered plan of activities a routing slip has yet to execute.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::core::Address;
use crate::error::CourierError;
use crate::variables::Variables;

/// One planned activity: its name, where it executes, and its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub name: String,
    /// Execute address of the host running this activity.
    pub address: Address,
    /// Entry-specific arguments. These win over variables of the same name.
    #[serde(default)]
    pub arguments: Variables,
}

impl Activity {
    pub fn new(name: impl Into<String>, address: Address) -> Self {
        Self {
            name: name.into(),
            address,
            arguments: Variables::new(),
        }
    }

    /// Attach arguments from any value that serializes to a JSON object.
    pub fn with_arguments<T: Serialize>(mut self, arguments: &T) -> Result<Self, CourierError> {
        self.arguments = Variables::from_object(arguments)?;
        Ok(self)
    }
}

/// How a completed activity changes the remaining plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ItineraryRevision {
    /// Keep the remaining itinerary as it is.
    #[default]
    Unchanged,
    /// Append activities after every entry already in the itinerary.
    Append(Vec<Activity>),
    /// Replace the remaining itinerary. An empty replacement ends the slip
    /// successfully once the current activity completes.
    Replace(Vec<Activity>),
}

/// Remaining activities, front first.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Itinerary(VecDeque<Activity>);

impl Itinerary {
    pub fn new() -> Self {
        Self(VecDeque::new())
    }

    pub(crate) fn push(&mut self, activity: Activity) {
        self.0.push_back(activity);
    }

    /// Take the next activity to execute.
    pub(crate) fn pop_front(&mut self) -> Option<Activity> {
        self.0.pop_front()
    }

    pub(crate) fn revise(&mut self, revision: ItineraryRevision) {
        match revision {
            ItineraryRevision::Unchanged => {}
            ItineraryRevision::Append(activities) => self.0.extend(activities),
            ItineraryRevision::Replace(activities) => self.0 = activities.into(),
        }
    }

    pub fn front(&self) -> Option<&Activity> {
        self.0.front()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Activity> {
        self.0.iter()
    }
}
