//! The variable bag threaded through a routing slip.
//!
//! Variables are an ordered name → JSON value map. Every activity reads the
//! bag as it stands when the activity starts, and may return variables to
//! merge back in. Merges add or overwrite; nothing is removed unless an
//! activity explicitly removes it.

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CourierError;

/// Ordered, untyped key/value store.
///
/// # Example
///
/// ```ignore
/// let mut variables = Variables::new();
/// variables.set("Variable", "Knife")?;
///
/// let value: String = variables.get("Variable")?;
/// assert_eq!(value, "Knife");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables(IndexMap<String, Value>);

impl Variables {
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    /// Build a bag from any value that serializes to a JSON object.
    ///
    /// Field order of the object is preserved.
    pub fn from_object<T: Serialize>(value: &T) -> Result<Self, CourierError> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(map.into_iter().collect()),
            Value::Null => Ok(Self::new()),
            _ => Err(CourierError::NotAnObject { what: "variables" }),
        }
    }

    /// Serialize `value` and store it under `name` (last write wins).
    pub fn set<T: Serialize>(
        &mut self,
        name: impl Into<String>,
        value: T,
    ) -> Result<(), CourierError> {
        let value = serde_json::to_value(value)?;
        self.set_value(name, value);
        Ok(())
    }

    /// Store a raw JSON value under `name` (last write wins).
    pub fn set_value(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    /// Read and deserialize a variable.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, CourierError> {
        let value = self
            .0
            .get(name)
            .ok_or_else(|| CourierError::VariableNotFound {
                name: name.to_string(),
            })?;
        serde_json::from_value(value.clone()).map_err(|source| CourierError::VariableType {
            name: name.to_string(),
            source,
        })
    }

    pub fn get_value(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Remove a variable, keeping the order of the remaining entries.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.shift_remove(name)
    }

    /// Merge `other` into this bag; values in `other` win on collision.
    ///
    /// Existing keys keep their position, new keys are appended.
    pub fn merge(&mut self, other: Variables) {
        for (name, value) in other.0 {
            self.0.insert(name, value);
        }
    }

    /// Return a copy of this bag with `overrides` merged on top.
    pub fn merged_with(&self, overrides: &Variables) -> Variables {
        let mut merged = self.clone();
        merged.merge(overrides.clone());
        merged
    }

    /// Render the bag as a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl FromIterator<(String, Value)> for Variables {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Variables {
    type Item = (String, Value);
    type IntoIter = indexmap::map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
