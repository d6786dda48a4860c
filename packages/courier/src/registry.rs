//! Name → activity resolution, done once when the engine is built.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::activity::{
    AnyCompensateActivity, AnyExecuteActivity, CompensateActivity, CompensateWrapper,
    ExecuteActivity, ExecuteWrapper,
};
use crate::core::Address;
use crate::error::CourierError;

/// One registered activity and the addresses its hosts listen on.
pub struct ActivityDefinition {
    name: String,
    execute_address: Address,
    compensate_address: Option<Address>,
    pub(crate) execute: Arc<dyn AnyExecuteActivity>,
    pub(crate) compensate: Option<Arc<dyn AnyCompensateActivity>>,
}

impl ActivityDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address to put in an itinerary to run this activity.
    pub fn execute_address(&self) -> &Address {
        &self.execute_address
    }

    /// Address the slip is sent to when this activity must be undone.
    pub fn compensate_address(&self) -> Option<&Address> {
        self.compensate_address.as_ref()
    }

    pub fn is_compensable(&self) -> bool {
        self.compensate.is_some()
    }
}

impl std::fmt::Debug for ActivityDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityDefinition")
            .field("name", &self.name)
            .field("execute_address", &self.execute_address)
            .field("compensate_address", &self.compensate_address)
            .finish_non_exhaustive()
    }
}

/// Registered activities, keyed by name.
///
/// Each activity named `Foo` executes at `{base}/execute_Foo` and, when it
/// can be compensated, compensates at `{base}/compensate_Foo`.
pub struct ActivityRegistry {
    base_address: String,
    definitions: IndexMap<String, Arc<ActivityDefinition>>,
}

impl ActivityRegistry {
    pub fn new(base_address: impl Into<String>) -> Self {
        Self {
            base_address: base_address.into(),
            definitions: IndexMap::new(),
        }
    }

    /// Register an activity that has both halves.
    pub fn register<A>(&mut self, name: impl Into<String>, activity: A) -> Result<(), CourierError>
    where
        A: ExecuteActivity + CompensateActivity,
    {
        let activity = Arc::new(activity);
        self.insert(
            name.into(),
            Arc::new(ExecuteWrapper::new(activity.clone())),
            Some(Arc::new(CompensateWrapper::new(activity))),
        )
    }

    /// Register an activity that cannot be compensated.
    pub fn register_execute<A>(
        &mut self,
        name: impl Into<String>,
        activity: A,
    ) -> Result<(), CourierError>
    where
        A: ExecuteActivity,
    {
        self.insert(
            name.into(),
            Arc::new(ExecuteWrapper::new(Arc::new(activity))),
            None,
        )
    }

    pub(crate) fn insert(
        &mut self,
        name: String,
        execute: Arc<dyn AnyExecuteActivity>,
        compensate: Option<Arc<dyn AnyCompensateActivity>>,
    ) -> Result<(), CourierError> {
        if self.definitions.contains_key(&name) {
            return Err(CourierError::ActivityAlreadyRegistered { name });
        }

        let execute_address = Address::endpoint(&self.base_address, &format!("execute_{name}"))?;
        let compensate_address = match compensate {
            Some(_) => Some(Address::endpoint(
                &self.base_address,
                &format!("compensate_{name}"),
            )?),
            None => None,
        };

        let definition = ActivityDefinition {
            name: name.clone(),
            execute_address,
            compensate_address,
            execute,
            compensate,
        };
        self.definitions.insert(name, Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ActivityDefinition>> {
        self.definitions.get(name)
    }

    /// Look up an activity, failing if it was never registered.
    pub fn require(&self, name: &str) -> Result<&Arc<ActivityDefinition>, CourierError> {
        self.get(name).ok_or_else(|| CourierError::UnknownActivity {
            name: name.to_string(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ActivityDefinition>> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl std::fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("base_address", &self.base_address)
            .field("activities", &self.definitions.keys().collect::<Vec<_>>())
            .finish()
    }
}
