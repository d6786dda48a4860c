//! Fluent construction of routing slips.

use serde::Serialize;

use crate::core::{Address, TrackingNumber};
use crate::error::CourierError;
use crate::itinerary::{Activity, Itinerary};
use crate::slip::RoutingSlip;
use crate::subscription::{RoutingSlipEvents, Subscription};
use crate::variables::Variables;

/// Builds a [`RoutingSlip`].
///
/// # Example
///
/// ```ignore
/// let mut builder = RoutingSlipBuilder::new(TrackingNumber::new());
/// builder.add_subscription(handle.bus_address().clone(), RoutingSlipEvents::ALL);
/// builder.add_activity_with_arguments("Test", test_address, &json!({ "Value": "Hello" }))?;
/// builder.add_activity("SecondTest", second_address);
/// builder.add_variable("Variable", "Knife")?;
///
/// let slip = builder.build()?;
/// handle.execute(slip).await?;
/// ```
#[derive(Debug)]
pub struct RoutingSlipBuilder {
    tracking_number: TrackingNumber,
    itinerary: Itinerary,
    variables: Variables,
    subscriptions: Vec<Subscription>,
}

impl RoutingSlipBuilder {
    pub fn new(tracking_number: TrackingNumber) -> Self {
        Self {
            tracking_number,
            itinerary: Itinerary::new(),
            variables: Variables::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn tracking_number(&self) -> TrackingNumber {
        self.tracking_number
    }

    /// Deliver the given event kinds to `address`.
    pub fn add_subscription(&mut self, address: Address, events: RoutingSlipEvents) -> &mut Self {
        self.subscriptions.push(Subscription::new(address, events));
        self
    }

    /// Deliver the given event kinds to `address`, limiting activity events to
    /// those about `activity_name`.
    pub fn add_activity_subscription(
        &mut self,
        address: Address,
        events: RoutingSlipEvents,
        activity_name: impl Into<String>,
    ) -> &mut Self {
        self.subscriptions
            .push(Subscription::for_activity(address, events, activity_name));
        self
    }

    pub fn add_variable<T: Serialize>(
        &mut self,
        name: impl Into<String>,
        value: T,
    ) -> Result<&mut Self, CourierError> {
        self.variables.set(name, value)?;
        Ok(self)
    }

    /// Add every field of a serializable object as a variable.
    pub fn add_variables<T: Serialize>(&mut self, values: &T) -> Result<&mut Self, CourierError> {
        self.variables.merge(Variables::from_object(values)?);
        Ok(self)
    }

    pub fn add_activity(&mut self, name: impl Into<String>, address: Address) -> &mut Self {
        self.itinerary.push(Activity::new(name, address));
        self
    }

    pub fn add_activity_with_arguments<T: Serialize>(
        &mut self,
        name: impl Into<String>,
        address: Address,
        arguments: &T,
    ) -> Result<&mut Self, CourierError> {
        let activity = Activity::new(name, address).with_arguments(arguments)?;
        self.itinerary.push(activity);
        Ok(self)
    }

    /// Finish the slip. Fails if no activity was added.
    pub fn build(self) -> Result<RoutingSlip, CourierError> {
        if self.itinerary.is_empty() {
            return Err(CourierError::EmptyItinerary);
        }
        Ok(RoutingSlip::new(
            self.tracking_number,
            self.itinerary,
            self.variables,
            self.subscriptions,
        ))
    }
}

impl Default for RoutingSlipBuilder {
    fn default() -> Self {
        Self::new(TrackingNumber::new())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::state::RoutingSlipState;

    fn address(name: &str) -> Address {
        Address::endpoint("loopback://localhost", name).unwrap()
    }

    #[test]
    fn test_build_requires_an_activity() {
        let err = RoutingSlipBuilder::default().build().unwrap_err();
        assert!(matches!(err, CourierError::EmptyItinerary));
    }

    #[test]
    fn test_build_preserves_order_and_identity() {
        let tracking_number = TrackingNumber::new();
        let mut builder = RoutingSlipBuilder::new(tracking_number);
        builder
            .add_activity_with_arguments("Test", address("execute_test"), &json!({ "Value": "Hello" }))
            .unwrap();
        builder.add_activity("SecondTest", address("execute_second_test"));
        builder.add_variable("Variable", "Knife").unwrap();
        builder.add_subscription(address("bus"), RoutingSlipEvents::ALL);

        let slip = builder.build().unwrap();
        assert_eq!(slip.tracking_number(), tracking_number);
        assert_eq!(slip.state(), RoutingSlipState::Pending);

        let names: Vec<_> = slip.itinerary().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["Test", "SecondTest"]);

        let first = slip.itinerary().front().unwrap();
        assert_eq!(first.arguments.get::<String>("Value").unwrap(), "Hello");
        assert!(slip.itinerary().iter().nth(1).unwrap().arguments.is_empty());

        assert_eq!(slip.variables().get::<String>("Variable").unwrap(), "Knife");
        assert_eq!(slip.subscriptions().len(), 1);
    }

    #[test]
    fn test_add_variable_last_write_wins() {
        let mut builder = RoutingSlipBuilder::default();
        builder.add_activity("Test", address("execute_test"));
        builder.add_variable("Variable", "Knife").unwrap();
        builder.add_variable("Variable", "Spoon").unwrap();

        let slip = builder.build().unwrap();
        assert_eq!(slip.variables().get::<String>("Variable").unwrap(), "Spoon");
        assert_eq!(slip.variables().len(), 1);
    }

    #[test]
    fn test_add_variables_from_object() {
        let mut builder = RoutingSlipBuilder::default();
        builder.add_activity("Test", address("execute_test"));
        builder
            .add_variables(&json!({ "Guest": "Ada", "Nights": 2 }))
            .unwrap();

        let slip = builder.build().unwrap();
        assert_eq!(slip.variables().get::<u32>("Nights").unwrap(), 2);
    }

    #[test]
    fn test_activity_subscription_carries_filter() {
        let mut builder = RoutingSlipBuilder::default();
        builder.add_activity("Test", address("execute_test"));
        builder.add_activity_subscription(
            address("observer"),
            RoutingSlipEvents::ACTIVITY_COMPLETED,
            "Test",
        );

        let slip = builder.build().unwrap();
        assert_eq!(slip.subscriptions()[0].activity_name.as_deref(), Some("Test"));
    }
}
