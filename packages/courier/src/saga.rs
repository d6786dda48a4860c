//! Saga correlation: matching incoming messages to stored instances.
//!
//! A correlation rule relates an instance to a message. Closing the rule over
//! one concrete message yields a [`SagaFilter`], a predicate over instances
//! that a repository can evaluate:
//!
//! ```ignore
//! let correlation = ExpressionCorrelation::new(
//!     |instance: &RoutingSlipInstance, event: &RoutingSlipEvent| {
//!         instance.tracking_number == event.tracking_number()
//!     },
//! );
//!
//! let filter = correlation.build_filter(&event);
//! let matches = repository.find(&filter);
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

// =============================================================================
// Filters
// =============================================================================

/// Predicate selecting saga instances.
pub struct SagaFilter<I> {
    predicate: Box<dyn Fn(&I) -> bool + Send + Sync>,
}

impl<I> SagaFilter<I> {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&I) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Box::new(predicate),
        }
    }

    pub fn matches(&self, instance: &I) -> bool {
        (self.predicate)(instance)
    }
}

impl<I> std::fmt::Debug for SagaFilter<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaFilter").finish_non_exhaustive()
    }
}

/// Builds the instance filter for one message.
pub trait CorrelationFilterFactory<I, M>: Send + Sync {
    fn build_filter(&self, message: &M) -> SagaFilter<I>;
}

/// Correlation from a rule over `(instance, message)`.
pub struct ExpressionCorrelation<I, M> {
    rule: Arc<dyn Fn(&I, &M) -> bool + Send + Sync>,
}

impl<I, M> ExpressionCorrelation<I, M> {
    pub fn new<F>(rule: F) -> Self
    where
        F: Fn(&I, &M) -> bool + Send + Sync + 'static,
    {
        Self {
            rule: Arc::new(rule),
        }
    }

    /// Evaluate the rule for one instance without building a filter.
    pub fn matches(&self, instance: &I, message: &M) -> bool {
        (self.rule)(instance, message)
    }
}

impl<I, M> Clone for ExpressionCorrelation<I, M> {
    fn clone(&self) -> Self {
        Self {
            rule: self.rule.clone(),
        }
    }
}

impl<I, M> CorrelationFilterFactory<I, M> for ExpressionCorrelation<I, M>
where
    I: 'static,
    M: Clone + Send + Sync + 'static,
{
    fn build_filter(&self, message: &M) -> SagaFilter<I> {
        let rule = self.rule.clone();
        let message = message.clone();
        SagaFilter::new(move |instance: &I| rule(instance, &message))
    }
}

impl<I, M> std::fmt::Debug for ExpressionCorrelation<I, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpressionCorrelation").finish_non_exhaustive()
    }
}

// =============================================================================
// Repository
// =============================================================================

/// A stored saga instance.
pub trait SagaInstance: Clone + Send + Sync + 'static {
    fn correlation_id(&self) -> Uuid;
}

/// Saga instances held in memory, keyed by correlation id.
pub struct InMemorySagaRepository<I: SagaInstance> {
    instances: DashMap<Uuid, I>,
}

impl<I: SagaInstance> InMemorySagaRepository<I> {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
        }
    }

    /// Store `instance`, returning the one it replaced.
    pub fn insert(&self, instance: I) -> Option<I> {
        self.instances.insert(instance.correlation_id(), instance)
    }

    /// Store `instance` unless one with the same id exists.
    pub fn insert_if_absent(&self, instance: I) -> bool {
        let mut inserted = false;
        self.instances
            .entry(instance.correlation_id())
            .or_insert_with(|| {
                inserted = true;
                instance
            });
        inserted
    }

    pub fn get(&self, id: Uuid) -> Option<I> {
        self.instances.get(&id).map(|entry| entry.value().clone())
    }

    /// Every instance the filter selects.
    pub fn find(&self, filter: &SagaFilter<I>) -> Vec<I> {
        self.instances
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Apply `update` to the instance with this id. Returns the updated copy.
    pub fn update<F>(&self, id: Uuid, update: F) -> Option<I>
    where
        F: FnOnce(&mut I),
    {
        let mut entry = self.instances.get_mut(&id)?;
        update(entry.value_mut());
        Some(entry.value().clone())
    }

    pub fn remove(&self, id: Uuid) -> Option<I> {
        self.instances.remove(&id).map(|(_, instance)| instance)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl<I: SagaInstance> Default for InMemorySagaRepository<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: SagaInstance> std::fmt::Debug for InMemorySagaRepository<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySagaRepository")
            .field("len", &self.instances.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Order {
        id: Uuid,
        customer: String,
        shipped: bool,
    }

    impl SagaInstance for Order {
        fn correlation_id(&self) -> Uuid {
            self.id
        }
    }

    #[derive(Clone)]
    struct OrderShipped {
        customer: String,
    }

    fn order(customer: &str) -> Order {
        Order {
            id: Uuid::new_v4(),
            customer: customer.into(),
            shipped: false,
        }
    }

    #[test]
    fn test_expression_correlation_closes_over_message() {
        let correlation = ExpressionCorrelation::new(|order: &Order, shipped: &OrderShipped| {
            order.customer == shipped.customer
        });

        let filter = correlation.build_filter(&OrderShipped {
            customer: "ada".into(),
        });
        assert!(filter.matches(&order("ada")));
        assert!(!filter.matches(&order("grace")));
    }

    #[test]
    fn test_repository_find_and_update() {
        let repository = InMemorySagaRepository::new();
        let ada = order("ada");
        repository.insert(ada.clone());
        repository.insert(order("grace"));

        let correlation = ExpressionCorrelation::new(|order: &Order, shipped: &OrderShipped| {
            order.customer == shipped.customer
        });
        let found = repository.find(&correlation.build_filter(&OrderShipped {
            customer: "ada".into(),
        }));
        assert_eq!(found, vec![ada.clone()]);

        let updated = repository.update(ada.id, |order| order.shipped = true).unwrap();
        assert!(updated.shipped);
        assert!(repository.get(ada.id).unwrap().shipped);
        assert_eq!(repository.len(), 2);
    }

    #[test]
    fn test_insert_if_absent_keeps_existing() {
        let repository = InMemorySagaRepository::new();
        let mut ada = order("ada");
        assert!(repository.insert_if_absent(ada.clone()));

        ada.shipped = true;
        assert!(!repository.insert_if_absent(ada.clone()));
        assert!(!repository.get(ada.id).unwrap().shipped);
    }

    #[test]
    fn test_update_and_remove_missing_instance() {
        let repository: InMemorySagaRepository<Order> = InMemorySagaRepository::default();
        assert!(repository.update(Uuid::new_v4(), |_| {}).is_none());
        assert!(repository.remove(Uuid::new_v4()).is_none());
        assert!(repository.is_empty());
    }
}
