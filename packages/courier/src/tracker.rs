//! Routing slip tracking: a saga that follows lifecycle events.
//!
//! The engine feeds every event it receives into [`RoutingSlipTracker::observe`]
//! before re-broadcasting it, so the tracker sees terminal events even when
//! bus receivers lag. Callers register a tracking number before dispatching
//! the slip and then wait on it:
//!
//! ```ignore
//! tracker.register(slip.tracking_number());
//! handle.execute(slip).await?;
//! let instance = tracker.wait_for_terminal(tracking_number, Duration::from_secs(5)).await?;
//! assert_eq!(instance.state, RoutingSlipState::Completed);
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::core::TrackingNumber;
use crate::error::CourierError;
use crate::events::RoutingSlipEvent;
use crate::saga::{ExpressionCorrelation, InMemorySagaRepository, SagaFilter, SagaInstance};
use crate::state::RoutingSlipState;
use crate::variables::Variables;

/// What the tracker knows about one routing slip.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingSlipInstance {
    pub tracking_number: TrackingNumber,
    pub state: RoutingSlipState,
    /// Activities that completed, in completion order.
    pub completed: Vec<String>,
    /// Activities that were compensated, in compensation order.
    pub compensated: Vec<String>,
    /// The activity whose fault started compensation.
    pub faulted_activity: Option<String>,
    /// Variables as of the latest event.
    pub variables: Variables,
}

impl RoutingSlipInstance {
    pub fn new(tracking_number: TrackingNumber) -> Self {
        Self {
            tracking_number,
            state: RoutingSlipState::Pending,
            completed: Vec::new(),
            compensated: Vec::new(),
            faulted_activity: None,
            variables: Variables::new(),
        }
    }

    fn apply(&mut self, event: &RoutingSlipEvent) {
        // Terminal states are final; a straggler from another host cannot reopen one.
        if self.state.is_terminal() {
            return;
        }
        match event {
            RoutingSlipEvent::ActivityCompleted(e) => {
                self.completed.push(e.activity_name.clone());
                self.state = RoutingSlipState::Executing;
            }
            RoutingSlipEvent::ActivityFaulted(e) => {
                self.faulted_activity = Some(e.activity_name.clone());
                self.state = RoutingSlipState::Faulting;
            }
            RoutingSlipEvent::ActivityCompensated(e) => {
                self.compensated.push(e.activity_name.clone());
                self.state = RoutingSlipState::Compensating;
            }
            RoutingSlipEvent::ActivityCompensationFailed(_) => {}
            RoutingSlipEvent::Completed(_) => self.state = RoutingSlipState::Completed,
            RoutingSlipEvent::Faulted(_) => self.state = RoutingSlipState::Faulted,
            RoutingSlipEvent::CompensationFailed(_) => {
                self.state = RoutingSlipState::CompensationFailed
            }
        }
        self.variables = event.variables().clone();
    }
}

impl SagaInstance for RoutingSlipInstance {
    fn correlation_id(&self) -> Uuid {
        self.tracking_number.into()
    }
}

/// Follows routing slips through their events.
pub struct RoutingSlipTracker {
    repository: InMemorySagaRepository<RoutingSlipInstance>,
    correlation: ExpressionCorrelation<RoutingSlipInstance, RoutingSlipEvent>,
    waiters: DashMap<TrackingNumber, Arc<Notify>>,
}

impl RoutingSlipTracker {
    pub fn new() -> Self {
        Self {
            repository: InMemorySagaRepository::new(),
            correlation: ExpressionCorrelation::new(
                |instance: &RoutingSlipInstance, event: &RoutingSlipEvent| {
                    instance.tracking_number == event.tracking_number()
                },
            ),
            waiters: DashMap::new(),
        }
    }

    /// Start tracking a slip before it is dispatched.
    pub fn register(&self, tracking_number: TrackingNumber) {
        self.repository
            .insert_if_absent(RoutingSlipInstance::new(tracking_number));
        self.waiter(tracking_number);
    }

    /// Fold one event into its slip's instance.
    ///
    /// Events of slips that were never registered are ignored, so slips
    /// dispatched without awaiting leave nothing behind.
    pub fn observe(&self, event: &RoutingSlipEvent) {
        let tracking_number = event.tracking_number();

        let tracked = self
            .repository
            .update(tracking_number.into(), |instance| {
                if self.correlation.matches(instance, event) {
                    instance.apply(event);
                }
            })
            .is_some();
        if !tracked {
            return;
        }

        if event.is_terminal() {
            debug!(%tracking_number, event = %event.kind(), "tracked routing slip finished");
            if let Some(notify) = self.waiters.get(&tracking_number) {
                notify.notify_waiters();
            }
        }
    }

    pub fn get(&self, tracking_number: TrackingNumber) -> Option<RoutingSlipInstance> {
        self.repository.get(tracking_number.into())
    }

    /// Every tracked slip currently in `state`.
    pub fn in_state(&self, state: RoutingSlipState) -> Vec<RoutingSlipInstance> {
        let filter = SagaFilter::new(move |instance: &RoutingSlipInstance| {
            instance.state == state
        });
        self.repository.find(&filter)
    }

    /// Stop tracking a slip.
    pub fn forget(&self, tracking_number: TrackingNumber) -> Option<RoutingSlipInstance> {
        self.waiters.remove(&tracking_number);
        self.repository.remove(tracking_number.into())
    }

    pub fn len(&self) -> usize {
        self.repository.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repository.is_empty()
    }

    /// Wait until a registered slip reaches a terminal state.
    ///
    /// Returns `CourierError::Timeout` if it does not get there in time.
    pub async fn wait_for_terminal(
        &self,
        tracking_number: TrackingNumber,
        timeout: Duration,
    ) -> Result<RoutingSlipInstance, CourierError> {
        let notify = self.waiter(tracking_number);
        let wait = async {
            loop {
                // Register for notification BEFORE checking state
                let notified = notify.notified();

                if let Some(instance) = self.get(tracking_number) {
                    if instance.state.is_terminal() {
                        return instance;
                    }
                }

                notified.await;
            }
        };

        let result = tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| CourierError::Timeout { duration: timeout });
        // Keep the slot while another caller still waits on it.
        self.waiters.remove_if(&tracking_number, |_, slot| {
            Arc::ptr_eq(slot, &notify) && Arc::strong_count(slot) <= 2
        });
        result
    }

    fn waiter(&self, tracking_number: TrackingNumber) -> Arc<Notify> {
        self.waiters
            .entry(tracking_number)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}

impl Default for RoutingSlipTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RoutingSlipTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingSlipTracker")
            .field("tracked", &self.repository.len())
            .field("waiters", &self.waiters.len())
            .finish()
    }
}
