//! Testing utilities for courier activities and routing slips.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! courier = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Reference Activities
//!
//! `TestActivity` and `SecondTestActivity` log the `Value` argument as
//! `OriginalValue`; `FaultyActivity` always faults. Together they reproduce
//! the classic faulting slip:
//!
//! ```ignore
//! let engine = EngineBuilder::new()
//!     .with_activity("Test", TestActivity)
//!     .with_activity("SecondTest", SecondTestActivity)
//!     .with_execute_activity("Faulty", FaultyActivity)
//!     .build()?;
//! ```
//!
//! # Scripted Activities
//!
//! ```ignore
//! let calls = CallLog::new();
//! let engine = EngineBuilder::new()
//!     .with_activity("A", ScriptedActivity::new("A", &calls))
//!     .with_activity("B", ScriptedActivity::new("B", &calls).failing_compensation())
//!     .with_activity("C", ScriptedActivity::new("C", &calls).faulting())
//!     .build()?;
//!
//! // ... run a slip A, B, C ...
//! assert_eq!(calls.compensated(), vec!["B"]);
//! ```
//!
//! # Collecting Events
//!
//! ```ignore
//! let collector = EventCollector::connect(transport.as_ref(), observer_address).await?;
//! let faulted = collector
//!     .wait_for(|event| event.kind() == EventKind::Faulted, Duration::from_secs(5))
//!     .await?;
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::activity::{CompensateActivity, CompensateContext, ExecuteActivity, ExecuteContext};
use crate::core::{Address, TrackingNumber};
use crate::error::CourierError;
use crate::events::RoutingSlipEvent;
use crate::itinerary::{Activity, ItineraryRevision};
use crate::result::{CompensationResult, ExecutionResult};
use crate::transport::Transport;
use crate::variables::Variables;

// =============================================================================
// Reference Activities
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestArguments {
    #[serde(rename = "Value", default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestLog {
    #[serde(rename = "OriginalValue")]
    pub original_value: Option<String>,
}

/// Completes, logging its `Value` argument. Compensation always succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestActivity;

#[async_trait]
impl ExecuteActivity for TestActivity {
    type Arguments = TestArguments;

    async fn execute(&self, ctx: ExecuteContext<TestArguments>) -> Result<ExecutionResult> {
        let log = TestLog {
            original_value: ctx.arguments().value.clone(),
        };
        Ok(ctx.completed_with_log(&log)?)
    }
}

#[async_trait]
impl CompensateActivity for TestActivity {
    type Log = TestLog;

    async fn compensate(&self, ctx: CompensateContext<TestLog>) -> Result<CompensationResult> {
        Ok(ctx.compensated())
    }
}

/// Same contract as [`TestActivity`], hosted under a second name.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecondTestActivity;

#[async_trait]
impl ExecuteActivity for SecondTestActivity {
    type Arguments = TestArguments;

    async fn execute(&self, ctx: ExecuteContext<TestArguments>) -> Result<ExecutionResult> {
        let log = TestLog {
            original_value: ctx.arguments().value.clone(),
        };
        Ok(ctx.completed_with_log(&log)?)
    }
}

#[async_trait]
impl CompensateActivity for SecondTestActivity {
    type Log = TestLog;

    async fn compensate(&self, ctx: CompensateContext<TestLog>) -> Result<CompensationResult> {
        Ok(ctx.compensated())
    }
}

/// Always faults.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultyActivity;

#[async_trait]
impl ExecuteActivity for FaultyActivity {
    type Arguments = Value;

    async fn execute(&self, _ctx: ExecuteContext<Value>) -> Result<ExecutionResult> {
        Err(anyhow!("The FaultyActivity, well, faulted."))
    }
}

// =============================================================================
// Call Log
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Execute,
    Compensate,
}

/// One call a [`ScriptedActivity`] received.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub kind: CallKind,
    pub activity: String,
    pub tracking_number: TrackingNumber,
    /// Slip variables as the activity saw them.
    pub variables: Variables,
}

/// Shared record of activity calls, in the order they happened.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: Call) {
        match self.calls.lock() {
            Ok(mut guard) => guard.push(call),
            Err(poisoned) => poisoned.into_inner().push(call),
        }
    }

    /// Snapshot of every call so far.
    pub fn calls(&self) -> Vec<Call> {
        match self.calls.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Calls made for one routing slip.
    pub fn for_slip(&self, tracking_number: TrackingNumber) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| call.tracking_number == tracking_number)
            .collect()
    }

    /// Names of executed activities, in call order.
    pub fn executed(&self) -> Vec<String> {
        self.names(CallKind::Execute)
    }

    /// Names of compensated activities, in call order.
    pub fn compensated(&self) -> Vec<String> {
        self.names(CallKind::Compensate)
    }

    pub fn len(&self) -> usize {
        self.calls().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn names(&self, kind: CallKind) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.kind == kind)
            .map(|call| call.activity)
            .collect()
    }
}

// =============================================================================
// Scripted Activity
// =============================================================================

/// An activity whose behavior is configured per test.
///
/// By default it completes with a log naming itself and compensates
/// successfully, recording every call in its [`CallLog`].
#[derive(Debug, Clone)]
pub struct ScriptedActivity {
    name: String,
    calls: CallLog,
    fault_on_execute: bool,
    fail_compensation: bool,
    delay: Option<Duration>,
    variables: Variables,
    append: Vec<Activity>,
}

impl ScriptedActivity {
    pub fn new(name: impl Into<String>, calls: &CallLog) -> Self {
        Self {
            name: name.into(),
            calls: calls.clone(),
            fault_on_execute: false,
            fail_compensation: false,
            delay: None,
            variables: Variables::new(),
            append: Vec::new(),
        }
    }

    /// Fault on execute.
    pub fn faulting(mut self) -> Self {
        self.fault_on_execute = true;
        self
    }

    /// Fail on compensate.
    pub fn failing_compensation(mut self) -> Self {
        self.fail_compensation = true;
        self
    }

    /// Sleep before executing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Merge `name = value` into the slip on completion.
    pub fn setting_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.set_value(name, value);
        self
    }

    /// Append `activity` to the itinerary on completion.
    pub fn appending(mut self, activity: Activity) -> Self {
        self.append.push(activity);
        self
    }

    fn record(&self, kind: CallKind, tracking_number: TrackingNumber, variables: &Variables) {
        self.calls.record(Call {
            kind,
            activity: self.name.clone(),
            tracking_number,
            variables: variables.clone(),
        });
    }
}

#[async_trait]
impl ExecuteActivity for ScriptedActivity {
    type Arguments = Value;

    async fn execute(&self, ctx: ExecuteContext<Value>) -> Result<ExecutionResult> {
        self.record(CallKind::Execute, ctx.tracking_number(), ctx.variables());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fault_on_execute {
            return Ok(ctx.faulted(anyhow!("{} faulted", self.name)));
        }

        let itinerary = if self.append.is_empty() {
            ItineraryRevision::Unchanged
        } else {
            ItineraryRevision::Append(self.append.clone())
        };
        Ok(ExecutionResult::Completed {
            log: Some(json!({
                "activity": self.name,
                "execution_id": ctx.execution_id(),
            })),
            variables: self.variables.clone(),
            itinerary,
        })
    }
}

#[async_trait]
impl CompensateActivity for ScriptedActivity {
    type Log = Value;

    async fn compensate(&self, ctx: CompensateContext<Value>) -> Result<CompensationResult> {
        self.record(CallKind::Compensate, ctx.tracking_number(), ctx.variables());
        if self.fail_compensation {
            return Ok(ctx.failed(anyhow!("{} could not be undone", self.name)));
        }
        Ok(ctx.compensated())
    }
}

// =============================================================================
// Event Collector
// =============================================================================

/// Receives routing slip events at an address and lets tests await them.
///
/// The receive loop stops when the collector is dropped.
pub struct EventCollector {
    address: Address,
    events: Arc<Mutex<Vec<RoutingSlipEvent>>>,
    notify: Arc<Notify>,
    task: JoinHandle<()>,
}

impl EventCollector {
    /// Connect at `address` and start collecting.
    pub async fn connect(transport: &dyn Transport, address: Address) -> Result<Self, CourierError> {
        let mut endpoint = transport.connect(&address).await?;
        let events = Arc::new(Mutex::new(Vec::new()));
        let notify = Arc::new(Notify::new());

        let task = {
            let events = events.clone();
            let notify = notify.clone();
            tokio::spawn(async move {
                while let Some(envelope) = endpoint.recv().await {
                    let Ok(event) = RoutingSlipEvent::from_bytes(&envelope.body) else {
                        continue;
                    };
                    match events.lock() {
                        Ok(mut guard) => guard.push(event),
                        Err(poisoned) => poisoned.into_inner().push(event),
                    }
                    notify.notify_waiters();
                }
            })
        };

        Ok(Self {
            address,
            events,
            notify,
            task,
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Snapshot of every event received so far, in arrival order.
    pub fn events(&self) -> Vec<RoutingSlipEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Events of one routing slip, in arrival order.
    pub fn events_for(&self, tracking_number: TrackingNumber) -> Vec<RoutingSlipEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.tracking_number() == tracking_number)
            .collect()
    }

    /// Wait for the first event matching `predicate`.
    pub async fn wait_for<F>(
        &self,
        predicate: F,
        timeout: Duration,
    ) -> Result<RoutingSlipEvent, CourierError>
    where
        F: Fn(&RoutingSlipEvent) -> bool,
    {
        let wait = async {
            loop {
                // Register for notification BEFORE checking events
                let notified = self.notify.notified();

                if let Some(event) = self.events().into_iter().find(|event| predicate(event)) {
                    return event;
                }

                notified.await;
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| CourierError::Timeout { duration: timeout })
    }

    /// Wait for the terminal event of one routing slip.
    pub async fn wait_for_terminal(
        &self,
        tracking_number: TrackingNumber,
        timeout: Duration,
    ) -> Result<RoutingSlipEvent, CourierError> {
        self.wait_for(
            |event| event.tracking_number() == tracking_number && event.is_terminal(),
            timeout,
        )
        .await
    }
}

impl Drop for EventCollector {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for EventCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCollector")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;

    #[test]
    fn test_call_log_separates_kinds() {
        let calls = CallLog::new();
        let tracking_number = TrackingNumber::new();
        let activity = ScriptedActivity::new("A", &calls);
        activity.record(CallKind::Execute, tracking_number, &Variables::new());
        activity.record(CallKind::Compensate, tracking_number, &Variables::new());

        assert_eq!(calls.executed(), vec!["A"]);
        assert_eq!(calls.compensated(), vec!["A"]);
        assert_eq!(calls.for_slip(tracking_number).len(), 2);
        assert!(calls.for_slip(TrackingNumber::new()).is_empty());
    }

    #[tokio::test]
    async fn test_collector_times_out_without_events() {
        let transport = InMemoryTransport::new();
        let address = Address::parse("loopback://localhost/observer").unwrap();
        let collector = EventCollector::connect(&transport, address).await.unwrap();

        let err = collector
            .wait_for(|_| true, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::Timeout { .. }));
        assert!(collector.events().is_empty());
    }
}
