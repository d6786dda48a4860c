//! Activity traits and the contexts they run with.
//!
//! Activities are the units of work a routing slip visits. Each activity has
//! an execute half and, optionally, a compensate half that undoes it.
//!
//! # Key Properties
//!
//! - **Typed arguments**: the host merges the slip's variables with the
//!   itinerary entry's arguments (entry wins) and deserializes the result into
//!   `Arguments`
//! - **Opaque log**: whatever an activity returns as its compensation log is
//!   stored on the slip and handed back, deserialized into `Log`, on undo
//! - **No escaping errors**: `Err`, panics, and bad arguments all become
//!   `Faulted`
//!
//! # Example
//!
//! ```ignore
//! pub struct ReserveRoom;
//!
//! #[async_trait]
//! impl ExecuteActivity for ReserveRoom {
//!     type Arguments = ReserveRoomArguments;
//!
//!     async fn execute(&self, ctx: ExecuteContext<ReserveRoomArguments>) -> Result<ExecutionResult> {
//!         let reservation_id = hotel::reserve(&ctx.arguments().room).await?;
//!         Ok(ctx.completed_with_log(&ReserveRoomLog { reservation_id })?)
//!     }
//! }
//!
//! #[async_trait]
//! impl CompensateActivity for ReserveRoom {
//!     type Log = ReserveRoomLog;
//!
//!     async fn compensate(&self, ctx: CompensateContext<ReserveRoomLog>) -> Result<CompensationResult> {
//!         hotel::cancel(ctx.log().reservation_id).await?;
//!         Ok(ctx.compensated())
//!     }
//! }
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::core::{Address, ExecutionId, TrackingNumber};
use crate::error::CourierError;
use crate::itinerary::{Activity, ItineraryRevision};
use crate::result::{CompensationResult, ExecutionResult};
use crate::variables::Variables;

// =============================================================================
// Activity Traits
// =============================================================================

/// The forward half of an activity.
#[async_trait]
pub trait ExecuteActivity: Send + Sync + 'static {
    /// Arguments, deserialized from variables merged with entry arguments.
    type Arguments: DeserializeOwned + Send + 'static;

    async fn execute(&self, ctx: ExecuteContext<Self::Arguments>) -> Result<ExecutionResult>;
}

/// The undo half of an activity.
#[async_trait]
pub trait CompensateActivity: Send + Sync + 'static {
    /// Compensation data, as returned by `execute`.
    type Log: DeserializeOwned + Send + 'static;

    async fn compensate(&self, ctx: CompensateContext<Self::Log>) -> Result<CompensationResult>;
}

// =============================================================================
// Execute Context
// =============================================================================

/// Everything an activity sees while executing.
pub struct ExecuteContext<A> {
    arguments: A,
    tracking_number: TrackingNumber,
    execution_id: ExecutionId,
    activity_name: String,
    host: Address,
    variables: Variables,
    timestamp: DateTime<Utc>,
}

impl<A> ExecuteContext<A> {
    pub fn arguments(&self) -> &A {
        &self.arguments
    }

    pub fn into_arguments(self) -> A {
        self.arguments
    }

    pub fn tracking_number(&self) -> TrackingNumber {
        self.tracking_number
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    /// Execute address of this host.
    pub fn host(&self) -> &Address {
        &self.host
    }

    /// The slip's variables as they stood when this activity started.
    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn get_variable<T: DeserializeOwned>(&self, name: &str) -> Result<T, CourierError> {
        self.variables.get(name)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Completed, with nothing to undo.
    pub fn completed(&self) -> ExecutionResult {
        ExecutionResult::Completed {
            log: None,
            variables: Variables::new(),
            itinerary: ItineraryRevision::Unchanged,
        }
    }

    /// Completed, storing `log` for compensation.
    pub fn completed_with_log<L: Serialize>(&self, log: &L) -> Result<ExecutionResult, CourierError> {
        Ok(ExecutionResult::Completed {
            log: Some(serde_json::to_value(log)?),
            variables: Variables::new(),
            itinerary: ItineraryRevision::Unchanged,
        })
    }

    /// Completed, storing `log` and merging `variables` into the slip.
    pub fn completed_with_variables<L: Serialize, V: Serialize>(
        &self,
        log: &L,
        variables: &V,
    ) -> Result<ExecutionResult, CourierError> {
        Ok(ExecutionResult::Completed {
            log: Some(serde_json::to_value(log)?),
            variables: Variables::from_object(variables)?,
            itinerary: ItineraryRevision::Unchanged,
        })
    }

    /// Completed, appending `activities` after the remaining itinerary.
    pub fn revise_itinerary<L: Serialize>(
        &self,
        log: &L,
        activities: Vec<Activity>,
    ) -> Result<ExecutionResult, CourierError> {
        Ok(ExecutionResult::Completed {
            log: Some(serde_json::to_value(log)?),
            variables: Variables::new(),
            itinerary: ItineraryRevision::Append(activities),
        })
    }

    /// Completed, replacing the remaining itinerary with `activities`.
    pub fn replace_itinerary<L: Serialize>(
        &self,
        log: &L,
        activities: Vec<Activity>,
    ) -> Result<ExecutionResult, CourierError> {
        Ok(ExecutionResult::Completed {
            log: Some(serde_json::to_value(log)?),
            variables: Variables::new(),
            itinerary: ItineraryRevision::Replace(activities),
        })
    }

    /// Completed, and the slip ends here successfully.
    pub fn terminate<L: Serialize>(&self, log: &L) -> Result<ExecutionResult, CourierError> {
        self.replace_itinerary(log, Vec::new())
    }

    pub fn faulted(&self, error: impl Into<anyhow::Error>) -> ExecutionResult {
        ExecutionResult::Faulted(error.into())
    }
}

// =============================================================================
// Compensate Context
// =============================================================================

/// Everything an activity sees while compensating.
pub struct CompensateContext<L> {
    log: L,
    tracking_number: TrackingNumber,
    execution_id: ExecutionId,
    activity_name: String,
    variables: Variables,
    timestamp: DateTime<Utc>,
}

impl<L> CompensateContext<L> {
    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn into_log(self) -> L {
        self.log
    }

    pub fn tracking_number(&self) -> TrackingNumber {
        self.tracking_number
    }

    /// Execution id of the run being undone.
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn get_variable<T: DeserializeOwned>(&self, name: &str) -> Result<T, CourierError> {
        self.variables.get(name)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn compensated(&self) -> CompensationResult {
        CompensationResult::Compensated {
            variables: Variables::new(),
        }
    }

    pub fn compensated_with_variables<V: Serialize>(
        &self,
        variables: &V,
    ) -> Result<CompensationResult, CourierError> {
        Ok(CompensationResult::Compensated {
            variables: Variables::from_object(variables)?,
        })
    }

    pub fn failed(&self, error: impl Into<anyhow::Error>) -> CompensationResult {
        CompensationResult::Failed(error.into())
    }
}

// =============================================================================
// Type-Erased Activities
// =============================================================================

/// Untyped input for one execution, assembled by the execute host.
pub(crate) struct ExecuteInput {
    pub tracking_number: TrackingNumber,
    pub execution_id: ExecutionId,
    pub activity_name: String,
    pub host: Address,
    /// Variables merged with the entry's arguments.
    pub arguments: Variables,
    pub variables: Variables,
}

/// Untyped input for one compensation, assembled by the compensate host.
pub(crate) struct CompensateInput {
    pub tracking_number: TrackingNumber,
    pub execution_id: ExecutionId,
    pub activity_name: String,
    pub log: Value,
    pub variables: Variables,
}

/// Execute half with its argument type erased.
///
/// Never fails: every error path is folded into `ExecutionResult::Faulted`.
#[async_trait]
pub(crate) trait AnyExecuteActivity: Send + Sync {
    async fn execute_any(&self, input: ExecuteInput) -> ExecutionResult;
}

/// Compensate half with its log type erased.
#[async_trait]
pub(crate) trait AnyCompensateActivity: Send + Sync {
    async fn compensate_any(&self, input: CompensateInput) -> CompensationResult;
}

/// Wrapper to make concrete execute activities implement `AnyExecuteActivity`.
pub(crate) struct ExecuteWrapper<A> {
    activity: Arc<A>,
}

impl<A> ExecuteWrapper<A> {
    pub fn new(activity: Arc<A>) -> Self {
        Self { activity }
    }
}

#[async_trait]
impl<A: ExecuteActivity> AnyExecuteActivity for ExecuteWrapper<A> {
    async fn execute_any(&self, input: ExecuteInput) -> ExecutionResult {
        let arguments = match serde_json::from_value::<A::Arguments>(input.arguments.to_json()) {
            Ok(arguments) => arguments,
            Err(source) => {
                return ExecutionResult::Faulted(
                    CourierError::ArgumentDeserialization {
                        activity: input.activity_name,
                        source,
                    }
                    .into(),
                )
            }
        };

        let activity_name = input.activity_name.clone();
        let ctx = ExecuteContext {
            arguments,
            tracking_number: input.tracking_number,
            execution_id: input.execution_id,
            activity_name: input.activity_name,
            host: input.host,
            variables: input.variables,
            timestamp: Utc::now(),
        };

        // AssertUnwindSafe is required because the activity and ctx are not UnwindSafe
        let result = AssertUnwindSafe(self.activity.execute(ctx))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => ExecutionResult::Faulted(e),
            Err(panic_info) => {
                let message = extract_panic_message(&panic_info);
                error!(
                    tracking_number = %input.tracking_number,
                    activity = %activity_name,
                    panic = %message,
                    "activity panicked during execute"
                );
                ExecutionResult::Faulted(
                    CourierError::ActivityPanicked {
                        activity: activity_name,
                        message,
                    }
                    .into(),
                )
            }
        }
    }
}

/// Wrapper to make concrete compensate activities implement `AnyCompensateActivity`.
pub(crate) struct CompensateWrapper<A> {
    activity: Arc<A>,
}

impl<A> CompensateWrapper<A> {
    pub fn new(activity: Arc<A>) -> Self {
        Self { activity }
    }
}

#[async_trait]
impl<A: CompensateActivity> AnyCompensateActivity for CompensateWrapper<A> {
    async fn compensate_any(&self, input: CompensateInput) -> CompensationResult {
        let log = match serde_json::from_value::<A::Log>(input.log) {
            Ok(log) => log,
            Err(source) => {
                return CompensationResult::Failed(
                    CourierError::LogDeserialization {
                        activity: input.activity_name,
                        source,
                    }
                    .into(),
                )
            }
        };

        let activity_name = input.activity_name.clone();
        let ctx = CompensateContext {
            log,
            tracking_number: input.tracking_number,
            execution_id: input.execution_id,
            activity_name: input.activity_name,
            variables: input.variables,
            timestamp: Utc::now(),
        };

        let result = AssertUnwindSafe(self.activity.compensate(ctx))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => CompensationResult::Failed(e),
            Err(panic_info) => {
                let message = extract_panic_message(&panic_info);
                error!(
                    tracking_number = %input.tracking_number,
                    activity = %activity_name,
                    panic = %message,
                    "activity panicked during compensate"
                );
                CompensationResult::Failed(
                    CourierError::ActivityPanicked {
                        activity: activity_name,
                        message,
                    }
                    .into(),
                )
            }
        }
    }
}

/// Extract a human-readable message from a panic payload.
fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
