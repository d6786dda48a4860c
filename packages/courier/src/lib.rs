//! # Courier
//!
//! A routing-slip execution engine: a message-borne itinerary of activities
//! runs front to back across independently hosted activities, and a fault
//! unwinds everything that completed, most recent first.
//!
//! ## Core Concepts
//!
//! - [`RoutingSlip`] = the whole saga, carried with the message: itinerary,
//!   activity log, variables, subscriptions
//! - [`ExecuteActivity`] / [`CompensateActivity`] = the work and its undo
//! - [`RoutingSlipEvent`] = facts published at every step; they never steer
//!   the slip
//!
//! ## Architecture
//!
//! ```text
//! RoutingSlipBuilder ─► build() ─► EngineHandle::execute()
//!                                        │
//!                                        ▼ forward (move)
//!                     ┌──────── execute_A ─► execute_B ─► execute_C ──┐
//!                     │             │            │          fault     │ done
//!                     │             ▼            ▼            │       ▼
//!                     │        ActivityLog  ActivityLog       │  RoutingSlipCompleted
//!                     │                                       ▼
//!                     │        compensate_A ◄── compensate_B ◄┘
//!                     │             │
//!                     │             ▼
//!                     │     RoutingSlipFaulted
//!                     │
//!                     └─► EventPublisher ─► subscriptions ─► bus address
//!                                                              │
//!                                           RoutingSlipTracker ◄┴► EventBus
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Linear** - Activities run strictly in itinerary order, one at a time
//! 2. **Exact LIFO unwind** - Only logged activities are compensated, most
//!    recent first, each at most once
//! 3. **Halting compensation** - A failed compensation stops the unwind and
//!    reports how many entries remain
//! 4. **Single writer** - A slip is owned by exactly one host at a time
//! 5. **Fatal routing** - A slip delivered to the wrong host is dead-lettered,
//!    never compensated
//!
//! ## Guarantees
//!
//! - **Ordered events**: events of one slip are published in step order
//! - **Fire-and-forget publication**: a failed publish never changes the slip
//! - **In-memory transport**: no durability, retry, or redelivery
//!
//! ## Example
//!
//! ```ignore
//! use courier::{EngineBuilder, RoutingSlipBuilder, RoutingSlipState};
//! use serde_json::json;
//!
//! let handle = EngineBuilder::new()
//!     .with_activity("Test", TestActivity)
//!     .with_activity("SecondTest", SecondTestActivity)
//!     .with_execute_activity("Faulty", FaultyActivity)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! let mut builder = RoutingSlipBuilder::default();
//! builder.add_activity_with_arguments("Test", handle.execute_address("Test")?, &json!({ "Value": "Hello" }))?;
//! builder.add_activity("SecondTest", handle.execute_address("SecondTest")?);
//! builder.add_activity("Faulty", handle.execute_address("Faulty")?);
//! builder.add_variable("Variable", "Knife")?;
//!
//! let instance = handle.execute_and_await(builder.build()?).await?;
//! assert_eq!(instance.state, RoutingSlipState::Faulted);
//! assert_eq!(instance.compensated, vec!["SecondTest", "Test"]);
//! ```

// Core modules
mod activity;
mod activity_log;
mod builder;
mod bus;
mod compensate;
mod config;
mod core;
mod engine;
mod error;
mod events;
mod execute;
mod host;
mod itinerary;
mod publisher;
mod registry;
mod result;
mod slip;
mod state;
mod subscription;
mod variables;

// Messaging seams
pub mod pipe;
pub mod transport;

// Saga correlation
pub mod saga;
mod tracker;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;


// Re-export core types
pub use crate::core::{Address, ExecutionId, TrackingNumber};

// Re-export routing slip types
pub use activity_log::{ActivityLog, ActivityLogEntry};
pub use builder::RoutingSlipBuilder;
pub use itinerary::{Activity, Itinerary, ItineraryRevision};
pub use slip::RoutingSlip;
pub use state::RoutingSlipState;
pub use subscription::{EventKind, RoutingSlipEvents, Subscription};
pub use variables::Variables;

// Re-export activity types
pub use activity::{CompensateActivity, CompensateContext, ExecuteActivity, ExecuteContext};
pub use registry::{ActivityDefinition, ActivityRegistry};
pub use result::{CompensationResult, ExecutionResult};

// Re-export error types
pub use crate::error::{ActivityException, CourierError, ExceptionInfo, FaultKind};

// Re-export event types
pub use events::{
    RoutingSlipActivityCompensated, RoutingSlipActivityCompensationFailed,
    RoutingSlipActivityCompleted, RoutingSlipActivityFaulted, RoutingSlipCompensationFailed,
    RoutingSlipCompleted, RoutingSlipEvent, RoutingSlipFaulted,
};

// Re-export bus types
pub use bus::{EventBus, SlipEvents};

// Re-export messaging types
pub use pipe::{Filter, MessageKind, Next, Pipe, PipeConfigurator, SendContext};
pub use transport::{DeadLetter, Envelope, InMemoryTransport, ReceiveEndpoint, Transport};

// Re-export tracking types
pub use saga::{
    CorrelationFilterFactory, ExpressionCorrelation, InMemorySagaRepository, SagaFilter,
    SagaInstance,
};
pub use tracker::{RoutingSlipInstance, RoutingSlipTracker};

// Re-export engine types (primary entry point)
pub use config::Config;
pub use engine::{Engine, EngineBuilder, EngineHandle};

// Re-export commonly used external types
pub use async_trait::async_trait;
