//! Courier Engine - hosts activities and routes slips between them.
//!
//! ```text
//! execute(slip) ─► [execute_A] ─► [execute_B] ─► ... ─► RoutingSlipCompleted
//!                                     │ fault
//!                                     ▼
//!                  [compensate_A] ◄─ Faulting ─► ... ─► RoutingSlipFaulted
//!
//! every step ─► EventPublisher ─► subscriptions / publish channel
//!                                     │
//!                                     ▼
//!                     bus address ─► RoutingSlipTracker ─► EventBus
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use courier::{EngineBuilder, RoutingSlipBuilder};
//!
//! let engine = EngineBuilder::new()
//!     .with_activity("Reserve", ReserveActivity)
//!     .with_execute_activity("Notify", NotifyActivity)
//!     .build()?;
//!
//! // Connect every host and start the event pump
//! let handle = engine.start().await?;
//!
//! let mut builder = RoutingSlipBuilder::default();
//! builder.add_activity("Reserve", handle.execute_address("Reserve")?);
//! builder.add_activity("Notify", handle.execute_address("Notify")?);
//!
//! // Dispatch and wait for the terminal event
//! let instance = handle.execute_and_await(builder.build()?).await?;
//! ```
//!
//! # Correlation and Await
//!
//! The tracking number is the correlation id. `execute_and_await` registers
//! the slip with the [`RoutingSlipTracker`] BEFORE dispatching it, then waits
//! until the tracker has folded in a terminal event. The tracker is fed by the
//! event pump itself, so a lagging [`EventBus`] receiver never hides the
//! outcome.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity::{CompensateActivity, ExecuteActivity};
use crate::bus::EventBus;
use crate::config::Config;
use crate::core::Address;
use crate::error::CourierError;
use crate::events::RoutingSlipEvent;
use crate::host::{spawn_host, ForwardError, HostRole, HostServices};
use crate::pipe::{MessageKind, Pipe, PipeConfigurator};
use crate::publisher::EventPublisher;
use crate::registry::{ActivityDefinition, ActivityRegistry};
use crate::slip::RoutingSlip;
use crate::state::RoutingSlipState;
use crate::subscription::{EventKind, RoutingSlipEvents};
use crate::tracker::{RoutingSlipInstance, RoutingSlipTracker};
use crate::transport::{Envelope, InMemoryTransport, ReceiveEndpoint, Transport};

// =============================================================================
// Engine
// =============================================================================

/// A configured engine that has not connected to its transport yet.
///
/// Use [`EngineBuilder`] to construct one, then [`Engine::start`] it.
pub struct Engine {
    config: Config,
    registry: Arc<ActivityRegistry>,
    transport: Arc<dyn Transport>,
    pipe: Pipe,
    bus: EventBus,
    tracker: Arc<RoutingSlipTracker>,
    bus_address: Address,
    publish_address: Address,
}

impl Engine {
    /// Create a new engine builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Address this engine receives events at.
    pub fn bus_address(&self) -> &Address {
        &self.bus_address
    }

    /// Connect every host and start processing.
    ///
    /// All endpoints are connected before any task starts, so a failed
    /// connection leaves nothing running.
    pub async fn start(self) -> Result<EngineHandle, CourierError> {
        info!(
            activities = self.registry.len(),
            bus_address = %self.bus_address,
            "starting courier engine"
        );

        let mut hosts: Vec<(HostRole, Arc<ActivityDefinition>, ReceiveEndpoint)> = Vec::new();
        for definition in self.registry.iter() {
            let endpoint = self.transport.connect(definition.execute_address()).await?;
            hosts.push((HostRole::Execute, definition.clone(), endpoint));
            if let Some(address) = definition.compensate_address() {
                let endpoint = self.transport.connect(address).await?;
                hosts.push((HostRole::Compensate, definition.clone(), endpoint));
            }
        }
        let bus_endpoint = self.transport.connect(&self.bus_address).await?;
        let published = self.transport.subscribe();

        let (publisher, publisher_task) = EventPublisher::spawn(
            self.transport.clone(),
            self.pipe.clone(),
            self.bus_address.clone(),
            self.publish_address.clone(),
        );
        let services = Arc::new(HostServices {
            transport: self.transport.clone(),
            pipe: self.pipe,
            publisher,
            concurrency: self.config.host_concurrency,
        });

        let mut tasks = vec![publisher_task];
        tasks.push(tokio::spawn(pump_events(
            bus_endpoint,
            published,
            self.tracker.clone(),
            self.bus.clone(),
        )));
        for (role, definition, endpoint) in hosts {
            tasks.push(spawn_host(role, definition, endpoint, services.clone()));
        }

        Ok(EngineHandle {
            registry: self.registry,
            services,
            bus: self.bus,
            tracker: self.tracker,
            bus_address: self.bus_address,
            await_timeout: self.config.await_timeout,
            tasks,
        })
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("bus_address", &self.bus_address)
            .finish_non_exhaustive()
    }
}

/// Feed every event this engine receives into the tracker, then the bus.
async fn pump_events(
    mut endpoint: ReceiveEndpoint,
    mut published: broadcast::Receiver<Envelope>,
    tracker: Arc<RoutingSlipTracker>,
    bus: EventBus,
) {
    let mut published_open = true;
    loop {
        tokio::select! {
            received = endpoint.recv() => match received {
                Some(envelope) => deliver_event(&envelope, &tracker, &bus),
                None => {
                    info!("bus endpoint closed, event pump shutting down");
                    break;
                }
            },
            received = published.recv(), if published_open => match received {
                Ok(envelope) => deliver_event(&envelope, &tracker, &bus),
                Err(RecvError::Lagged(n)) => {
                    warn!(missed = n, "publish channel lagged, missed events");
                }
                Err(RecvError::Closed) => {
                    info!("publish channel closed");
                    published_open = false;
                }
            },
        }
    }

    info!("courier event pump stopped");
}

fn deliver_event(envelope: &Envelope, tracker: &RoutingSlipTracker, bus: &EventBus) {
    match RoutingSlipEvent::from_bytes(&envelope.body) {
        Ok(event) => {
            tracker.observe(&event);
            bus.emit(event);
        }
        Err(e) => warn!(
            message_id = %envelope.context.message_id,
            error = %e,
            "failed to decode routing slip event"
        ),
    }
}

// =============================================================================
// Engine Handle
// =============================================================================

/// Handle to a running engine.
///
/// # Fire-and-Forget vs Await
///
/// - `execute()`: Dispatches the slip and returns once the first host has it.
/// - `execute_and_await()`: Waits for the slip's terminal event.
pub struct EngineHandle {
    registry: Arc<ActivityRegistry>,
    services: Arc<HostServices>,
    bus: EventBus,
    tracker: Arc<RoutingSlipTracker>,
    bus_address: Address,
    await_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Get the event bus for observing routing slip events in-process.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn tracker(&self) -> &Arc<RoutingSlipTracker> {
        &self.tracker
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.services.transport
    }

    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    /// Address this engine receives events at. Subscribe a slip here to have
    /// the engine track it.
    pub fn bus_address(&self) -> &Address {
        &self.bus_address
    }

    pub fn activity(&self, name: &str) -> Option<&Arc<ActivityDefinition>> {
        self.registry.get(name)
    }

    /// Execute address of a registered activity.
    pub fn execute_address(&self, name: &str) -> Result<Address, CourierError> {
        Ok(self.registry.require(name)?.execute_address().clone())
    }

    /// Dispatch a built slip to its first activity.
    ///
    /// The slip is moved: once this returns `Ok` the hosts own it.
    pub async fn execute(&self, mut slip: RoutingSlip) -> Result<()> {
        let first = slip
            .itinerary()
            .front()
            .map(|activity| activity.address.clone())
            .ok_or(CourierError::EmptyItinerary)?;
        slip.transition(RoutingSlipState::Executing)?;

        info!(
            tracking_number = %slip.tracking_number(),
            activities = slip.itinerary().len(),
            "executing routing slip"
        );
        self.services
            .forward(slip, &first, MessageKind::Execute, Some(&self.bus_address))
            .await
            .map_err(|ForwardError { error, .. }| error)
    }

    /// Dispatch a slip and wait for it to complete, fault, or fail
    /// compensation.
    ///
    /// Uses the configured await timeout (30 seconds by default).
    pub async fn execute_and_await(&self, slip: RoutingSlip) -> Result<RoutingSlipInstance> {
        self.execute_and_await_timeout(slip, self.await_timeout)
            .await
    }

    /// Dispatch a slip and wait for its terminal event, with custom timeout.
    ///
    /// # Returns
    ///
    /// - `Ok(instance)` once the slip reached a terminal state. A faulted slip
    ///   is still `Ok`: inspect `instance.state`
    /// - `Err` if dispatch failed, the engine cannot observe the slip's
    ///   terminal events, or the timeout was reached
    pub async fn execute_and_await_timeout(
        &self,
        slip: RoutingSlip,
        timeout: Duration,
    ) -> Result<RoutingSlipInstance> {
        let tracking_number = slip.tracking_number();
        if !self.observes_terminal_events(&slip) {
            return Err(CourierError::UntrackedRoutingSlip { tracking_number }.into());
        }

        // Register BEFORE dispatching so a fast slip cannot finish unseen
        self.tracker.register(tracking_number);

        if let Err(e) = self.execute(slip).await {
            self.tracker.forget(tracking_number);
            return Err(e);
        }

        let result = self.tracker.wait_for_terminal(tracking_number, timeout).await;
        self.tracker.forget(tracking_number);
        debug!(%tracking_number, ok = result.is_ok(), "await finished");
        Ok(result?)
    }

    /// Abort every task of the engine.
    ///
    /// Call this during test teardown to release resources held by the engine.
    /// Hosts abort their in-flight steps with them, so slips in flight are
    /// dropped.
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Slips without subscriptions are broadcast, which the engine observes.
    /// Otherwise the bus address must be subscribed to every terminal event.
    fn observes_terminal_events(&self, slip: &RoutingSlip) -> bool {
        if slip.subscriptions().is_empty() {
            return true;
        }

        let mut events = RoutingSlipEvents::NONE;
        for subscription in slip.subscriptions() {
            if subscription.address == self.bus_address {
                events |= subscription.events;
            }
        }
        [
            EventKind::Completed,
            EventKind::Faulted,
            EventKind::CompensationFailed,
        ]
        .into_iter()
        .all(|kind| events.contains(kind))
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("bus_address", &self.bus_address)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Engine Builder
// =============================================================================

type Registration = Box<dyn FnOnce(&mut ActivityRegistry) -> Result<(), CourierError> + Send>;

/// Builder for constructing an Engine with activities and send filters.
///
/// # Example
///
/// ```ignore
/// let engine = EngineBuilder::new()
///     .with_config(Config::from_env()?)
///     .with_transport(shared_transport)  // Optional: share a transport between engines
///     .with_activity("Reserve", ReserveActivity)
///     .configure_send(|pipe| {
///         pipe.use_execute(|ctx| {
///             ctx.headers.insert("tenant".into(), "acme".into());
///         });
///     })
///     .build()?;
/// ```
pub struct EngineBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    registrations: Vec<Registration>,
    send: PipeConfigurator,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            transport: None,
            registrations: Vec::new(),
            send: PipeConfigurator::new(),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Use an existing transport instead of a private in-memory one.
    ///
    /// Engines sharing a transport can route slips through each other's
    /// activities.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Register an activity with both execute and compensate halves.
    pub fn with_activity<A>(mut self, name: impl Into<String>, activity: A) -> Self
    where
        A: ExecuteActivity + CompensateActivity,
    {
        let name = name.into();
        self.registrations
            .push(Box::new(move |registry| registry.register(name, activity)));
        self
    }

    /// Register an activity that leaves nothing to compensate.
    pub fn with_execute_activity<A>(mut self, name: impl Into<String>, activity: A) -> Self
    where
        A: ExecuteActivity,
    {
        let name = name.into();
        self.registrations
            .push(Box::new(move |registry| registry.register_execute(name, activity)));
        self
    }

    /// Add filters to the send pipe every outgoing message runs through.
    pub fn configure_send<F>(mut self, configure: F) -> Self
    where
        F: FnOnce(&mut PipeConfigurator),
    {
        configure(&mut self.send);
        self
    }

    /// Build the engine.
    ///
    /// Fails on duplicate activity names or an invalid base address.
    pub fn build(self) -> Result<Engine, CourierError> {
        let base = self.config.base_address.clone();

        let mut registry = ActivityRegistry::new(base.clone());
        for register in self.registrations {
            register(&mut registry)?;
        }

        let mut send = self.send;
        if let Some(ttl) = self.config.execute_time_to_live {
            send.use_execute(move |ctx| {
                if ctx.message_kind == MessageKind::Execute {
                    ctx.time_to_live = Some(ttl);
                }
            });
        }

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(InMemoryTransport::new()));

        Ok(Engine {
            bus_address: Address::endpoint(&base, &format!("bus_{}", Uuid::new_v4().simple()))?,
            publish_address: Address::endpoint(&base, "publish")?,
            registry: Arc::new(registry),
            transport,
            pipe: send.build(),
            bus: EventBus::with_capacity(self.config.event_bus_capacity),
            tracker: Arc::new(RoutingSlipTracker::new()),
            config: self.config,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::builder::RoutingSlipBuilder;
    use crate::testing::{FaultyActivity, SecondTestActivity, TestActivity};

    fn engine() -> Engine {
        EngineBuilder::new()
            .with_activity("Test", TestActivity)
            .with_activity("SecondTest", SecondTestActivity)
            .with_execute_activity("Faulty", FaultyActivity)
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_assigns_addresses() {
        let engine = engine();
        let test = engine.registry().get("Test").unwrap();
        assert_eq!(test.execute_address().as_str(), "loopback://localhost/execute_Test");
        assert!(engine.registry().get("Faulty").unwrap().compensate_address().is_none());
        assert!(engine.bus_address().as_str().starts_with("loopback://localhost/bus_"));
    }

    #[test]
    fn test_duplicate_activity_fails_build() {
        let err = EngineBuilder::new()
            .with_activity("Test", TestActivity)
            .with_activity("Test", TestActivity)
            .build()
            .unwrap_err();
        assert!(matches!(err, CourierError::ActivityAlreadyRegistered { .. }));
    }

    #[tokio::test]
    async fn test_start_fails_when_address_taken() {
        let transport = InMemoryTransport::shared();
        let first = EngineBuilder::new()
            .with_transport(transport.clone())
            .with_activity("Test", TestActivity)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        let err = EngineBuilder::new()
            .with_transport(transport)
            .with_activity("Test", TestActivity)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::EndpointAlreadyConnected { .. }));
        first.abort();
    }

    #[tokio::test]
    async fn test_execute_rejects_already_dispatched_slip() {
        let handle = engine().start().await.unwrap();
        let mut builder = RoutingSlipBuilder::default();
        builder.add_activity("Test", handle.execute_address("Test").unwrap());
        let mut slip = builder.build().unwrap();
        slip.transition(RoutingSlipState::Executing).unwrap();

        let err = handle.execute(slip).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CourierError>(),
            Some(CourierError::InvalidStateTransition { .. })
        ));
        handle.abort();
    }

    #[tokio::test]
    async fn test_untracked_slip_cannot_be_awaited() {
        let handle = engine().start().await.unwrap();
        let mut builder = RoutingSlipBuilder::default();
        builder.add_activity("Test", handle.execute_address("Test").unwrap());
        builder.add_subscription(
            Address::parse("loopback://localhost/elsewhere").unwrap(),
            RoutingSlipEvents::ALL,
        );

        let err = handle
            .execute_and_await(builder.build().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CourierError>(),
            Some(CourierError::UntrackedRoutingSlip { .. })
        ));
        handle.abort();
    }

    #[tokio::test]
    async fn test_slip_subscribed_to_bus_is_awaited() {
        let handle = engine().start().await.unwrap();
        let mut builder = RoutingSlipBuilder::default();
        builder
            .add_activity_with_arguments(
                "Test",
                handle.execute_address("Test").unwrap(),
                &serde_json::json!({ "Value": "Hello" }),
            )
            .unwrap();
        builder.add_subscription(handle.bus_address().clone(), RoutingSlipEvents::TERMINAL);

        let instance = handle
            .execute_and_await_timeout(builder.build().unwrap(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(instance.state, RoutingSlipState::Completed);
        handle.abort();
    }

    #[tokio::test]
    async fn test_execute_time_to_live_faults_expired_slip() {
        let config = Config {
            execute_time_to_live: Some(Duration::ZERO),
            ..Config::default()
        };
        let handle = EngineBuilder::new()
            .with_config(config)
            .with_activity("Test", TestActivity)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        let mut builder = RoutingSlipBuilder::default();
        builder
            .add_activity_with_arguments(
                "Test",
                handle.execute_address("Test").unwrap(),
                &serde_json::json!({ "Value": "Hello" }),
            )
            .unwrap();

        let instance = handle
            .execute_and_await_timeout(builder.build().unwrap(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(instance.state, RoutingSlipState::Faulted);
        assert_eq!(instance.faulted_activity.as_deref(), Some("Test"));
        handle.abort();
    }

    #[tokio::test]
    async fn test_fire_and_forget_slips_are_not_tracked() {
        let handle = engine().start().await.unwrap();
        let mut receiver = handle.bus().subscribe();

        for _ in 0..100 {
            let mut builder = RoutingSlipBuilder::default();
            builder
                .add_activity_with_arguments(
                    "Test",
                    handle.execute_address("Test").unwrap(),
                    &serde_json::json!({ "Value": "Hello" }),
                )
                .unwrap();
            handle.execute(builder.build().unwrap()).await.unwrap();
        }

        let mut finished = 0;
        while finished < 100 {
            let event = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
                .await
                .unwrap()
                .unwrap();
            if event.is_terminal() {
                finished += 1;
            }
        }

        assert!(handle.tracker().is_empty());
        handle.abort();
    }

    #[test]
    fn test_zero_bus_capacity_builds() {
        let config = Config {
            event_bus_capacity: 0,
            ..Config::default()
        };
        let engine = EngineBuilder::new()
            .with_config(config)
            .with_activity("Test", TestActivity)
            .build()
            .unwrap();
        assert_eq!(engine.bus().subscriber_count(), 0);
    }

    /// Signals when it starts, then sleeps before recording that it finished.
    struct Lingering {
        started: Arc<tokio::sync::Notify>,
        finished: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ExecuteActivity for Lingering {
        type Arguments = serde_json::Value;

        async fn execute(
            &self,
            ctx: crate::activity::ExecuteContext<serde_json::Value>,
        ) -> anyhow::Result<crate::result::ExecutionResult> {
            self.started.notify_one();
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(ctx.completed())
        }
    }

    #[tokio::test]
    async fn test_abort_stops_steps_in_flight() {
        let started = Arc::new(tokio::sync::Notify::new());
        let finished = Arc::new(AtomicBool::new(false));
        let handle = EngineBuilder::new()
            .with_execute_activity(
                "Lingering",
                Lingering {
                    started: started.clone(),
                    finished: finished.clone(),
                },
            )
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        let mut builder = RoutingSlipBuilder::default();
        builder.add_activity("Lingering", handle.execute_address("Lingering").unwrap());
        handle.execute(builder.build().unwrap()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), started.notified())
            .await
            .unwrap();
        handle.abort();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(!finished.load(Ordering::SeqCst));
    }
}
