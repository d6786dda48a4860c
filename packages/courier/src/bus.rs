//! In-process fan-out of routing slip lifecycle events.
//!
//! The engine decodes every event that reaches its bus address (or the
//! transport's publish channel) and re-broadcasts it here, so code in the
//! same process can watch slips without connecting an endpoint of its own.
//!
//! Delivery is at most once: a receiver that falls more than the bus
//! capacity behind gets `RecvError::Lagged` and loses those events. Use
//! [`RoutingSlipTracker`](crate::RoutingSlipTracker) when a terminal event
//! must not be missed.

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::core::TrackingNumber;
use crate::events::RoutingSlipEvent;

const DEFAULT_CAPACITY: usize = 10000;

/// Broadcast channel of routing slip events.
///
/// ```ignore
/// let mut receiver = handle.bus().subscribe();
/// while let Ok(event) = receiver.recv().await {
///     if let RoutingSlipEvent::ActivityFaulted(faulted) = &event {
///         println!("{} faulted: {}", faulted.activity_name, faulted.exception_info);
///     }
/// }
/// ```
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RoutingSlipEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A bus that buffers `capacity` events per receiver before it lags.
    /// A capacity of zero is raised to one.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Broadcast `event`. Returns how many receivers were listening.
    pub fn emit(&self, event: RoutingSlipEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RoutingSlipEvent> {
        self.sender.subscribe()
    }

    /// Events of one slip from now on, ending with its terminal event.
    ///
    /// Subscribe before dispatching the slip, or early events are lost.
    pub fn subscribe_slip(&self, tracking_number: TrackingNumber) -> SlipEvents {
        SlipEvents {
            tracking_number,
            receiver: self.sender.subscribe(),
            finished: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

/// Receiver filtered to a single routing slip.
pub struct SlipEvents {
    tracking_number: TrackingNumber,
    receiver: broadcast::Receiver<RoutingSlipEvent>,
    finished: bool,
}

impl SlipEvents {
    pub fn tracking_number(&self) -> TrackingNumber {
        self.tracking_number
    }

    /// The slip's next event, or `None` once its terminal event was
    /// returned or the bus closed.
    pub async fn next(&mut self) -> Option<RoutingSlipEvent> {
        while !self.finished {
            match self.receiver.recv().await {
                Ok(event) if event.tracking_number() == self.tracking_number => {
                    self.finished = event.is_terminal();
                    return Some(event);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(
                        tracking_number = %self.tracking_number,
                        missed,
                        "slip receiver lagged, events lost"
                    );
                }
                Err(RecvError::Closed) => self.finished = true,
            }
        }
        None
    }
}

impl std::fmt::Debug for SlipEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlipEvents")
            .field("tracking_number", &self.tracking_number)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
