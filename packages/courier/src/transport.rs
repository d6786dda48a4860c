//! Message transport: how envelopes move between addresses.
//!
//! # Guarantees
//!
//! The in-memory transport gives the same guarantees a broker would give
//! within one process:
//!
//! - **Point-to-point send**: each envelope sent to an address is received by
//!   the one endpoint connected there
//! - **Per-sender FIFO**: envelopes from one sender to one address arrive in
//!   send order
//! - **Broadcast publish**: published envelopes reach every current
//!   subscriber; slow subscribers may lag and miss envelopes
//! - **Dead letters**: envelopes a host refuses are kept with the reason
//!
//! Retry, redelivery, and durability are out of scope.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use crate::core::Address;
use crate::error::CourierError;
use crate::pipe::SendContext;

/// Default channel capacity for published envelopes.
const DEFAULT_PUBLISH_CAPACITY: usize = 10000;

/// One message on the wire: headers plus a JSON body.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub context: SendContext,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(context: SendContext, body: Vec<u8>) -> Self {
        Self { context, body }
    }

    pub fn destination(&self) -> &Address {
        &self.context.destination_address
    }

    pub fn is_expired(&self) -> bool {
        self.context.is_expired(Utc::now())
    }
}

/// An envelope a host refused to process.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub address: Address,
    pub envelope: Envelope,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// The receiving side of one connected address.
#[derive(Debug)]
pub struct ReceiveEndpoint {
    address: Address,
    receiver: mpsc::UnboundedReceiver<Envelope>,
}

impl ReceiveEndpoint {
    pub fn new(address: Address, receiver: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self { address, receiver }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Wait for the next envelope. `None` once the endpoint is disconnected.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }
}

/// Moves envelopes between addresses.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start receiving at `address`.
    async fn connect(&self, address: &Address) -> Result<ReceiveEndpoint, CourierError>;

    /// Deliver `envelope` to the endpoint connected at `address`.
    async fn send(&self, address: &Address, envelope: Envelope) -> Result<(), CourierError>;

    /// Deliver `envelope` to every publish subscriber.
    async fn publish(&self, envelope: Envelope) -> Result<(), CourierError>;

    /// Observe published envelopes.
    fn subscribe(&self) -> broadcast::Receiver<Envelope>;

    /// Park an envelope that cannot be processed at `address`.
    async fn dead_letter(&self, address: &Address, envelope: Envelope, reason: String);
}

/// Process-local transport backed by tokio channels.
///
/// Endpoint queues are unbounded so a host forwarding a slip never waits on
/// the next host's backlog.
pub struct InMemoryTransport {
    endpoints: DashMap<Address, mpsc::UnboundedSender<Envelope>>,
    published: broadcast::Sender<Envelope>,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PUBLISH_CAPACITY)
    }

    /// Create a transport whose publish channel buffers `capacity` envelopes.
    pub fn with_capacity(capacity: usize) -> Self {
        let (published, _) = broadcast::channel(capacity);
        Self {
            endpoints: DashMap::new(),
            published,
            dead_letters: Mutex::new(Vec::new()),
        }
    }

    /// Convenience for sharing the transport between engines.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Stop delivering to `address`. Pending envelopes are dropped with the
    /// endpoint.
    pub fn disconnect(&self, address: &Address) -> bool {
        self.endpoints.remove(address).is_some()
    }

    pub fn is_connected(&self, address: &Address) -> bool {
        self.endpoints
            .get(address)
            .map(|sender| !sender.is_closed())
            .unwrap_or(false)
    }

    /// Snapshot of every dead-lettered envelope so far.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        match self.dead_letters.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("endpoint_count", &self.endpoints.len())
            .field("subscriber_count", &self.published.receiver_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&self, address: &Address) -> Result<ReceiveEndpoint, CourierError> {
        if self.is_connected(address) {
            return Err(CourierError::EndpointAlreadyConnected {
                address: address.clone(),
            });
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        self.endpoints.insert(address.clone(), sender);
        debug!(%address, "endpoint connected");
        Ok(ReceiveEndpoint::new(address.clone(), receiver))
    }

    async fn send(&self, address: &Address, envelope: Envelope) -> Result<(), CourierError> {
        let sender = self
            .endpoints
            .get(address)
            .map(|sender| sender.clone())
            .ok_or_else(|| CourierError::EndpointNotFound {
                address: address.clone(),
            })?;

        if sender.send(envelope).is_err() {
            self.endpoints.remove(address);
            return Err(CourierError::EndpointClosed {
                address: address.clone(),
            });
        }
        Ok(())
    }

    async fn publish(&self, envelope: Envelope) -> Result<(), CourierError> {
        let receivers = self.published.send(envelope).unwrap_or(0);
        if receivers == 0 {
            debug!("published envelope had no subscribers");
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.published.subscribe()
    }

    async fn dead_letter(&self, address: &Address, envelope: Envelope, reason: String) {
        error!(
            %address,
            message_id = %envelope.context.message_id,
            reason = %reason,
            "envelope dead-lettered"
        );
        let letter = DeadLetter {
            address: address.clone(),
            envelope,
            reason,
            timestamp: Utc::now(),
        };
        match self.dead_letters.lock() {
            Ok(mut guard) => guard.push(letter),
            Err(poisoned) => {
                warn!("dead letter store was poisoned, recovering");
                poisoned.into_inner().push(letter);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::MessageKind;

    fn address(name: &str) -> Address {
        Address::endpoint("loopback://localhost", name).unwrap()
    }

    fn envelope(to: &Address, body: &str) -> Envelope {
        Envelope::new(
            SendContext::new(to.clone(), MessageKind::Execute),
            body.as_bytes().to_vec(),
        )
    }

    #[tokio::test]
    async fn test_send_reaches_connected_endpoint_in_order() {
        let transport = InMemoryTransport::new();
        let to = address("execute_Test");
        let mut endpoint = transport.connect(&to).await.unwrap();

        transport.send(&to, envelope(&to, "one")).await.unwrap();
        transport.send(&to, envelope(&to, "two")).await.unwrap();

        assert_eq!(endpoint.recv().await.unwrap().body, b"one");
        assert_eq!(endpoint.recv().await.unwrap().body, b"two");
    }

    #[tokio::test]
    async fn test_send_to_unknown_address_fails() {
        let transport = InMemoryTransport::new();
        let to = address("execute_Nowhere");
        let err = transport.send(&to, envelope(&to, "x")).await.unwrap_err();
        assert!(matches!(err, CourierError::EndpointNotFound { .. }));
    }

    #[tokio::test]
    async fn test_send_after_endpoint_dropped_fails() {
        let transport = InMemoryTransport::new();
        let to = address("execute_Test");
        let endpoint = transport.connect(&to).await.unwrap();
        drop(endpoint);

        let err = transport.send(&to, envelope(&to, "x")).await.unwrap_err();
        assert!(matches!(err, CourierError::EndpointClosed { .. }));

        // The address can be reconnected once the old endpoint is gone.
        transport.connect(&to).await.unwrap();
    }

    #[tokio::test]
    async fn test_double_connect_rejected() {
        let transport = InMemoryTransport::new();
        let to = address("execute_Test");
        let _endpoint = transport.connect(&to).await.unwrap();
        let err = transport.connect(&to).await.unwrap_err();
        assert!(matches!(err, CourierError::EndpointAlreadyConnected { .. }));
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let transport = InMemoryTransport::new();
        let mut first = transport.subscribe();
        let mut second = transport.subscribe();
        let to = address("bus");

        transport.publish(envelope(&to, "event")).await.unwrap();

        assert_eq!(first.recv().await.unwrap().body, b"event");
        assert_eq!(second.recv().await.unwrap().body, b"event");
    }

    #[tokio::test]
    async fn test_dead_letters_are_kept() {
        let transport = InMemoryTransport::new();
        let to = address("execute_Test");
        transport
            .dead_letter(&to, envelope(&to, "bad"), "routing mismatch".into())
            .await;

        let letters = transport.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, "routing mismatch");
        assert_eq!(letters[0].address, to);
    }
}
