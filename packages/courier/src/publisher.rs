//! Fire-and-forget delivery of lifecycle events.
//!
//! Hosts call [`EventPublisher::publish`] and move on; a single background
//! task serializes each event, runs it through the send pipe, and hands it to
//! the transport. One queue per engine keeps events from that engine in the
//! order they were published. Delivery failures are logged with `warn!` and
//! never reach the routing slip.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::{Address, TrackingNumber};
use crate::events::RoutingSlipEvent;
use crate::pipe::{MessageKind, Pipe, SendContext};
use crate::slip::RoutingSlip;
use crate::transport::{Envelope, Transport};

/// Where one event goes.
#[derive(Debug)]
enum Destination {
    /// The addresses of the slip's matching subscriptions.
    Subscribers(Vec<Address>),
    /// Every observer of the transport's publish channel.
    Broadcast,
}

#[derive(Debug)]
struct PublishRequest {
    tracking_number: TrackingNumber,
    event: RoutingSlipEvent,
    destination: Destination,
}

/// Queues events for background delivery. Cheap to clone.
#[derive(Clone)]
pub(crate) struct EventPublisher {
    sender: mpsc::UnboundedSender<PublishRequest>,
}

impl EventPublisher {
    /// Start the publishing task.
    ///
    /// `source` is stamped on every event as its source address; broadcast
    /// events are addressed to `publish_address`.
    pub(crate) fn spawn(
        transport: Arc<dyn Transport>,
        pipe: Pipe,
        source: Address,
        publish_address: Address,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = PublishWorker {
            transport,
            pipe,
            source,
            publish_address,
        };
        let handle = tokio::spawn(worker.run(receiver));
        (Self { sender }, handle)
    }

    /// Queue `event` for every subscription of `slip` that wants it.
    ///
    /// A slip without subscriptions publishes to every transport observer.
    pub fn publish(&self, slip: &RoutingSlip, event: RoutingSlipEvent) {
        let destination = if slip.subscriptions().is_empty() {
            Destination::Broadcast
        } else {
            let kind = event.kind();
            let activity_name = event.activity_name();
            let mut addresses: Vec<Address> = Vec::new();
            for subscription in slip.subscriptions() {
                if subscription.matches(kind, activity_name)
                    && !addresses.contains(&subscription.address)
                {
                    addresses.push(subscription.address.clone());
                }
            }
            if addresses.is_empty() {
                debug!(
                    tracking_number = %slip.tracking_number(),
                    event = %kind,
                    "no subscription matches event"
                );
                return;
            }
            Destination::Subscribers(addresses)
        };

        let request = PublishRequest {
            tracking_number: slip.tracking_number(),
            event,
            destination,
        };
        if let Err(e) = self.sender.send(request) {
            warn!(
                tracking_number = %e.0.tracking_number,
                event = %e.0.event.kind(),
                "event publisher stopped, event dropped"
            );
        }
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

struct PublishWorker {
    transport: Arc<dyn Transport>,
    pipe: Pipe,
    source: Address,
    publish_address: Address,
}

impl PublishWorker {
    async fn run(self, mut receiver: mpsc::UnboundedReceiver<PublishRequest>) {
        while let Some(request) = receiver.recv().await {
            let kind = request.event.kind();
            let body = match request.event.to_bytes() {
                Ok(body) => body,
                Err(e) => {
                    warn!(
                        tracking_number = %request.tracking_number,
                        event = %kind,
                        error = %e,
                        "failed to serialize event"
                    );
                    continue;
                }
            };

            match request.destination {
                Destination::Broadcast => {
                    if let Err(e) = self.deliver(request.tracking_number, None, body).await {
                        warn!(
                            tracking_number = %request.tracking_number,
                            event = %kind,
                            error = %e,
                            "failed to publish event"
                        );
                    }
                }
                Destination::Subscribers(addresses) => {
                    for address in addresses {
                        if let Err(e) = self
                            .deliver(request.tracking_number, Some(&address), body.clone())
                            .await
                        {
                            warn!(
                                tracking_number = %request.tracking_number,
                                event = %kind,
                                %address,
                                error = %e,
                                "failed to deliver event to subscriber"
                            );
                        }
                    }
                }
            }
        }
        debug!("event publisher stopped");
    }

    async fn deliver(
        &self,
        tracking_number: TrackingNumber,
        address: Option<&Address>,
        body: Vec<u8>,
    ) -> anyhow::Result<()> {
        let destination = address.unwrap_or(&self.publish_address).clone();
        let mut context = SendContext::new(destination, MessageKind::Event)
            .with_correlation(tracking_number)
            .with_source(self.source.clone());
        self.pipe.send(&mut context).await?;

        let envelope = Envelope::new(context, body);
        match address {
            Some(address) => self.transport.send(address, envelope).await?,
            None => self.transport.publish(envelope).await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::builder::RoutingSlipBuilder;
    use crate::core::ExecutionId;
    use crate::events::{RoutingSlipActivityCompleted, RoutingSlipCompleted};
    use crate::subscription::{EventKind, RoutingSlipEvents};
    use crate::transport::{InMemoryTransport, ReceiveEndpoint};
    use crate::variables::Variables;

    fn address(name: &str) -> Address {
        Address::endpoint("loopback://localhost", name).unwrap()
    }

    fn publisher(transport: Arc<InMemoryTransport>) -> EventPublisher {
        let (publisher, _handle) =
            EventPublisher::spawn(transport, Pipe::empty(), address("bus"), address("publish"));
        publisher
    }

    fn activity_completed(slip: &RoutingSlip, name: &str) -> RoutingSlipEvent {
        RoutingSlipEvent::ActivityCompleted(RoutingSlipActivityCompleted {
            tracking_number: slip.tracking_number(),
            execution_id: ExecutionId::new(),
            timestamp: Utc::now(),
            duration: Duration::from_millis(1),
            activity_name: name.into(),
            host: address(&format!("execute_{name}")),
            arguments: Variables::new(),
            results: serde_json::Value::Null,
            variables: slip.variables().clone(),
        })
    }

    fn completed(slip: &RoutingSlip) -> RoutingSlipEvent {
        RoutingSlipEvent::Completed(RoutingSlipCompleted {
            tracking_number: slip.tracking_number(),
            timestamp: Utc::now(),
            duration: Duration::from_millis(1),
            variables: slip.variables().clone(),
        })
    }

    async fn next_event(endpoint: &mut ReceiveEndpoint) -> RoutingSlipEvent {
        let envelope = tokio::time::timeout(Duration::from_secs(1), endpoint.recv())
            .await
            .unwrap()
            .unwrap();
        RoutingSlipEvent::from_bytes(&envelope.body).unwrap()
    }

    #[tokio::test]
    async fn test_delivers_to_matching_subscriptions_in_order() {
        let transport = InMemoryTransport::shared();
        let observer = address("observer");
        let mut endpoint = transport.connect(&observer).await.unwrap();

        let mut builder = RoutingSlipBuilder::default();
        builder.add_activity("Test", address("execute_Test"));
        builder.add_subscription(observer.clone(), RoutingSlipEvents::ALL);
        let slip = builder.build().unwrap();

        let publisher = publisher(transport.clone());
        publisher.publish(&slip, activity_completed(&slip, "Test"));
        publisher.publish(&slip, completed(&slip));

        assert_eq!(next_event(&mut endpoint).await.kind(), EventKind::ActivityCompleted);
        assert_eq!(next_event(&mut endpoint).await.kind(), EventKind::Completed);
    }

    #[tokio::test]
    async fn test_activity_filter_skips_other_activities() {
        let transport = InMemoryTransport::shared();
        let observer = address("observer");
        let mut endpoint = transport.connect(&observer).await.unwrap();

        let mut builder = RoutingSlipBuilder::default();
        builder.add_activity("Test", address("execute_Test"));
        builder.add_activity_subscription(observer.clone(), RoutingSlipEvents::ALL, "Test");
        let slip = builder.build().unwrap();

        let publisher = publisher(transport.clone());
        publisher.publish(&slip, activity_completed(&slip, "SecondTest"));
        publisher.publish(&slip, activity_completed(&slip, "Test"));

        match next_event(&mut endpoint).await {
            RoutingSlipEvent::ActivityCompleted(event) => assert_eq!(event.activity_name, "Test"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slip_without_subscriptions_broadcasts() {
        let transport = InMemoryTransport::shared();
        let mut published = transport.subscribe();

        let mut builder = RoutingSlipBuilder::default();
        builder.add_activity("Test", address("execute_Test"));
        let slip = builder.build().unwrap();

        publisher(transport.clone()).publish(&slip, completed(&slip));

        let envelope = tokio::time::timeout(Duration::from_secs(1), published.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.context.message_kind, MessageKind::Event);
        assert_eq!(envelope.context.correlation_id, Some(slip.tracking_number()));
    }

    #[tokio::test]
    async fn test_unreachable_subscriber_does_not_block_others() {
        let transport = InMemoryTransport::shared();
        let observer = address("observer");
        let mut endpoint = transport.connect(&observer).await.unwrap();

        let mut builder = RoutingSlipBuilder::default();
        builder.add_activity("Test", address("execute_Test"));
        builder.add_subscription(address("gone"), RoutingSlipEvents::ALL);
        builder.add_subscription(observer.clone(), RoutingSlipEvents::ALL);
        let slip = builder.build().unwrap();

        publisher(transport.clone()).publish(&slip, completed(&slip));
        assert!(next_event(&mut endpoint).await.is_terminal());
    }
}
