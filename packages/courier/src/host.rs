//! Activity hosts: the receive loops behind execute and compensate addresses.
//!
//! Each registered activity gets one execute host and, if it can be
//! compensated, one compensate host. A host owns its receive endpoint and
//! runs every envelope on its own task, bounded by a per-host semaphore:
//!
//! ```text
//! endpoint ─► acquire permit ─► spawn ─► execute_step / compensate_step
//!                                          │
//!                                          └─► forward slip (move) ─► next address
//! ```
//!
//! Hosts never share a routing slip. Forwarding serializes the slip into an
//! envelope and drops the local value once the transport has accepted it.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info};

use crate::compensate::compensate_step;
use crate::core::Address;
use crate::error::CourierError;
use crate::execute::execute_step;
use crate::pipe::{MessageKind, Pipe, SendContext};
use crate::publisher::EventPublisher;
use crate::registry::ActivityDefinition;
use crate::slip::RoutingSlip;
use crate::transport::{Envelope, ReceiveEndpoint, Transport};

/// Which half of an activity a host runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostRole {
    Execute,
    Compensate,
}

impl std::fmt::Display for HostRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostRole::Execute => write!(f, "execute"),
            HostRole::Compensate => write!(f, "compensate"),
        }
    }
}

/// A forward that the transport (or the send pipe) refused.
///
/// The slip comes back so the caller can fault it.
pub(crate) struct ForwardError {
    pub slip: RoutingSlip,
    pub error: anyhow::Error,
}

/// Services every host shares.
pub(crate) struct HostServices {
    pub transport: Arc<dyn Transport>,
    pub pipe: Pipe,
    pub publisher: EventPublisher,
    pub concurrency: usize,
}

impl HostServices {
    /// Hand `slip` to `address`.
    ///
    /// On success the slip is gone: ownership moved with the envelope.
    pub async fn forward(
        &self,
        slip: RoutingSlip,
        address: &Address,
        kind: MessageKind,
        source: Option<&Address>,
    ) -> Result<(), ForwardError> {
        let body = match slip.to_bytes() {
            Ok(body) => body,
            Err(e) => {
                return Err(ForwardError {
                    slip,
                    error: e.into(),
                })
            }
        };

        let mut context =
            SendContext::new(address.clone(), kind).with_correlation(slip.tracking_number());
        if let Some(source) = source {
            context = context.with_source(source.clone());
        }
        if let Err(error) = self.pipe.send(&mut context).await {
            return Err(ForwardError { slip, error });
        }

        let destination = context.destination_address.clone();
        match self
            .transport
            .send(&destination, Envelope::new(context, body))
            .await
        {
            Ok(()) => {
                debug!(
                    tracking_number = %slip.tracking_number(),
                    address = %destination,
                    kind = ?kind,
                    "routing slip forwarded"
                );
                drop(slip);
                Ok(())
            }
            Err(e) => Err(ForwardError {
                slip,
                error: e.into(),
            }),
        }
    }

    /// Park an envelope the host refuses to process.
    pub async fn dead_letter(&self, address: &Address, envelope: Envelope, error: &CourierError) {
        self.transport
            .dead_letter(address, envelope, error.to_string())
            .await;
    }
}

impl std::fmt::Debug for HostServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostServices")
            .field("pipe", &self.pipe)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

/// Run a host until its endpoint disconnects.
///
/// Steps run in a `JoinSet` owned by the host task, so aborting the host
/// aborts its in-flight steps too.
pub(crate) fn spawn_host(
    role: HostRole,
    definition: Arc<ActivityDefinition>,
    mut endpoint: ReceiveEndpoint,
    services: Arc<HostServices>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let address = endpoint.address().clone();
        let semaphore = Arc::new(Semaphore::new(services.concurrency.max(1)));
        let mut in_flight = JoinSet::new();
        info!(
            activity = definition.name(),
            %address,
            %role,
            "activity host started"
        );

        loop {
            tokio::select! {
                received = endpoint.recv() => {
                    let Some(envelope) = received else { break };
                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };

                    let definition = definition.clone();
                    let services = services.clone();
                    let address = address.clone();
                    in_flight.spawn(async move {
                        let result = match role {
                            HostRole::Execute => {
                                execute_step(&services, &definition, &address, envelope).await
                            }
                            HostRole::Compensate => {
                                compensate_step(&services, &definition, &address, envelope).await
                            }
                        };
                        if let Err(e) = result {
                            error!(
                                activity = definition.name(),
                                %address,
                                %role,
                                error = %e,
                                "host step failed"
                            );
                        }
                        drop(permit);
                    });
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    reap(joined, &definition, &address, role);
                }
            }
        }

        // Endpoint gone: let accepted slips finish their step.
        while let Some(joined) = in_flight.join_next().await {
            reap(joined, &definition, &address, role);
        }
        info!(activity = definition.name(), %address, %role, "activity host stopped");
    })
}

fn reap(
    joined: Result<(), JoinError>,
    definition: &ActivityDefinition,
    address: &Address,
    role: HostRole,
) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(
                activity = definition.name(),
                %address,
                %role,
                "host step panicked"
            );
        }
    }
}
