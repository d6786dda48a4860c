//! The execute step: what an execute host does with one routing slip.
//!
//! 1. Decode the slip and check it is meant for this host
//! 2. Pop the itinerary head and run the activity on the merged arguments
//! 3. On completion, log, merge variables, revise the itinerary and forward
//!    (or finish the slip when the itinerary is empty)
//! 4. On fault, record the exception and start compensating
//!
//! A slip that names another activity is a build or configuration defect.
//! It is dead-lettered and publishes nothing.

use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::activity::ExecuteInput;
use crate::activity_log::ActivityLogEntry;
use crate::compensate::start_compensation;
use crate::core::{Address, ExecutionId};
use crate::error::{ActivityException, CourierError, ExceptionInfo, FaultKind};
use crate::events::{
    RoutingSlipActivityCompleted, RoutingSlipActivityFaulted, RoutingSlipCompleted,
    RoutingSlipEvent,
};
use crate::host::{ForwardError, HostServices};
use crate::itinerary::{Activity, ItineraryRevision};
use crate::pipe::MessageKind;
use crate::registry::ActivityDefinition;
use crate::result::ExecutionResult;
use crate::slip::RoutingSlip;
use crate::state::RoutingSlipState;
use crate::transport::Envelope;
use crate::variables::Variables;

/// Run one execute message.
pub(crate) async fn execute_step(
    services: &HostServices,
    definition: &ActivityDefinition,
    host: &Address,
    envelope: Envelope,
) -> Result<(), CourierError> {
    let mut slip = match RoutingSlip::from_bytes(&envelope.body) {
        Ok(slip) => slip,
        Err(e) => {
            error!(activity = definition.name(), %host, error = %e, "undecodable routing slip");
            services.dead_letter(host, envelope, &e).await;
            return Ok(());
        }
    };

    let activity = match take_next_activity(&mut slip, definition.name()) {
        Ok(activity) => activity,
        Err(e) => {
            error!(
                tracking_number = %slip.tracking_number(),
                %host,
                error = %e,
                "routing slip delivered to the wrong host"
            );
            services.dead_letter(host, envelope, &e).await;
            return Ok(());
        }
    };

    let tracking_number = slip.tracking_number();
    let execution_id = ExecutionId::new();
    let arguments = slip.variables().merged_with(&activity.arguments);
    let started = Instant::now();

    let result = if envelope.is_expired() {
        let expired_at = envelope
            .context
            .expiration_time()
            .unwrap_or_else(Utc::now);
        ExecutionResult::Faulted(
            CourierError::TimeToLiveExpired {
                activity: activity.name.clone(),
                expired_at,
            }
            .into(),
        )
    } else {
        debug!(%tracking_number, activity = %activity.name, %execution_id, "executing activity");
        definition
            .execute
            .execute_any(ExecuteInput {
                tracking_number,
                execution_id,
                activity_name: activity.name.clone(),
                host: host.clone(),
                arguments: arguments.clone(),
                variables: slip.variables().clone(),
            })
            .await
    };
    let step = Step {
        activity,
        execution_id,
        host: host.clone(),
        arguments,
        elapsed: started.elapsed(),
    };

    match result {
        ExecutionResult::Completed {
            log,
            variables,
            itinerary,
        } => complete(services, definition, slip, step, log, variables, itinerary).await,
        ExecutionResult::Faulted(error) => {
            let exception_info = ExceptionInfo::from_error(&error);
            fault(services, slip, step, exception_info).await
        }
    }
}

/// One activity run, as the events and the activity log describe it.
struct Step {
    activity: Activity,
    execution_id: ExecutionId,
    host: Address,
    arguments: Variables,
    elapsed: Duration,
}

/// Pop the itinerary head if this host runs it.
fn take_next_activity(slip: &mut RoutingSlip, expected: &str) -> Result<Activity, CourierError> {
    let tracking_number = slip.tracking_number();
    let mismatch = |actual: String| CourierError::RoutingMismatch {
        tracking_number,
        expected: expected.to_string(),
        actual,
    };

    if slip.state() != RoutingSlipState::Executing {
        return Err(mismatch(format!("a {} routing slip", slip.state())));
    }
    match slip.itinerary().front() {
        Some(next) if next.name == expected => {}
        Some(next) => return Err(mismatch(next.name.clone())),
        None => {}
    }
    slip.itinerary_mut()
        .pop_front()
        .ok_or_else(|| mismatch("an empty itinerary".to_string()))
}

async fn complete(
    services: &HostServices,
    definition: &ActivityDefinition,
    mut slip: RoutingSlip,
    step: Step,
    log: Option<Value>,
    variables: Variables,
    revision: ItineraryRevision,
) -> Result<(), CourierError> {
    let tracking_number = slip.tracking_number();
    let timestamp = Utc::now();
    let data = log.unwrap_or(Value::Null);

    slip.activity_log_mut().push(ActivityLogEntry {
        execution_id: step.execution_id,
        name: step.activity.name.clone(),
        timestamp,
        duration: step.elapsed,
        host: step.host.clone(),
        compensate_address: definition.compensate_address().cloned(),
        data: data.clone(),
    });
    slip.variables_mut().merge(variables);
    slip.itinerary_mut().revise(revision);

    debug!(
        %tracking_number,
        activity = %step.activity.name,
        elapsed = ?step.elapsed,
        "activity completed"
    );
    let event = RoutingSlipEvent::ActivityCompleted(RoutingSlipActivityCompleted {
        tracking_number,
        execution_id: step.execution_id,
        timestamp,
        duration: step.elapsed,
        activity_name: step.activity.name,
        host: step.host.clone(),
        arguments: step.arguments,
        results: data,
        variables: slip.variables().clone(),
    });
    services.publisher.publish(&slip, event);

    let next_address = slip.itinerary().front().map(|next| next.address.clone());
    let Some(next_address) = next_address else {
        slip.transition(RoutingSlipState::Completed)?;
        info!(%tracking_number, duration = ?slip.elapsed(), "routing slip completed");
        let event = RoutingSlipEvent::Completed(RoutingSlipCompleted {
            tracking_number,
            timestamp: Utc::now(),
            duration: slip.elapsed(),
            variables: slip.variables().clone(),
        });
        services.publisher.publish(&slip, event);
        return Ok(());
    };

    slip.transition(RoutingSlipState::Executing)?;
    match services
        .forward(slip, &next_address, MessageKind::Execute, Some(&step.host))
        .await
    {
        Ok(()) => Ok(()),
        Err(ForwardError { slip, error }) => {
            unreachable_next_activity(services, slip, &step.host, error).await
        }
    }
}

/// The next host could not be reached. The fault is charged to the
/// activity that never ran.
async fn unreachable_next_activity(
    services: &HostServices,
    mut slip: RoutingSlip,
    source: &Address,
    error: anyhow::Error,
) -> Result<(), CourierError> {
    let Some(activity) = slip.itinerary_mut().pop_front() else {
        return Ok(());
    };
    warn!(
        tracking_number = %slip.tracking_number(),
        activity = %activity.name,
        from = %source,
        error = %error,
        "failed to forward routing slip"
    );

    let mut exception_info = ExceptionInfo::from_error(&error);
    exception_info.kind = FaultKind::Transport;
    let step = Step {
        arguments: slip.variables().merged_with(&activity.arguments),
        host: activity.address.clone(),
        activity,
        execution_id: ExecutionId::new(),
        elapsed: Duration::ZERO,
    };
    fault(services, slip, step, exception_info).await
}

async fn fault(
    services: &HostServices,
    mut slip: RoutingSlip,
    step: Step,
    exception_info: ExceptionInfo,
) -> Result<(), CourierError> {
    let tracking_number = slip.tracking_number();
    let timestamp = Utc::now();
    warn!(
        %tracking_number,
        activity = %step.activity.name,
        kind = %exception_info.kind,
        error = %exception_info.message,
        "activity faulted"
    );

    slip.record_exception(ActivityException {
        execution_id: step.execution_id,
        name: step.activity.name.clone(),
        host: step.host.clone(),
        timestamp,
        elapsed: step.elapsed,
        exception_info: exception_info.clone(),
    });
    let event = RoutingSlipEvent::ActivityFaulted(RoutingSlipActivityFaulted {
        tracking_number,
        execution_id: step.execution_id,
        timestamp,
        elapsed: step.elapsed,
        activity_name: step.activity.name,
        host: step.host.clone(),
        exception_info,
        arguments: step.arguments,
        variables: slip.variables().clone(),
    });
    services.publisher.publish(&slip, event);

    slip.transition(RoutingSlipState::Faulting)?;
    start_compensation(services, slip, &step.host).await
}
