//! The compensate step and the unwind that drives it.
//!
//! Compensation walks the activity log most recent first. Each compensate
//! host pops its own entry, replays the stored log to the activity, and hands
//! the slip to the next compensable entry:
//!
//! ```text
//! Faulting ──► [C] ──► [B] ──► [A] ──► Faulted
//!               │
//!               └── failure ──► CompensationFailed (B and A stay in the log)
//! ```
//!
//! Trailing entries with nothing to undo are skipped without a message.

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info};

use crate::activity::CompensateInput;
use crate::activity_log::ActivityLogEntry;
use crate::core::Address;
use crate::error::{CourierError, ExceptionInfo, FaultKind};
use crate::events::{
    RoutingSlipActivityCompensated, RoutingSlipActivityCompensationFailed,
    RoutingSlipCompensationFailed, RoutingSlipEvent, RoutingSlipFaulted,
};
use crate::host::{ForwardError, HostServices};
use crate::pipe::MessageKind;
use crate::registry::ActivityDefinition;
use crate::result::CompensationResult;
use crate::slip::RoutingSlip;
use crate::state::RoutingSlipState;
use crate::transport::Envelope;

/// Send the slip to its most recent compensable entry, or finish it as
/// faulted when nothing is left to undo.
///
/// The slip must be `Faulting` or `Compensating`.
pub(crate) async fn start_compensation(
    services: &HostServices,
    mut slip: RoutingSlip,
    source: &Address,
) -> Result<(), CourierError> {
    let tracking_number = slip.tracking_number();
    for skipped in slip.activity_log_mut().discard_uncompensable() {
        debug!(%tracking_number, activity = %skipped.name, "nothing to compensate");
    }

    let target = slip
        .activity_log()
        .peek()
        .and_then(|entry| entry.compensate_address.clone());
    let Some(address) = target else {
        slip.transition(RoutingSlipState::Faulted)?;
        info!(
            %tracking_number,
            faults = slip.activity_exceptions().len(),
            "routing slip faulted"
        );
        let event = RoutingSlipEvent::Faulted(RoutingSlipFaulted {
            tracking_number,
            timestamp: Utc::now(),
            duration: slip.elapsed(),
            activity_exceptions: slip.activity_exceptions().to_vec(),
            variables: slip.variables().clone(),
        });
        services.publisher.publish(&slip, event);
        return Ok(());
    };

    slip.transition(RoutingSlipState::Compensating)?;
    match services
        .forward(slip, &address, MessageKind::Compensate, Some(source))
        .await
    {
        Ok(()) => Ok(()),
        Err(ForwardError { mut slip, error }) => {
            // The entry that could not be reached stops the unwind.
            let Some(entry) = slip.activity_log_mut().pop() else {
                return Ok(());
            };
            let mut exception_info = ExceptionInfo::from_error(&error);
            exception_info.kind = FaultKind::Transport;
            compensation_failed(services, slip, entry, exception_info, Duration::ZERO).await
        }
    }
}

/// Run one compensate message.
pub(crate) async fn compensate_step(
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

    let entry = match take_log_entry(&mut slip, definition.name()) {
        Ok(entry) => entry,
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

    let Some(activity) = definition.compensate.as_ref() else {
        let e = CourierError::UnknownActivity {
            name: format!("compensate_{}", definition.name()),
        };
        error!(tracking_number = %slip.tracking_number(), %host, error = %e, "activity cannot compensate");
        services.dead_letter(host, envelope, &e).await;
        return Ok(());
    };

    let tracking_number = slip.tracking_number();
    debug!(%tracking_number, activity = %entry.name, execution_id = %entry.execution_id, "compensating activity");
    let started = Instant::now();
    let result = activity
        .compensate_any(CompensateInput {
            tracking_number,
            execution_id: entry.execution_id,
            activity_name: entry.name.clone(),
            log: entry.data.clone(),
            variables: slip.variables().clone(),
        })
        .await;
    let duration = started.elapsed();

    match result {
        CompensationResult::Compensated { variables } => {
            slip.variables_mut().merge(variables);
            debug!(%tracking_number, activity = %entry.name, ?duration, "activity compensated");
            let event = RoutingSlipEvent::ActivityCompensated(RoutingSlipActivityCompensated {
                tracking_number,
                execution_id: entry.execution_id,
                timestamp: Utc::now(),
                duration,
                activity_name: entry.name,
                data: entry.data,
                variables: slip.variables().clone(),
            });
            services.publisher.publish(&slip, event);
            start_compensation(services, slip, host).await
        }
        CompensationResult::Failed(error) => {
            let exception_info = ExceptionInfo::from_error(&error);
            compensation_failed(services, slip, entry, exception_info, duration).await
        }
    }
}

/// Pop the activity log head if this host compensates it.
fn take_log_entry(
    slip: &mut RoutingSlip,
    expected: &str,
) -> Result<ActivityLogEntry, CourierError> {
    let tracking_number = slip.tracking_number();
    let mismatch = |actual: String| CourierError::RoutingMismatch {
        tracking_number,
        expected: expected.to_string(),
        actual,
    };

    if slip.state() != RoutingSlipState::Compensating {
        return Err(mismatch(format!("a {} routing slip", slip.state())));
    }
    match slip.activity_log().peek() {
        Some(entry) if entry.name == expected => {}
        Some(entry) => return Err(mismatch(entry.name.clone())),
        None => {}
    }
    slip.activity_log_mut()
        .pop()
        .ok_or_else(|| mismatch("an empty activity log".to_string()))
}

/// Stop the unwind. Entries still in the log stay uncompensated.
async fn compensation_failed(
    services: &HostServices,
    mut slip: RoutingSlip,
    entry: ActivityLogEntry,
    exception_info: ExceptionInfo,
    duration: Duration,
) -> Result<(), CourierError> {
    slip.transition(RoutingSlipState::CompensationFailed)?;

    let tracking_number = slip.tracking_number();
    let remaining = slip.activity_log().len();
    let timestamp = Utc::now();
    error!(
        %tracking_number,
        activity = %entry.name,
        remaining,
        error = %exception_info,
        "compensation failed"
    );

    let activity_event =
        RoutingSlipEvent::ActivityCompensationFailed(RoutingSlipActivityCompensationFailed {
            tracking_number,
            execution_id: entry.execution_id,
            timestamp,
            duration,
            activity_name: entry.name.clone(),
            exception_info: exception_info.clone(),
            data: entry.data,
            remaining,
            variables: slip.variables().clone(),
        });
    services.publisher.publish(&slip, activity_event);

    let slip_event = RoutingSlipEvent::CompensationFailed(RoutingSlipCompensationFailed {
        tracking_number,
        timestamp,
        duration: slip.elapsed(),
        activity_name: entry.name,
        exception_info,
        remaining,
        activity_exceptions: slip.activity_exceptions().to_vec(),
        variables: slip.variables().clone(),
    });
    services.publisher.publish(&slip, slip_event);
    Ok(())
}
