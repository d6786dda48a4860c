//! Runs a trip-booking routing slip against an in-process engine.
//!
//! The slip reserves a hotel, rents a car and charges a card. With
//! `--decline-card` the charge faults and the car and hotel are released
//! again, most recent first. Prints the tracked outcome as JSON.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use courier::{
    CompensateActivity, CompensateContext, CompensationResult, Config, EngineBuilder,
    ExecuteActivity, ExecuteContext, ExecutionResult, RoutingSlipBuilder,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "courier-demo")]
#[command(about = "Book a trip with a routing slip and watch it compensate")]
struct Cli {
    /// Guest the trip is booked for
    #[arg(long, default_value = "Ada")]
    guest: String,

    /// Hotel nights to reserve
    #[arg(long, default_value_t = 3)]
    nights: u32,

    /// Amount to charge, in cents
    #[arg(long, default_value_t = 42_000)]
    amount: u64,

    /// Make the card charge fault so the booking unwinds
    #[arg(long)]
    decline_card: bool,

    /// Seconds to wait for the slip to finish (overrides COURIER_AWAIT_TIMEOUT_SECS)
    #[arg(long)]
    timeout_secs: Option<u64>,
}

// ============================================================================
// Activities
// ============================================================================

#[derive(Debug, Deserialize)]
struct ReserveHotelArguments {
    #[serde(rename = "Guest")]
    guest: String,
    #[serde(rename = "Nights")]
    nights: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct HotelReservation {
    reservation_id: Uuid,
    guest: String,
}

struct ReserveHotel;

#[async_trait]
impl ExecuteActivity for ReserveHotel {
    type Arguments = ReserveHotelArguments;

    async fn execute(&self, ctx: ExecuteContext<ReserveHotelArguments>) -> Result<ExecutionResult> {
        let arguments = ctx.arguments();
        let reservation = HotelReservation {
            reservation_id: Uuid::new_v4(),
            guest: arguments.guest.clone(),
        };
        tracing::info!(
            guest = %arguments.guest,
            nights = arguments.nights,
            reservation_id = %reservation.reservation_id,
            "hotel reserved"
        );
        Ok(ctx.completed_with_variables(
            &reservation,
            &serde_json::json!({ "HotelReservation": reservation.reservation_id }),
        )?)
    }
}

#[async_trait]
impl CompensateActivity for ReserveHotel {
    type Log = HotelReservation;

    async fn compensate(&self, ctx: CompensateContext<HotelReservation>) -> Result<CompensationResult> {
        let reservation = ctx.log();
        tracing::info!(
            guest = %reservation.guest,
            reservation_id = %reservation.reservation_id,
            "hotel reservation cancelled"
        );
        Ok(ctx.compensated())
    }
}

#[derive(Debug, Deserialize)]
struct RentCarArguments {
    #[serde(rename = "Guest")]
    guest: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CarRental {
    rental_id: Uuid,
}

struct RentCar;

#[async_trait]
impl ExecuteActivity for RentCar {
    type Arguments = RentCarArguments;

    async fn execute(&self, ctx: ExecuteContext<RentCarArguments>) -> Result<ExecutionResult> {
        let rental = CarRental {
            rental_id: Uuid::new_v4(),
        };
        tracing::info!(guest = %ctx.arguments().guest, rental_id = %rental.rental_id, "car rented");
        Ok(ctx.completed_with_log(&rental)?)
    }
}

#[async_trait]
impl CompensateActivity for RentCar {
    type Log = CarRental;

    async fn compensate(&self, ctx: CompensateContext<CarRental>) -> Result<CompensationResult> {
        tracing::info!(rental_id = %ctx.log().rental_id, "car rental returned");
        Ok(ctx.compensated())
    }
}

#[derive(Debug, Deserialize)]
struct ChargeCardArguments {
    #[serde(rename = "Amount")]
    amount: u64,
    #[serde(rename = "Decline", default)]
    decline: bool,
}

struct ChargeCard;

#[async_trait]
impl ExecuteActivity for ChargeCard {
    type Arguments = ChargeCardArguments;

    async fn execute(&self, ctx: ExecuteContext<ChargeCardArguments>) -> Result<ExecutionResult> {
        let arguments = ctx.arguments();
        if arguments.decline {
            return Err(anyhow!("card declined for {} cents", arguments.amount));
        }
        tracing::info!(amount = arguments.amount, "card charged");
        Ok(ctx.completed())
    }
}

// ============================================================================
// Output
// ============================================================================

#[derive(Serialize)]
struct Outcome {
    tracking_number: String,
    state: String,
    completed: Vec<String>,
    compensated: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    faulted_activity: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,courier=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(secs) = cli.timeout_secs {
        config.await_timeout = Duration::from_secs(secs);
    }
    tracing::info!(base_address = %config.base_address, "Configuration loaded");

    let handle = EngineBuilder::new()
        .with_config(config)
        .with_activity("ReserveHotel", ReserveHotel)
        .with_activity("RentCar", RentCar)
        .with_execute_activity("ChargeCard", ChargeCard)
        .build()
        .context("Failed to build engine")?
        .start()
        .await
        .context("Failed to start engine")?;

    let mut builder = RoutingSlipBuilder::default();
    builder.add_variable("Guest", &cli.guest)?;
    builder.add_activity_with_arguments(
        "ReserveHotel",
        handle.execute_address("ReserveHotel")?,
        &serde_json::json!({ "Nights": cli.nights }),
    )?;
    builder.add_activity("RentCar", handle.execute_address("RentCar")?);
    builder.add_activity_with_arguments(
        "ChargeCard",
        handle.execute_address("ChargeCard")?,
        &serde_json::json!({ "Amount": cli.amount, "Decline": cli.decline_card }),
    )?;
    let slip = builder.build()?;
    tracing::info!(tracking_number = %slip.tracking_number(), "Booking trip");

    let instance = handle
        .execute_and_await(slip)
        .await
        .context("Booking did not finish")?;
    handle.abort();

    let outcome = Outcome {
        tracking_number: instance.tracking_number.to_string(),
        state: instance.state.to_string(),
        completed: instance.completed,
        compensated: instance.compensated,
        faulted_activity: instance.faulted_activity,
    };
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    Ok(())
}
