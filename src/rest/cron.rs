//! Sweep triggers for the external scheduler.

use std::sync::Arc;

use axum::{extract::State, Json};

use super::AppState;
use crate::error::AppResult;
use crate::sweep::{CompletionReport, ExpiryReport, ReminderReport};

#[utoipa::path(
    post,
    path = "/api/cron/expire-waitlist",
    tag = "cron",
    responses(
        (status = 200, description = "Sweep ran; per-booking failures are listed", body = ExpiryReport),
        (status = 401, description = "Missing or wrong cron secret")
    )
)]
pub async fn expire_waitlist(State(state): State<Arc<AppState>>) -> AppResult<Json<ExpiryReport>> {
    Ok(Json(state.sweeper.expire_waitlist().await?))
}

#[utoipa::path(
    get,
    path = "/api/cron/booking-reminders",
    tag = "cron",
    responses(
        (status = 200, description = "Reminders sent for bookings starting about an hour from now", body = ReminderReport),
        (status = 401, description = "Missing or wrong cron secret")
    )
)]
pub async fn booking_reminders(State(state): State<Arc<AppState>>) -> AppResult<Json<ReminderReport>> {
    Ok(Json(state.sweeper.booking_reminders().await?))
}

#[utoipa::path(
    post,
    path = "/api/cron/complete-bookings",
    tag = "cron",
    responses(
        (status = 200, description = "Finished confirmed bookings marked completed", body = CompletionReport),
        (status = 401, description = "Missing or wrong cron secret")
    )
)]
pub async fn complete_bookings(State(state): State<Arc<AppState>>) -> AppResult<Json<CompletionReport>> {
    Ok(Json(state.sweeper.complete_bookings().await?))
}
