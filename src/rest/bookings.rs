use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde::{Deserialize, Serialize};

use super::{AppJson, AppState, CurrentUser};
use crate::booking::{BookingChange, NewBooking};
use crate::error::AppResult;
use crate::models::Booking;

#[derive(Serialize)]
pub struct BookingResponse {
    pub success: bool,
    pub booking: Booking,
}

#[derive(Serialize)]
pub struct ChangeResponse {
    pub success: bool,
    #[serde(flatten)]
    pub change: BookingChange,
}

#[derive(Deserialize, Default)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    AppJson(payload): AppJson<NewBooking>,
) -> AppResult<(StatusCode, Json<BookingResponse>)> {
    let booking = state.bookings.create(&user, payload).await?;
    Ok((
        StatusCode::CREATED,
        Json(BookingResponse {
            success: true,
            booking,
        }),
    ))
}

pub async fn list_mine(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> AppResult<Json<Vec<Booking>>> {
    Ok(Json(state.bookings.list_for_user(&user.email)?))
}

pub async fn get_one(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> AppResult<Json<Booking>> {
    Ok(Json(state.bookings.get(&user, &id)?))
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
    payload: Option<AppJson<CancelRequest>>,
) -> AppResult<Json<ChangeResponse>> {
    let AppJson(payload) = payload.unwrap_or_default();
    let change = state.bookings.cancel(&user, &id, payload.reason).await?;
    Ok(Json(ChangeResponse {
        success: true,
        change,
    }))
}

pub async fn confirm(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> AppResult<Json<BookingResponse>> {
    let booking = state.bookings.confirm(&user, &id).await?;
    Ok(Json(BookingResponse {
        success: true,
        booking,
    }))
}

pub async fn decline(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> AppResult<Json<ChangeResponse>> {
    let change = state.bookings.decline(&user, &id).await?;
    Ok(Json(ChangeResponse {
        success: true,
        change,
    }))
}
