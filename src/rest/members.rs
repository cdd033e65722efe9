use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AppJson, AppState, CurrentUser};
use crate::error::{AppError, AppResult};
use crate::models::{Amenity, CommunityNotification, NotificationKind, Role, UserView};
use crate::users::ProfileUpdate;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRequest {
    pub name: Option<String>,
    pub flat_number: Option<String>,
    pub phone: Option<String>,
}

#[derive(Deserialize)]
pub struct EmailRequest {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default)]
    pub data: Value,
    pub to: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailResponse {
    pub success: bool,
    pub message_id: String,
}

pub async fn me(Extension(CurrentUser(user)): Extension<CurrentUser>) -> Json<UserView> {
    Json(user.into())
}

pub async fn update_me(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    AppJson(payload): AppJson<ProfileRequest>,
) -> AppResult<Json<UserView>> {
    let updated = state.directory.update_profile(
        &user.email,
        ProfileUpdate {
            name: payload.name,
            flat_number: payload.flat_number,
            phone: payload.phone,
        },
    )?;
    Ok(Json(updated.into()))
}

pub async fn list_amenities(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> AppResult<Json<Vec<Amenity>>> {
    let Some(community_id) = user.community_id.as_deref() else {
        return Ok(Json(vec![]));
    };
    Ok(Json(state.amenities.list(community_id, user.role.is_admin())?))
}

pub async fn get_amenity(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> AppResult<Json<Amenity>> {
    let amenity = state.amenities.get(&id)?;
    let visible = user.role == Role::SuperAdmin
        || user.community_id.as_deref() == Some(amenity.community_id.as_str());
    if !visible {
        return Err(AppError::NotFound(format!("Amenity {id} not found")));
    }
    Ok(Json(amenity))
}

/// Send a templated email. Residents can only mail themselves.
pub async fn send_email(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    AppJson(payload): AppJson<EmailRequest>,
) -> AppResult<Json<EmailResponse>> {
    let to = payload.to.unwrap_or_else(|| user.email.clone());
    if !to.eq_ignore_ascii_case(&user.email) && !user.role.is_admin() {
        return Err(AppError::Forbidden("You can only send notifications to yourself".into()));
    }
    let message_id = state.notifier.send_email(payload.kind, &payload.data, &to).await?;
    Ok(Json(EmailResponse {
        success: true,
        message_id,
    }))
}

pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> AppResult<Json<Vec<CommunityNotification>>> {
    Ok(Json(state.notifier.list_for(&user)?))
}

pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> AppResult<Json<CommunityNotification>> {
    Ok(Json(state.notifier.mark_read(&user, &id)?))
}
