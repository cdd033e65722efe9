//! `/api/admin`: everything here has already passed the admin role check;
//! community scoping happens in the services.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use super::{AppJson, AppState, CurrentUser};
use crate::amenities::AmenityInput;
use crate::error::{AppError, AppResult};
use crate::models::{
    AccessCode, Amenity, Booking, BookingStatus, Community, CommunityNotification, Invite,
    NotificationKind, Role, User, UserView,
};
use crate::users::require_community_admin;

/// The explicit `communityId`, else the admin's own community.
fn community_scope(actor: &User, requested: Option<String>) -> AppResult<String> {
    requested
        .or_else(|| actor.community_id.clone())
        .ok_or_else(|| AppError::Validation("communityId is required".into()))
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClearRequest {
    /// Must be exactly `CLEAR_ALL_BOOKINGS_CONFIRMED`.
    pub confirmation_token: String,
    pub community_id: Option<String>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClearResponse {
    pub success: bool,
    pub deleted_count: usize,
    pub batches: usize,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerateCodesRequest {
    pub community_id: Option<String>,
    pub code_count: u32,
}

#[derive(Serialize, ToSchema)]
pub struct GenerateCodesResponse {
    pub success: bool,
    pub count: usize,
    pub codes: Vec<AccessCode>,
}

#[derive(Serialize, ToSchema)]
pub struct ReplaceCodeResponse {
    pub success: bool,
    pub invalidated: AccessCode,
    pub code: AccessCode,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunityQuery {
    pub community_id: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct NewCommunity {
    pub name: String,
    pub address: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuery {
    pub community_id: Option<String>,
    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Deserialize, ToSchema)]
pub struct RoleRequest {
    pub role: Role,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InviteRequest {
    pub email: String,
    pub role: Option<Role>,
    pub community_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingQuery {
    pub status: Option<BookingStatus>,
    pub amenity_id: Option<String>,
    pub community_id: Option<String>,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRequest {
    pub title: String,
    pub message: String,
    pub community_id: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/admin/clear-bookings",
    tag = "admin",
    request_body = ClearRequest,
    responses(
        (status = 200, description = "Bookings deleted in batches of at most 500", body = ClearResponse),
        (status = 400, description = "Wrong confirmation token, nothing deleted"),
        (status = 403, description = "Not an admin of that community")
    )
)]
pub async fn clear_bookings(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    AppJson(payload): AppJson<ClearRequest>,
) -> AppResult<Json<ClearResponse>> {
    let report = state.bookings.clear(
        &user,
        &payload.confirmation_token,
        payload.community_id.as_deref(),
    )?;
    Ok(Json(ClearResponse {
        success: true,
        deleted_count: report.deleted_count,
        batches: report.batches,
    }))
}

#[utoipa::path(
    post,
    path = "/api/admin/onboarding/generate-codes",
    tag = "admin",
    request_body = GenerateCodesRequest,
    responses(
        (status = 201, description = "Fresh single-use access codes", body = GenerateCodesResponse),
        (status = 400, description = "codeCount outside 1..=50")
    )
)]
pub async fn generate_codes(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    AppJson(payload): AppJson<GenerateCodesRequest>,
) -> AppResult<(StatusCode, Json<GenerateCodesResponse>)> {
    let community_id = community_scope(&user, payload.community_id)?;
    let codes = state.codes.generate(&user, &community_id, payload.code_count)?;
    Ok((
        StatusCode::CREATED,
        Json(GenerateCodesResponse {
            success: true,
            count: codes.len(),
            codes,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/api/admin/access-codes",
    tag = "admin",
    params(("communityId" = Option<String>, Query, description = "Defaults to the admin's community")),
    responses((status = 200, description = "OK", body = [AccessCode]))
)]
pub async fn list_access_codes(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<CommunityQuery>,
) -> AppResult<Json<Vec<AccessCode>>> {
    let community_id = community_scope(&user, query.community_id)?;
    Ok(Json(state.codes.list(&user, &community_id)?))
}

#[utoipa::path(
    post,
    path = "/api/admin/access-codes/{code}/invalidate",
    tag = "admin",
    params(("code" = String, Path,)),
    responses((status = 200, description = "OK", body = AccessCode), (status = 404, description = "Not found"))
)]
pub async fn invalidate_code(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(code): Path<String>,
) -> AppResult<Json<AccessCode>> {
    Ok(Json(state.codes.invalidate(&user, &code)?))
}

#[utoipa::path(
    post,
    path = "/api/admin/access-codes/{code}/replace",
    tag = "admin",
    params(("code" = String, Path,)),
    responses((status = 200, description = "OK", body = ReplaceCodeResponse), (status = 404, description = "Not found"))
)]
pub async fn replace_code(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(code): Path<String>,
) -> AppResult<Json<ReplaceCodeResponse>> {
    let (invalidated, code) = state.codes.replace(&user, &code)?;
    Ok(Json(ReplaceCodeResponse {
        success: true,
        invalidated,
        code,
    }))
}

#[utoipa::path(
    post,
    path = "/api/admin/communities",
    tag = "admin",
    request_body = NewCommunity,
    responses((status = 201, description = "Created", body = Community), (status = 403, description = "Super admins only"))
)]
pub async fn create_community(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    AppJson(payload): AppJson<NewCommunity>,
) -> AppResult<(StatusCode, Json<Community>)> {
    let community = state
        .communities
        .create(&user, &payload.name, payload.address)?;
    Ok((StatusCode::CREATED, Json(community)))
}

#[utoipa::path(
    get,
    path = "/api/admin/communities",
    tag = "admin",
    responses((status = 200, description = "OK", body = [Community]), (status = 403, description = "Super admins only"))
)]
pub async fn list_communities(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> AppResult<Json<Vec<Community>>> {
    Ok(Json(state.communities.list(&user)?))
}

#[utoipa::path(
    post,
    path = "/api/admin/amenities",
    tag = "admin",
    request_body = AmenityInput,
    responses((status = 201, description = "Created", body = Amenity), (status = 400, description = "Invalid request"))
)]
pub async fn create_amenity(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    AppJson(payload): AppJson<AmenityInput>,
) -> AppResult<(StatusCode, Json<Amenity>)> {
    Ok((StatusCode::CREATED, Json(state.amenities.create(&user, payload)?)))
}

#[utoipa::path(
    put,
    path = "/api/admin/amenities/{id}",
    tag = "admin",
    params(("id" = String, Path,)),
    request_body = AmenityInput,
    responses((status = 200, description = "OK", body = Amenity), (status = 404, description = "Not found"))
)]
pub async fn update_amenity(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
    AppJson(payload): AppJson<AmenityInput>,
) -> AppResult<Json<Amenity>> {
    Ok(Json(state.amenities.update(&user, &id, payload)?))
}

#[utoipa::path(
    delete,
    path = "/api/admin/amenities/{id}",
    tag = "admin",
    params(("id" = String, Path,)),
    responses((status = 204, description = "Deleted"), (status = 404, description = "Not found"))
)]
pub async fn delete_amenity(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    state.amenities.delete(&user, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/admin/users",
    tag = "admin",
    params(
        ("communityId" = Option<String>, Query,),
        ("includeDeleted" = Option<bool>, Query,)
    ),
    responses((status = 200, description = "OK", body = [UserView]))
)]
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<UserQuery>,
) -> AppResult<Json<Vec<UserView>>> {
    let scope = match (query.community_id, user.role) {
        (None, Role::SuperAdmin) => None,
        (requested, _) => Some(community_scope(&user, requested)?),
    };
    if let Some(community_id) = scope.as_deref() {
        require_community_admin(&user, community_id)?;
    }
    let users = state
        .directory
        .list(scope.as_deref(), query.include_deleted)?;
    Ok(Json(users.into_iter().map(UserView::from).collect()))
}

#[utoipa::path(
    delete,
    path = "/api/admin/users/{email}",
    tag = "admin",
    params(("email" = String, Path,)),
    responses((status = 200, description = "OK", body = UserView), (status = 403, description = "Outside the admin's scope"), (status = 404, description = "Not found"))
)]
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(email): Path<String>,
) -> AppResult<Json<UserView>> {
    Ok(Json(state.directory.soft_delete(&user, &email)?.into()))
}

#[utoipa::path(
    post,
    path = "/api/admin/users/{email}/restore",
    tag = "admin",
    params(("email" = String, Path,)),
    responses((status = 200, description = "OK", body = UserView), (status = 404, description = "Not found"))
)]
pub async fn restore_user(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(email): Path<String>,
) -> AppResult<Json<UserView>> {
    Ok(Json(state.directory.restore(&user, &email)?.into()))
}

#[utoipa::path(
    put,
    path = "/api/admin/users/{email}/role",
    tag = "admin",
    params(("email" = String, Path,)),
    request_body = RoleRequest,
    responses((status = 200, description = "OK", body = UserView), (status = 403, description = "Outside the admin's scope"))
)]
pub async fn set_role(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(email): Path<String>,
    AppJson(payload): AppJson<RoleRequest>,
) -> AppResult<Json<UserView>> {
    Ok(Json(state.directory.set_role(&user, &email, payload.role)?.into()))
}

#[utoipa::path(
    post,
    path = "/api/admin/invites",
    tag = "admin",
    request_body = InviteRequest,
    responses((status = 201, description = "Created", body = Invite), (status = 409, description = "Address belongs to another community"))
)]
pub async fn invite(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    AppJson(payload): AppJson<InviteRequest>,
) -> AppResult<(StatusCode, Json<Invite>)> {
    let community_id = community_scope(&user, payload.community_id)?;
    let invite = state.directory.invite(
        &user,
        &payload.email,
        payload.role.unwrap_or(Role::Resident),
        &community_id,
    )?;
    Ok((StatusCode::CREATED, Json(invite)))
}

#[utoipa::path(
    get,
    path = "/api/admin/bookings",
    tag = "admin",
    params(
        ("status" = Option<BookingStatus>, Query,),
        ("amenityId" = Option<String>, Query,),
        ("communityId" = Option<String>, Query,)
    ),
    responses((status = 200, description = "OK", body = [Booking]))
)]
pub async fn list_bookings(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<BookingQuery>,
) -> AppResult<Json<Vec<Booking>>> {
    let community_id = community_scope(&user, query.community_id)?;
    Ok(Json(state.bookings.list_for_community(
        &user,
        &community_id,
        query.status,
        query.amenity_id.as_deref(),
    )?))
}

#[utoipa::path(
    post,
    path = "/api/admin/notifications",
    tag = "admin",
    request_body = BroadcastRequest,
    responses((status = 201, description = "Created", body = CommunityNotification), (status = 400, description = "Invalid request"))
)]
pub async fn broadcast(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    AppJson(payload): AppJson<BroadcastRequest>,
) -> AppResult<(StatusCode, Json<CommunityNotification>)> {
    let community_id = community_scope(&user, payload.community_id)?;
    require_community_admin(&user, &community_id)?;
    let (title, message) = (payload.title.trim(), payload.message.trim());
    if title.is_empty() || message.is_empty() {
        return Err(AppError::Validation("title and message are required".into()));
    }
    let notification = state.notifier.record_in_app(
        &community_id,
        None,
        NotificationKind::CommunityAnnouncement,
        title.to_string(),
        message.to_string(),
        None,
    )?;
    info!(community = %community_id, by = %user.email, "announcement posted");
    Ok((StatusCode::CREATED, Json(notification)))
}
