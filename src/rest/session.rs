//! Registration, sign-in, store tokens and access-code onboarding.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::{AppJson, AppState, CurrentUser};
use crate::access_codes::CodeCheck;
use crate::auth::IssuedToken;
use crate::error::AppResult;
use crate::models::{AccessCode, NotificationKind, TokenAudience, UserView};

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: Option<String>,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub token: String,
    pub expires_in: u64,
}

impl From<IssuedToken> for TokenResponse {
    fn from(issued: IssuedToken) -> Self {
        Self {
            token: issued.token,
            expires_in: issued.expires_in,
        }
    }
}

#[derive(Serialize)]
pub struct UserResponse {
    pub success: bool,
    pub user: UserView,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemRequest {
    pub code: String,
    pub flat_number: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemResponse {
    pub success: bool,
    pub user: UserView,
    pub access_code: AccessCode,
}

#[derive(Deserialize)]
pub struct ValidateRequest {
    pub code: String,
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    AppJson(payload): AppJson<RegisterRequest>,
) -> AppResult<(StatusCode, Json<UserResponse>)> {
    let user = state
        .directory
        .register(&payload.email, &payload.password, payload.name)?;
    Ok((
        StatusCode::CREATED,
        Json(UserResponse {
            success: true,
            user: user.into(),
        }),
    ))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    AppJson(payload): AppJson<LoginRequest>,
) -> AppResult<Json<TokenResponse>> {
    let user = state.directory.authenticate(&payload.email, &payload.password)?;
    let issued = state.auth.issue(&user, TokenAudience::Session)?;
    info!(email = %user.email, "signed in");
    Ok(Json(issued.into()))
}

/// Short-lived token for the client-side store, carrying role and community.
pub async fn custom_token(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> AppResult<Json<TokenResponse>> {
    let issued = state.auth.issue(&user, TokenAudience::Store)?;
    Ok(Json(issued.into()))
}

pub async fn redeem_code(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    AppJson(payload): AppJson<RedeemRequest>,
) -> AppResult<Json<RedeemResponse>> {
    let (user, access_code) = state
        .codes
        .redeem(&user.email, &payload.code, payload.flat_number)?;

    let community_name = state
        .communities
        .get(&access_code.community_id)
        .map(|c| c.name)
        .unwrap_or_default();
    let data = json!({
        "userName": user.name.clone().unwrap_or_else(|| user.email.clone()),
        "communityName": community_name,
    });
    if let Err(e) = state
        .notifier
        .send_email(NotificationKind::Welcome, &data, &user.email)
        .await
    {
        warn!(email = %user.email, error = %e, "welcome email failed");
    }

    Ok(Json(RedeemResponse {
        success: true,
        user: user.into(),
        access_code,
    }))
}

pub async fn validate_code(
    State(state): State<Arc<AppState>>,
    AppJson(payload): AppJson<ValidateRequest>,
) -> AppResult<Json<CodeCheck>> {
    Ok(Json(state.codes.check(&payload.code)?))
}
