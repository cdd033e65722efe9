//! REST API (axum, port 11111 by default).
//!
//! Handlers are grouped by audience: sessions and profile for everyone,
//! bookings and notifications for signed-in members, `/api/admin` for
//! community admins, and `/api/cron` for the external scheduler. Every
//! handler returns `Result<_, AppError>` so failures share one JSON shape.

use std::sync::Arc;

use axum::{
    extract::{FromRequest, Request, State},
    http::header,
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Serialize;
use tracing::debug;

use crate::access_codes::AccessCodes;
use crate::amenities::AmenityCatalog;
use crate::auth::{bearer_token, Authenticator};
use crate::booking::BookingService;
use crate::clock::Clock;
use crate::communities::Communities;
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::models::{TokenAudience, User};
use crate::notifications::{Mailer, Notifier};
use crate::storage::Storage;
use crate::sweep::Sweeper;
use crate::users::UserDirectory;

mod admin;
mod bookings;
mod cron;
mod members;
mod openapi;
mod session;

pub use openapi::ApiDoc;

/// Everything a handler needs, built once in `main` and shared through
/// axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub storage: Storage,
    pub auth: Authenticator,
    pub directory: UserDirectory,
    pub amenities: AmenityCatalog,
    pub codes: AccessCodes,
    pub communities: Communities,
    pub bookings: BookingService,
    pub notifier: Notifier,
    pub sweeper: Sweeper,
}

impl AppState {
    pub fn new(config: AppConfig, storage: Storage, clock: Arc<dyn Clock>, mailer: Arc<dyn Mailer>) -> Self {
        let auth = Authenticator::new(&config.auth);
        let directory = UserDirectory::new(storage.clone(), clock.clone(), auth.clone());
        let amenities = AmenityCatalog::new(storage.clone(), clock.clone(), config.amenity_cache_ttl);
        let codes = AccessCodes::new(storage.clone(), clock.clone(), config.access_code_validity_days);
        let communities = Communities::new(storage.clone(), clock.clone());
        let notifier = Notifier::new(mailer, storage.clone(), clock.clone(), config.mail.from.clone());
        let bookings = BookingService::new(storage.clone(), clock.clone(), amenities.clone(), notifier.clone());
        let sweeper = Sweeper::new(storage.clone(), clock, bookings.clone(), config.sweep.clone());
        Self {
            config: Arc::new(config),
            storage,
            auth,
            directory,
            amenities,
            codes,
            communities,
            bookings,
            notifier,
            sweeper,
        }
    }
}

/// JSON request body; malformed or incomplete bodies become a 400 with the
/// usual error shape.
#[derive(FromRequest, Default)]
#[from_request(via(Json), rejection(AppError))]
pub struct AppJson<T>(pub T);

/// The signed-in user, loaded fresh from the store for every request.
#[derive(Clone, Debug)]
pub struct CurrentUser(pub User);

#[derive(Serialize)]
pub struct RestResponse {
    pub success: bool,
    pub message: String,
}

impl RestResponse {
    pub fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

fn header_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> AppResult<Response> {
    let token = header_token(&req)
        .ok_or_else(|| AppError::Unauthorized("Missing bearer token".into()))?;
    let claims = state.auth.validate(token, TokenAudience::Session)?;
    let user = state
        .directory
        .get(&claims.sub)
        .map_err(|_| AppError::Unauthorized("Account no longer exists".into()))?;
    if user.deleted {
        return Err(AppError::Forbidden("This account has been deactivated".into()));
    }

    req.extensions_mut().insert(CurrentUser(user));
    Ok(next.run(req).await)
}

async fn admin_middleware(req: Request, next: Next) -> AppResult<Response> {
    let is_admin = req
        .extensions()
        .get::<CurrentUser>()
        .is_some_and(|CurrentUser(user)| user.role.is_admin());
    if !is_admin {
        return Err(AppError::Forbidden("Admin access required".into()));
    }
    Ok(next.run(req).await)
}

/// With `CRON_SECRET` set, sweeps need `Authorization: Bearer <secret>`.
async fn cron_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> AppResult<Response> {
    if let Some(secret) = state.config.cron_secret.as_deref() {
        if header_token(&req) != Some(secret) {
            return Err(AppError::Unauthorized("Invalid cron secret".into()));
        }
    } else {
        debug!("CRON_SECRET not set, cron endpoints are open");
    }
    Ok(next.run(req).await)
}

async fn health_handler() -> Json<RestResponse> {
    RestResponse::ok("ok")
}

async fn openapi_handler() -> Json<utoipa::openapi::OpenApi> {
    use utoipa::OpenApi;
    Json(ApiDoc::openapi())
}

pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    let admin_routes = Router::new()
        .route("/clear-bookings", post(admin::clear_bookings))
        .route("/onboarding/generate-codes", post(admin::generate_codes))
        .route("/access-codes", get(admin::list_access_codes))
        .route("/access-codes/:code/invalidate", post(admin::invalidate_code))
        .route("/access-codes/:code/replace", post(admin::replace_code))
        .route("/communities", post(admin::create_community).get(admin::list_communities))
        .route("/amenities", post(admin::create_amenity))
        .route("/amenities/:id", put(admin::update_amenity).delete(admin::delete_amenity))
        .route("/users", get(admin::list_users))
        .route("/users/:email", delete(admin::delete_user))
        .route("/users/:email/restore", post(admin::restore_user))
        .route("/users/:email/role", put(admin::set_role))
        .route("/invites", post(admin::invite))
        .route("/bookings", get(admin::list_bookings))
        .route("/notifications", post(admin::broadcast))
        .route_layer(middleware::from_fn(admin_middleware));

    let member_routes = Router::new()
        .route("/auth/custom-token", post(session::custom_token))
        .route("/auth/redeem-code", post(session::redeem_code))
        .route("/users/me", get(members::me).put(members::update_me))
        .route("/amenities", get(members::list_amenities))
        .route("/amenities/:id", get(members::get_amenity))
        .route("/bookings", post(bookings::create).get(bookings::list_mine))
        .route("/bookings/:id", get(bookings::get_one))
        .route("/bookings/:id/cancel", post(bookings::cancel))
        .route("/bookings/:id/confirm", post(bookings::confirm))
        .route("/bookings/:id/decline", post(bookings::decline))
        .route("/notifications", get(members::list_notifications))
        .route("/notifications/email", post(members::send_email))
        .route("/notifications/:id/read", post(members::mark_read))
        .nest("/admin", admin_routes)
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let cron_routes = Router::new()
        .route("/expire-waitlist", get(cron::expire_waitlist).post(cron::expire_waitlist))
        .route("/booking-reminders", get(cron::booking_reminders))
        .route("/complete-bookings", get(cron::complete_bookings).post(cron::complete_bookings))
        .route_layer(middleware::from_fn_with_state(state.clone(), cron_middleware));

    let public_routes = Router::new()
        .route("/auth/register", post(session::register))
        .route("/auth/login", post(session::login))
        .route("/access-codes/validate", post(session::validate_code))
        .route("/openapi.json", get(openapi_handler));

    let api = Router::new()
        .merge(public_routes)
        .merge(member_routes)
        .nest("/cron", cron_routes);

    Router::new()
        .route("/health", get(health_handler))
        .nest("/api", api)
        .with_state(state)
}

#[cfg(test)]
mod testing {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notifications::MemoryMailer;
    use chrono::{TimeZone, Utc};

    pub fn app(cron_secret: Option<&str>) -> AppState {
        let mut config = AppConfig::default();
        config.auth.bcrypt_cost = 4;
        config.sweep.expiry_delay = std::time::Duration::ZERO;
        config.cron_secret = cron_secret.map(str::to_string);
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2030, 5, 1, 8, 0, 0).unwrap()));
        AppState::new(config, Storage::temporary().unwrap(), clock, Arc::new(MemoryMailer::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::app;
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request as HttpRequest, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn call(router: Router, req: HttpRequest<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, token: Option<&str>, body: Value) -> HttpRequest<Body> {
        let mut builder = HttpRequest::post(uri).header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let router = create_router(app(None));
        let (status, body) = call(router, HttpRequest::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn member_routes_need_a_session_token() {
        let router = create_router(app(None));
        let (status, body) = call(
            router,
            HttpRequest::get("/api/bookings").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn cron_secret_is_enforced_when_configured() {
        let router = create_router(app(Some("s3cret")));

        let (status, _) = call(
            router.clone(),
            HttpRequest::get("/api/cron/expire-waitlist").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(
            router,
            post_json("/api/cron/expire-waitlist", Some("s3cret"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["checked"], 0);
        assert!(body.get("errors").is_none());
    }

    #[tokio::test]
    async fn residents_are_kept_out_of_admin_routes() {
        let router = create_router(app(None));

        let (status, _) = call(
            router.clone(),
            post_json(
                "/api/auth/register",
                None,
                json!({ "email": "ana@example.com", "password": "correct horse" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, login) = call(
            router.clone(),
            post_json(
                "/api/auth/login",
                None,
                json!({ "email": "ana@example.com", "password": "correct horse" }),
            ),
        )
        .await;
        let token = login["token"].as_str().unwrap().to_string();

        let (status, body) = call(
            router,
            post_json(
                "/api/admin/clear-bookings",
                Some(token.as_str()),
                json!({ "confirmationToken": "CLEAR_ALL_BOOKINGS_CONFIRMED" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Admin access required");
    }

    #[tokio::test]
    async fn bad_request_bodies_get_the_error_shape() {
        let router = create_router(app(None));

        let (status, body) = call(
            router.clone(),
            post_json("/api/auth/register", None, json!({ "email": "ana@example.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("password"));

        let truncated = HttpRequest::post("/api/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"email\": "))
            .unwrap();
        let (status, body) = call(router, truncated).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn openapi_document_lists_cron_paths() {
        let router = create_router(app(None));
        let (status, body) = call(
            router,
            HttpRequest::get("/api/openapi.json").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["paths"]["/api/cron/expire-waitlist"].is_object());
        assert!(body["paths"]["/api/admin/clear-bookings"].is_object());
    }
}
