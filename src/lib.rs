//! CircleIn: community amenity booking.
//!
//! Residents of a gated community book shared amenities through a JSON API.
//! State lives in an embedded Sled document store; bookings move through a
//! small lifecycle (confirmed, waitlist, pending confirmation, then
//! completed, cancelled or expired) and external cron calls drive the expiry,
//! reminder and completion sweeps.

pub mod access_codes;
pub mod amenities;
pub mod auth;
pub mod booking;
pub mod cache;
pub mod clock;
pub mod communities;
pub mod config;
pub mod error;
pub mod models;
pub mod notifications;
// REST API: axum handlers, auth/admin/cron middleware, OpenAPI document
pub mod rest;
pub mod storage;
pub mod sweep;
pub mod users;
