//! Notification dispatch: template rendering, the `Mailer` seam, and in-app
//! notification documents.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::models::{Booking, CommunityNotification, NotificationKind, User};
use crate::storage::{Collection, Storage};

const MAIL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver one message and return the provider's message id.
    async fn send(&self, email: &OutgoingEmail) -> AppResult<String>;
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Header-safe text: line breaks and other control characters become spaces.
fn single_line(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

fn raw_field(data: &Value, key: &str, fallback: &str) -> String {
    match data.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => fallback.to_string(),
        Some(other) => other.to_string(),
    }
}

/// Payload value for the HTML body.
fn field(data: &Value, key: &str, fallback: &str) -> String {
    escape_html(&raw_field(data, key, fallback))
}

/// Payload value for a subject line.
fn text(data: &Value, key: &str, fallback: &str) -> String {
    single_line(&raw_field(data, key, fallback))
}

fn layout(heading: &str, body: &str) -> String {
    format!(
        "<div style=\"font-family:sans-serif;max-width:560px;margin:auto\">\
         <h2>{heading}</h2>{body}\
         <p style=\"color:#888;font-size:12px\">CircleIn · your community, booked.</p></div>"
    )
}

fn slot_lines(data: &Value) -> String {
    format!(
        "<p><strong>{}</strong><br>{} to {}</p>",
        field(data, "amenityName", "your amenity"),
        field(data, "startTime", "?"),
        field(data, "endTime", "?"),
    )
}

/// Map a template key and its payload to a subject and HTML body. The subject
/// is plain single-line text; payload values in the body are HTML-escaped.
pub fn render(kind: NotificationKind, data: &Value) -> RenderedEmail {
    let name = field(data, "userName", "there");
    let amenity = text(data, "amenityName", "your amenity");
    match kind {
        NotificationKind::BookingConfirmation => RenderedEmail {
            subject: format!("Booking confirmed: {amenity}"),
            html: layout(
                "Your booking is confirmed",
                &format!("<p>Hi {name},</p>{}", slot_lines(data)),
            ),
        },
        NotificationKind::BookingCancellation => RenderedEmail {
            subject: format!("Booking cancelled: {amenity}"),
            html: layout(
                "Your booking was cancelled",
                &format!(
                    "<p>Hi {name},</p>{}<p>Reason: {}</p>",
                    slot_lines(data),
                    field(data, "reason", "not given")
                ),
            ),
        },
        NotificationKind::BookingReminder => RenderedEmail {
            subject: format!("Reminder: {amenity} starts soon"),
            html: layout(
                "Your booking starts in about an hour",
                &format!("<p>Hi {name},</p>{}", slot_lines(data)),
            ),
        },
        NotificationKind::WaitlistJoined => RenderedEmail {
            subject: format!("You're on the waitlist for {amenity}"),
            html: layout(
                "You joined the waitlist",
                &format!(
                    "<p>Hi {name},</p>{}<p>Your position: #{}</p>",
                    slot_lines(data),
                    field(data, "waitlistPosition", "?")
                ),
            ),
        },
        NotificationKind::WaitlistPromotion => RenderedEmail {
            subject: format!("A spot opened up at {amenity}"),
            html: layout(
                "You've been promoted from the waitlist",
                &format!(
                    "<p>Hi {name},</p>{}<p>Please confirm your booking to keep the spot.</p>",
                    slot_lines(data)
                ),
            ),
        },
        NotificationKind::WaitlistExpired => RenderedEmail {
            subject: format!("Waitlist expired: {amenity}"),
            html: layout(
                "Your waitlist entry expired",
                &format!(
                    "<p>Hi {name},</p>{}<p>{}</p>",
                    slot_lines(data),
                    field(data, "reason", "The time slot has passed.")
                ),
            ),
        },
        NotificationKind::Welcome => RenderedEmail {
            subject: format!("Welcome to {}", text(data, "communityName", "CircleIn")),
            html: layout(
                "Welcome aboard",
                &format!(
                    "<p>Hi {name},</p><p>You can now book amenities in {}.</p>",
                    field(data, "communityName", "your community")
                ),
            ),
        },
        NotificationKind::CommunityAnnouncement => RenderedEmail {
            subject: text(data, "title", "Community announcement"),
            html: layout(
                &field(data, "title", "Community announcement"),
                &format!("<p>{}</p>", field(data, "message", "")),
            ),
        },
    }
}

pub fn booking_payload(booking: &Booking) -> Value {
    json!({
        "bookingId": booking.id,
        "userName": booking.user_name.clone().unwrap_or_else(|| booking.user_email.clone()),
        "amenityName": booking.amenity_name,
        "startTime": booking.start_time.to_rfc3339(),
        "endTime": booking.end_time.to_rfc3339(),
        "status": booking.status.as_str(),
        "waitlistPosition": booking.waitlist_position,
        "reason": booking
            .cancellation_reason
            .clone()
            .or_else(|| booking.expired_reason.clone()),
    })
}

/// Sends through an HTTP mail relay that accepts a base64url raw MIME
/// message, the same body shape as the Gmail send API.
pub struct HttpMailer {
    client: Client,
    relay_url: String,
    api_key: Option<String>,
}

impl HttpMailer {
    pub fn new(relay_url: String, api_key: Option<String>) -> AppResult<Self> {
        Self::with_timeout(relay_url, api_key, MAIL_TIMEOUT)
    }

    /// A relay that does not answer within `timeout` fails the send.
    pub fn with_timeout(relay_url: String, api_key: Option<String>, timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Mail(format!("cannot build mail client: {e}")))?;
        Ok(Self {
            client,
            relay_url,
            api_key,
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, email: &OutgoingEmail) -> AppResult<String> {
        let message = format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/html; charset=UTF-8\r\n\r\n{}",
            single_line(&email.from),
            single_line(&email.to),
            single_line(&email.subject),
            email.html
        );
        let raw = general_purpose::URL_SAFE_NO_PAD.encode(message.as_bytes());

        let mut request = self.client.post(&self.relay_url).json(&json!({ "raw": raw }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AppError::Mail(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Mail(format!("relay returned {status}: {body}")));
        }

        let body: Value = response.json().await.unwrap_or(Value::Null);
        Ok(body
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string()))
    }
}

/// Used when no relay is configured: logs the message and pretends it left.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &OutgoingEmail) -> AppResult<String> {
        let id = Uuid::new_v4().to_string();
        info!(to = %email.to, subject = %email.subject, message_id = %id, "email (not delivered, no relay configured)");
        Ok(id)
    }
}

/// Keeps every message in memory; can be switched to fail.
#[derive(Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
    failing: AtomicBool,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, email: &OutgoingEmail) -> AppResult<String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Mail("memory mailer set to fail".into()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(email.clone());
        Ok(Uuid::new_v4().to_string())
    }
}

#[derive(Clone)]
pub struct Notifier {
    mailer: Arc<dyn Mailer>,
    storage: Storage,
    clock: Arc<dyn Clock>,
    from: String,
}

impl Notifier {
    pub fn new(mailer: Arc<dyn Mailer>, storage: Storage, clock: Arc<dyn Clock>, from: String) -> Self {
        Self {
            mailer,
            storage,
            clock,
            from,
        }
    }

    pub async fn send_email(&self, kind: NotificationKind, data: &Value, to: &str) -> AppResult<String> {
        if !to.contains('@') || to.chars().any(char::is_control) {
            return Err(AppError::Validation(format!("Invalid recipient {to}")));
        }
        let rendered = render(kind, data);
        let email = OutgoingEmail {
            from: self.from.clone(),
            to: to.to_string(),
            subject: rendered.subject,
            html: rendered.html,
        };
        let id = self.mailer.send(&email).await?;
        info!(?kind, to, message_id = %id, "email sent");
        Ok(id)
    }

    pub fn record_in_app(
        &self,
        community_id: &str,
        user_email: Option<&str>,
        kind: NotificationKind,
        title: String,
        message: String,
        booking_id: Option<&str>,
    ) -> AppResult<CommunityNotification> {
        let notification = CommunityNotification {
            id: Uuid::new_v4().to_string(),
            community_id: community_id.to_string(),
            user_email: user_email.map(str::to_string),
            kind,
            title,
            message,
            booking_id: booking_id.map(str::to_string),
            read: false,
            created_at: self.clock.now(),
        };
        self.storage
            .put(Collection::CommunityNotifications, &notification.id, &notification)?;
        Ok(notification)
    }

    /// Email plus in-app entry for a booking event. Delivery problems are
    /// logged and never fail the calling operation.
    pub async fn booking_event(&self, kind: NotificationKind, booking: &Booking) {
        let data = booking_payload(booking);
        let rendered = render(kind, &data);
        if let Err(e) = self.record_in_app(
            &booking.community_id,
            Some(booking.user_email.as_str()),
            kind,
            rendered.subject,
            format!(
                "{} · {} to {}",
                booking.amenity_name,
                booking.start_time.format("%Y-%m-%d %H:%M"),
                booking.end_time.format("%H:%M")
            ),
            Some(booking.id.as_str()),
        ) {
            warn!(booking_id = %booking.id, error = %e, "failed to store in-app notification");
        }
        if let Err(e) = self.send_email(kind, &data, &booking.user_email).await {
            warn!(booking_id = %booking.id, ?kind, error = %e, "failed to send booking email");
        }
    }

    /// Notifications addressed to the user plus broadcasts to their
    /// community, newest first.
    pub fn list_for(&self, user: &User) -> AppResult<Vec<CommunityNotification>> {
        let Some(community_id) = user.community_id.as_deref() else {
            return Ok(vec![]);
        };
        let mut items: Vec<CommunityNotification> =
            self.storage
                .find(Collection::CommunityNotifications, |n: &CommunityNotification| {
                    n.community_id == community_id
                        && n.user_email.as_deref().map_or(true, |e| e == user.email)
                })?;
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items)
    }

    pub fn mark_read(&self, user: &User, id: &str) -> AppResult<CommunityNotification> {
        let mut notification: CommunityNotification = self
            .storage
            .get(Collection::CommunityNotifications, id)?
            .ok_or_else(|| AppError::NotFound(format!("Notification {id} not found")))?;
        let visible = user.community_id.as_deref() == Some(notification.community_id.as_str())
            && notification
                .user_email
                .as_deref()
                .map_or(true, |e| e == user.email);
        if !visible {
            return Err(AppError::NotFound(format!("Notification {id} not found")));
        }
        notification.read = true;
        self.storage
            .put(Collection::CommunityNotifications, id, &notification)?;
        Ok(notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;

    #[test]
    fn render_escapes_payload_values() {
        let rendered = render(
            NotificationKind::BookingConfirmation,
            &json!({ "amenityName": "<Pool>", "userName": "Ana & Bo" }),
        );
        assert_eq!(rendered.subject, "Booking confirmed: <Pool>");
        assert!(rendered.html.contains("&lt;Pool&gt;"));
        assert!(rendered.html.contains("Ana &amp; Bo"));
        assert!(!rendered.html.contains("<Pool>"));
    }

    #[tokio::test]
    async fn silent_relay_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mailer = HttpMailer::with_timeout(
            format!("http://{addr}/send"),
            None,
            Duration::from_millis(200),
        )
        .unwrap();
        let email = OutgoingEmail {
            from: "no-reply@circlein.app".into(),
            to: "ana@example.com".into(),
            subject: "Hello".into(),
            html: "<p>Hi</p>".into(),
        };
        let err = mailer.send(&email).await.unwrap_err();
        assert!(matches!(err, AppError::Mail(_)));
        server.abort();
    }

    #[test]
    fn subjects_stay_on_one_line() {
        let rendered = render(
            NotificationKind::BookingConfirmation,
            &json!({ "amenityName": "Pool\r\nBcc: someone@example.com" }),
        );
        assert!(!rendered.subject.contains('\r'));
        assert!(!rendered.subject.contains('\n'));
        assert_eq!(rendered.subject, "Booking confirmed: Pool  Bcc: someone@example.com");

        let announcement = render(
            NotificationKind::CommunityAnnouncement,
            &json!({ "title": "Hi\nBcc: x@example.com" }),
        );
        assert_eq!(announcement.subject, "Hi Bcc: x@example.com");
    }

    #[tokio::test]
    async fn booking_event_titles_use_plain_amenity_names() {
        let storage = Storage::temporary().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mailer = Arc::new(MemoryMailer::new());
        let notifier = Notifier::new(mailer.clone(), storage, clock.clone(), "no-reply@circlein.app".into());
        let booking = Booking {
            id: "b1".into(),
            user_id: "ana@example.com".into(),
            user_email: "ana@example.com".into(),
            user_name: None,
            community_id: "c1".into(),
            amenity_id: "a1".into(),
            amenity_name: "<Pool>".into(),
            start_time: clock.now(),
            end_time: clock.now() + chrono::Duration::hours(1),
            status: crate::models::BookingStatus::Confirmed,
            waitlist_position: None,
            reminder_sent: false,
            reminder_claimed_at: None,
            created_at: clock.now(),
            updated_at: clock.now(),
            promoted_at: None,
            promotion_reason: None,
            expired_at: None,
            expired_reason: None,
            cancelled_at: None,
            cancellation_reason: None,
            completed_at: None,
        };
        notifier
            .booking_event(NotificationKind::BookingConfirmation, &booking)
            .await;

        let user = User {
            email: "ana@example.com".into(),
            name: None,
            role: crate::models::Role::Resident,
            community_id: Some("c1".into()),
            profile_completed: true,
            flat_number: None,
            phone: None,
            deleted: false,
            deleted_at: None,
            deleted_by: None,
            access_code_used: None,
            password_hash: String::new(),
            created_at: clock.now(),
            updated_at: clock.now(),
        };
        let feed = notifier.list_for(&user).unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].title, "Booking confirmed: <Pool>");
        assert_eq!(mailer.sent()[0].subject, "Booking confirmed: <Pool>");
    }

    #[test]
    fn render_falls_back_when_fields_are_missing() {
        let rendered = render(NotificationKind::Welcome, &json!({}));
        assert_eq!(rendered.subject, "Welcome to CircleIn");
    }

    #[tokio::test]
    async fn send_email_uses_the_mailer() {
        let mailer = Arc::new(MemoryMailer::new());
        let notifier = Notifier::new(
            mailer.clone(),
            Storage::temporary().unwrap(),
            Arc::new(ManualClock::new(Utc::now())),
            "CircleIn <no-reply@circlein.app>".into(),
        );
        notifier
            .send_email(
                NotificationKind::BookingReminder,
                &json!({ "amenityName": "Gym" }),
                "ana@example.com",
            )
            .await
            .unwrap();
        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Reminder: Gym starts soon");

        mailer.set_failing(true);
        let err = notifier
            .send_email(NotificationKind::Welcome, &json!({}), "ana@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Mail(_)));

        let err = notifier
            .send_email(NotificationKind::Welcome, &json!({}), "not-an-address")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = notifier
            .send_email(
                NotificationKind::Welcome,
                &json!({}),
                "ana@example.com\r\nBcc: someone@example.com",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
