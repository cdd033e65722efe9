use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Resident,
    Admin,
    SuperAdmin,
}

impl Role {
    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin | Role::SuperAdmin)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub community_id: Option<String>,
    #[serde(default)]
    pub profile_completed: bool,
    #[serde(default)]
    pub flat_number: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_by: Option<String>,
    #[serde(default)]
    pub access_code_used: Option<String>,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// A profile is complete once the resident belongs to a community and
    /// has told us where they live.
    pub fn refresh_profile_completed(&mut self) {
        self.profile_completed = self.community_id.is_some()
            && self
                .flat_number
                .as_deref()
                .map(|f| !f.trim().is_empty())
                .unwrap_or(false);
    }
}

/// What the API returns for a user; never carries the password hash.
#[derive(Serialize, Debug, Clone, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub email: String,
    pub name: Option<String>,
    pub role: Role,
    pub community_id: Option<String>,
    pub profile_completed: bool,
    pub flat_number: Option<String>,
    pub phone: Option<String>,
    pub deleted: bool,
    pub access_code_used: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserView {
    fn from(value: User) -> Self {
        let User {
            email,
            name,
            role,
            community_id,
            profile_completed,
            flat_number,
            phone,
            deleted,
            access_code_used,
            created_at,
            ..
        } = value;
        Self {
            email,
            name,
            role,
            community_id,
            profile_completed,
            flat_number,
            phone,
            deleted,
            access_code_used,
            created_at,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Confirmed,
    Waitlist,
    PendingConfirmation,
    Completed,
    Cancelled,
    Expired,
}

impl BookingStatus {
    /// Holds capacity on the amenity.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Confirmed | BookingStatus::PendingConfirmation)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::Expired
        )
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Waitlist, PendingConfirmation)
                | (PendingConfirmation, Confirmed)
                | (Confirmed | Waitlist | PendingConfirmation, Cancelled)
                | (Waitlist | PendingConfirmation, Expired)
                | (Confirmed, Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Waitlist => "waitlist",
            BookingStatus::PendingConfirmation => "pending_confirmation",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: String,
    pub user_id: String,
    pub user_email: String,
    #[serde(default)]
    pub user_name: Option<String>,
    pub community_id: String,
    pub amenity_id: String,
    pub amenity_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: BookingStatus,
    #[serde(default)]
    pub waitlist_position: Option<u32>,
    #[serde(default)]
    pub reminder_sent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reminder_claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Booking {
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start_time < end && start < self.end_time
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessCode {
    pub code: String,
    pub community_id: String,
    #[serde(default)]
    pub is_used: bool,
    #[serde(default)]
    pub used_by: Option<String>,
    #[serde(default)]
    pub used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub invalidated: bool,
    #[serde(default)]
    pub invalidated_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperatingHours {
    /// `HH:MM`, UTC
    pub open: String,
    /// `HH:MM`, UTC
    pub close: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Amenity {
    pub id: String,
    pub name: String,
    pub amenity_type: String,
    #[serde(default)]
    pub description: Option<String>,
    pub community_id: String,
    pub capacity: u32,
    #[serde(default)]
    pub operating_hours: Option<OperatingHours>,
    #[serde(default)]
    pub time_slots: Vec<String>,
    pub max_duration_minutes: u32,
    #[serde(default)]
    pub manager_contact: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Community {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Invite {
    pub email: String,
    pub community_id: String,
    pub role: Role,
    pub invited_by: String,
    #[serde(default)]
    pub accepted: bool,
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    BookingConfirmation,
    BookingCancellation,
    BookingReminder,
    WaitlistJoined,
    WaitlistPromotion,
    WaitlistExpired,
    Welcome,
    CommunityAnnouncement,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommunityNotification {
    pub id: String,
    pub community_id: String,
    /// `None` addresses the whole community.
    #[serde(default)]
    pub user_email: Option<String>,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub booking_id: Option<String>,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenAudience {
    Session,
    Store,
}

impl TokenAudience {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenAudience::Session => "session",
            TokenAudience::Store => "store",
        }
    }
}

/// JWT claims for both session tokens and the short-lived store tokens.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub sub: String, // email
    pub role: Role,
    #[serde(default)]
    pub community_id: Option<String>,
    pub aud: String,
    pub iat: usize,
    pub exp: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        use BookingStatus::*;
        assert!(Waitlist.can_transition_to(PendingConfirmation));
        assert!(PendingConfirmation.can_transition_to(Confirmed));
        assert!(Waitlist.can_transition_to(Expired));
        assert!(Confirmed.can_transition_to(Completed));
        assert!(!Confirmed.can_transition_to(Expired));
        assert!(!Waitlist.can_transition_to(Confirmed));
        assert!(!Expired.can_transition_to(Confirmed));
        assert!(!Cancelled.can_transition_to(Cancelled));
    }

    #[test]
    fn status_wire_names() {
        let json = serde_json::to_string(&BookingStatus::PendingConfirmation).unwrap();
        assert_eq!(json, "\"pending_confirmation\"");
        let role: Role = serde_json::from_str("\"super_admin\"").unwrap();
        assert_eq!(role, Role::SuperAdmin);
    }
}
