//! Booking lifecycle.
//!
//! Every change to a booking goes through [`BookingService::mutate_amenity`]:
//! it reads the amenity's version key, loads a snapshot of that amenity's
//! bookings, lets the caller edit the snapshot, and commits the touched
//! documents in one transaction that fails if the version moved. Capacity
//! checks, waitlist positions and promotions are therefore always computed
//! against a consistent view, and concurrent writers retry instead of
//! overbooking.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::amenities::{ensure_bookable, AmenityCatalog};
use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::models::{Booking, BookingStatus, NotificationKind, Role, User};
use crate::notifications::Notifier;
use crate::storage::{Collection, Storage};
use crate::users::require_community_admin;

pub const CLEAR_BOOKINGS_TOKEN: &str = "CLEAR_ALL_BOOKINGS_CONFIRMED";
pub const DELETE_BATCH_SIZE: usize = 500;
pub const MAX_OPTIMISTIC_RETRIES: usize = 5;
/// How long a reminder claim blocks other sweeps.
pub const REMINDER_CLAIM_LEASE_MINUTES: i64 = 5;

pub const REASON_EXPIRED_WAITLIST: &str = "Time slot passed while in waitlist";
pub const REASON_EXPIRED_PENDING: &str = "Time slot passed while pending confirmation";
pub const REASON_PROMOTED: &str = "A confirmed booking for this slot was released";
pub const REASON_DECLINED: &str = "Declined after waitlist promotion";

fn version_key(amenity_id: &str) -> String {
    format!("amenity/{amenity_id}")
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewBooking {
    pub amenity_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BookingChange {
    pub booking: Booking,
    /// Waitlist entries moved to `pending_confirmation` by this change.
    pub promoted: Vec<Booking>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClearReport {
    pub deleted_count: usize,
    pub batches: usize,
}

/// One amenity's bookings, plus which of them were touched.
pub struct Snapshot {
    bookings: Vec<Booking>,
    dirty: HashSet<String>,
    now: DateTime<Utc>,
}

impl Snapshot {
    fn new(bookings: Vec<Booking>, now: DateTime<Utc>) -> Self {
        Self {
            bookings,
            dirty: HashSet::new(),
            now,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn get(&self, id: &str) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    fn index_of(&self, id: &str) -> AppResult<usize> {
        self.bookings
            .iter()
            .position(|b| b.id == id)
            .ok_or_else(|| AppError::NotFound(format!("Booking {id} not found")))
    }

    /// Mutable access; marks the booking for writing and stamps `updatedAt`.
    pub fn edit(&mut self, id: &str) -> AppResult<&mut Booking> {
        let idx = self.index_of(id)?;
        self.dirty.insert(id.to_string());
        let booking = &mut self.bookings[idx];
        booking.updated_at = self.now;
        Ok(booking)
    }

    pub fn insert(&mut self, booking: Booking) {
        self.dirty.insert(booking.id.clone());
        self.bookings.push(booking);
    }

    /// Most active bookings holding the amenity at any one instant of `[start, end)`.
    pub fn peak_usage(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> usize {
        // (time, delta); releases sort before acquisitions at the same instant
        let mut events: Vec<(DateTime<Utc>, i32)> = self
            .bookings
            .iter()
            .filter(|b| b.status.is_active() && b.overlaps(start, end))
            .flat_map(|b| [(b.start_time.max(start), 1), (b.end_time.min(end), -1)])
            .collect();
        events.sort();

        let (mut current, mut peak) = (0i32, 0i32);
        for (_, delta) in events {
            current += delta;
            peak = peak.max(current);
        }
        peak as usize
    }

    /// Renumber the waitlist for one slot as 1..n in `createdAt` order.
    pub fn compact_waitlist(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) {
        let mut queue: Vec<(DateTime<Utc>, String)> = self
            .bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Waitlist && b.start_time == start && b.end_time == end)
            .map(|b| (b.created_at, b.id.clone()))
            .collect();
        queue.sort();

        for (rank, (_, id)) in queue.iter().enumerate() {
            let position = Some(rank as u32 + 1);
            if let Some(booking) = self.bookings.iter_mut().find(|b| &b.id == id) {
                if booking.waitlist_position != position {
                    booking.waitlist_position = position;
                    booking.updated_at = self.now;
                    self.dirty.insert(id.clone());
                }
            }
        }
    }

    /// After capacity was released inside `[start, end)`, move every waitlist
    /// entry that now fits to `pending_confirmation`, oldest first.
    pub fn promote_into(&mut self, start: DateTime<Utc>, end: DateTime<Utc>, capacity: u32) -> Vec<Booking> {
        let now = self.now;
        let mut candidates: Vec<(DateTime<Utc>, String)> = self
            .bookings
            .iter()
            .filter(|b| {
                b.status == BookingStatus::Waitlist && b.overlaps(start, end) && b.end_time > now
            })
            .map(|b| (b.created_at, b.id.clone()))
            .collect();
        candidates.sort();

        let mut promoted = vec![];
        for (_, id) in candidates {
            let Some(candidate) = self.get(&id) else { continue };
            let (c_start, c_end) = (candidate.start_time, candidate.end_time);
            if self.peak_usage(c_start, c_end) >= capacity as usize {
                continue;
            }
            if let Ok(booking) = self.edit(&id) {
                booking.status = BookingStatus::PendingConfirmation;
                booking.waitlist_position = None;
                booking.promoted_at = Some(now);
                booking.promotion_reason = Some(REASON_PROMOTED.to_string());
                promoted.push(booking.clone());
            }
            self.compact_waitlist(c_start, c_end);
        }
        promoted
    }

    fn take_dirty(self) -> Vec<Booking> {
        let dirty = self.dirty;
        self.bookings
            .into_iter()
            .filter(|b| dirty.contains(&b.id))
            .collect()
    }
}

#[derive(Clone)]
pub struct BookingService {
    storage: Storage,
    clock: Arc<dyn Clock>,
    amenities: AmenityCatalog,
    notifier: Notifier,
}

impl BookingService {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>, amenities: AmenityCatalog, notifier: Notifier) -> Self {
        Self {
            storage,
            clock,
            amenities,
            notifier,
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Load, edit, and commit one amenity's bookings under its version key.
    /// `plan` may run several times; it must only touch the snapshot.
    pub fn mutate_amenity<R, F>(&self, amenity_id: &str, plan: F) -> AppResult<R>
    where
        F: Fn(&mut Snapshot) -> AppResult<R>,
    {
        let key = version_key(amenity_id);
        for attempt in 1..=MAX_OPTIMISTIC_RETRIES {
            let seen = self.storage.version(&key)?;
            let bookings: Vec<Booking> = self
                .storage
                .find(Collection::Bookings, |b: &Booking| b.amenity_id == amenity_id)?;
            let mut snapshot = Snapshot::new(bookings, self.clock.now());
            let result = plan(&mut snapshot)?;
            let writes = snapshot.take_dirty();
            if writes.is_empty() {
                return Ok(result);
            }

            let committed = self.storage.transaction(|tx| {
                tx.expect_version(&key, seen)?;
                for booking in &writes {
                    tx.put(Collection::Bookings, &booking.id, booking)?;
                }
                tx.bump_version(&key)?;
                Ok(())
            });
            match committed {
                Ok(()) => return Ok(result),
                Err(AppError::Conflict(reason)) => {
                    debug!(amenity_id, attempt, %reason, "booking commit raced, retrying");
                }
                Err(other) => return Err(other),
            }
        }
        warn!(amenity_id, "gave up after repeated concurrent booking updates");
        Err(AppError::Conflict(
            "The amenity is being updated by someone else, please retry".into(),
        ))
    }

    pub fn find(&self, id: &str) -> AppResult<Booking> {
        self.storage
            .get(Collection::Bookings, id)?
            .ok_or_else(|| AppError::NotFound(format!("Booking {id} not found")))
    }

    fn authorize_view(&self, actor: &User, booking: &Booking) -> AppResult<()> {
        if booking.user_email == actor.email {
            return Ok(());
        }
        require_community_admin(actor, &booking.community_id)
            .map_err(|_| AppError::NotFound(format!("Booking {} not found", booking.id)))
    }

    pub fn get(&self, actor: &User, id: &str) -> AppResult<Booking> {
        let booking = self.find(id)?;
        self.authorize_view(actor, &booking)?;
        Ok(booking)
    }

    pub fn list_for_user(&self, email: &str) -> AppResult<Vec<Booking>> {
        let mut items: Vec<Booking> = self
            .storage
            .find(Collection::Bookings, |b: &Booking| b.user_email == email)?;
        items.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(items)
    }

    pub fn list_for_community(
        &self,
        actor: &User,
        community_id: &str,
        status: Option<BookingStatus>,
        amenity_id: Option<&str>,
    ) -> AppResult<Vec<Booking>> {
        require_community_admin(actor, community_id)?;
        let mut items: Vec<Booking> = self.storage.find(Collection::Bookings, |b: &Booking| {
            b.community_id == community_id
                && status.map_or(true, |s| b.status == s)
                && amenity_id.map_or(true, |a| b.amenity_id == a)
        })?;
        items.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(items)
    }

    /// Book a slot: `confirmed` while capacity lasts, `waitlist` after.
    pub async fn create(&self, user: &User, request: NewBooking) -> AppResult<Booking> {
        let community_id = user
            .community_id
            .clone()
            .ok_or_else(|| AppError::Forbidden("Join a community before booking".into()))?;
        let amenity = self.amenities.get(&request.amenity_id)?;
        if amenity.community_id != community_id {
            return Err(AppError::Forbidden("This amenity belongs to another community".into()));
        }
        ensure_bookable(&amenity, request.start_time, request.end_time)?;
        if request.start_time < self.clock.now() {
            return Err(AppError::Validation("Cannot book a slot in the past".into()));
        }

        let booking_id = Uuid::new_v4().to_string();
        let booking = self.mutate_amenity(&amenity.id, |snapshot| {
            let duplicate = snapshot.bookings.iter().any(|b| {
                b.user_email == user.email
                    && !b.status.is_terminal()
                    && b.overlaps(request.start_time, request.end_time)
            });
            if duplicate {
                return Err(AppError::Conflict(
                    "You already have a booking for this amenity at that time".into(),
                ));
            }

            let now = snapshot.now();
            let full = snapshot.peak_usage(request.start_time, request.end_time)
                >= amenity.capacity as usize;
            snapshot.insert(Booking {
                id: booking_id.clone(),
                user_id: user.email.clone(),
                user_email: user.email.clone(),
                user_name: user.name.clone(),
                community_id: community_id.clone(),
                amenity_id: amenity.id.clone(),
                amenity_name: amenity.name.clone(),
                start_time: request.start_time,
                end_time: request.end_time,
                status: if full {
                    BookingStatus::Waitlist
                } else {
                    BookingStatus::Confirmed
                },
                waitlist_position: None,
                reminder_sent: false,
                reminder_claimed_at: None,
                created_at: now,
                updated_at: now,
                promoted_at: None,
                promotion_reason: None,
                expired_at: None,
                expired_reason: None,
                cancelled_at: None,
                cancellation_reason: None,
                completed_at: None,
            });
            if full {
                snapshot.compact_waitlist(request.start_time, request.end_time);
            }
            snapshot
                .get(&booking_id)
                .cloned()
                .ok_or_else(|| AppError::Internal("new booking missing from snapshot".into()))
        })?;

        info!(
            booking_id = %booking.id,
            amenity_id = %booking.amenity_id,
            user = %booking.user_email,
            status = %booking.status,
            position = ?booking.waitlist_position,
            "booking created"
        );
        let kind = match booking.status {
            BookingStatus::Waitlist => NotificationKind::WaitlistJoined,
            _ => NotificationKind::BookingConfirmation,
        };
        self.notifier.booking_event(kind, &booking).await;
        Ok(booking)
    }

    /// Owner or community admin cancels; released capacity goes to the
    /// waitlist.
    pub async fn cancel(&self, actor: &User, id: &str, reason: Option<String>) -> AppResult<BookingChange> {
        let current = self.get(actor, id)?;
        let amenity = self.amenities.get(&current.amenity_id)?;
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| {
                if actor.email == current.user_email {
                    "Cancelled by user".to_string()
                } else {
                    format!("Cancelled by {}", actor.email)
                }
            });

        let change = self.mutate_amenity(&current.amenity_id, |snapshot| {
            release(snapshot, id, BookingStatus::Cancelled, &reason, amenity.capacity)
        })?;

        info!(booking_id = %id, by = %actor.email, promoted = change.promoted.len(), "booking cancelled");
        self.notifier
            .booking_event(NotificationKind::BookingCancellation, &change.booking)
            .await;
        for promoted in &change.promoted {
            self.notifier
                .booking_event(NotificationKind::WaitlistPromotion, promoted)
                .await;
        }
        Ok(change)
    }

    /// Owner accepts a promotion.
    pub async fn confirm(&self, actor: &User, id: &str) -> AppResult<Booking> {
        let current = self.get(actor, id)?;
        if current.user_email != actor.email {
            return Err(AppError::Forbidden("Only the booking owner can confirm it".into()));
        }

        let booking = self.mutate_amenity(&current.amenity_id, |snapshot| {
            let now = snapshot.now();
            let booking = snapshot.edit(id)?;
            if booking.status != BookingStatus::PendingConfirmation {
                return Err(AppError::Validation(format!(
                    "Only bookings pending confirmation can be confirmed (status is {})",
                    booking.status
                )));
            }
            if booking.end_time <= now {
                return Err(AppError::Validation("This time slot has already passed".into()));
            }
            booking.status = BookingStatus::Confirmed;
            Ok(booking.clone())
        })?;

        info!(booking_id = %id, "promotion confirmed");
        self.notifier
            .booking_event(NotificationKind::BookingConfirmation, &booking)
            .await;
        Ok(booking)
    }

    /// Owner turns a promotion down; the spot moves further down the queue.
    pub async fn decline(&self, actor: &User, id: &str) -> AppResult<BookingChange> {
        let current = self.get(actor, id)?;
        if current.user_email != actor.email {
            return Err(AppError::Forbidden("Only the booking owner can decline it".into()));
        }
        if current.status != BookingStatus::PendingConfirmation {
            return Err(AppError::Validation(format!(
                "Only bookings pending confirmation can be declined (status is {})",
                current.status
            )));
        }
        let amenity = self.amenities.get(&current.amenity_id)?;

        let change = self.mutate_amenity(&current.amenity_id, |snapshot| {
            release(snapshot, id, BookingStatus::Cancelled, REASON_DECLINED, amenity.capacity)
        })?;

        info!(booking_id = %id, promoted = change.promoted.len(), "promotion declined");
        for promoted in &change.promoted {
            self.notifier
                .booking_event(NotificationKind::WaitlistPromotion, promoted)
                .await;
        }
        Ok(change)
    }

    /// `waitlist`/`pending_confirmation` → `expired` once the slot has ended.
    /// `Ok(None)` when the booking no longer qualifies.
    pub fn expire(&self, id: &str) -> AppResult<Option<BookingChange>> {
        let current = self.find(id)?;
        let capacity = self
            .amenities
            .get(&current.amenity_id)
            .map(|a| a.capacity)
            .unwrap_or(1);

        self.mutate_amenity(&current.amenity_id, |snapshot| {
            let now = snapshot.now();
            let Some(b) = snapshot.get(id) else {
                return Ok(None);
            };
            let reason = match b.status {
                BookingStatus::Waitlist => REASON_EXPIRED_WAITLIST,
                BookingStatus::PendingConfirmation => REASON_EXPIRED_PENDING,
                _ => return Ok(None),
            };
            if b.end_time > now {
                return Ok(None);
            }
            release(snapshot, id, BookingStatus::Expired, reason, capacity).map(Some)
        })
    }

    /// `confirmed` → `completed` once the slot has ended.
    pub fn complete(&self, id: &str) -> AppResult<Option<Booking>> {
        let current = self.find(id)?;
        self.mutate_amenity(&current.amenity_id, |snapshot| {
            let now = snapshot.now();
            match snapshot.get(id) {
                Some(b) if b.status == BookingStatus::Confirmed && b.end_time <= now => {}
                _ => return Ok(None),
            }
            let booking = snapshot.edit(id)?;
            booking.status = BookingStatus::Completed;
            booking.completed_at = Some(now);
            Ok(Some(booking.clone()))
        })
    }

    /// Take the reminder lease for a confirmed, unreminded booking.
    pub fn claim_reminder(&self, id: &str) -> AppResult<Option<Booking>> {
        let current = self.find(id)?;
        self.mutate_amenity(&current.amenity_id, |snapshot| {
            let now = snapshot.now();
            let lease = Duration::minutes(REMINDER_CLAIM_LEASE_MINUTES);
            match snapshot.get(id) {
                Some(b)
                    if b.status == BookingStatus::Confirmed
                        && !b.reminder_sent
                        && b.reminder_claimed_at.map_or(true, |at| at + lease <= now) => {}
                _ => return Ok(None),
            }
            let booking = snapshot.edit(id)?;
            booking.reminder_claimed_at = Some(now);
            Ok(Some(booking.clone()))
        })
    }

    /// Record a delivered reminder. `reminderSent` never goes back to false.
    pub fn finish_reminder(&self, id: &str, delivered: bool) -> AppResult<()> {
        let current = self.find(id)?;
        self.mutate_amenity(&current.amenity_id, |snapshot| {
            if snapshot.get(id).is_none() {
                return Ok(());
            }
            let booking = snapshot.edit(id)?;
            if delivered {
                booking.reminder_sent = true;
            }
            booking.reminder_claimed_at = None;
            Ok(())
        })
    }

    /// Destructive bulk delete behind an exact confirmation token. Admins
    /// clear their own community; super admins may clear one community or
    /// everything.
    pub fn clear(&self, actor: &User, confirmation_token: &str, community_id: Option<&str>) -> AppResult<ClearReport> {
        if confirmation_token != CLEAR_BOOKINGS_TOKEN {
            return Err(AppError::Validation(format!(
                "confirmationToken must be exactly {CLEAR_BOOKINGS_TOKEN}"
            )));
        }
        let scope = match (community_id, actor.role) {
            (Some(c), _) => {
                require_community_admin(actor, c)?;
                Some(c.to_string())
            }
            (None, Role::SuperAdmin) => None,
            (None, Role::Admin) => Some(actor.community_id.clone().ok_or_else(|| {
                AppError::Forbidden("Admin is not attached to a community".into())
            })?),
            (None, Role::Resident) => return Err(AppError::Forbidden("Admin access required".into())),
        };

        let targets: Vec<Booking> = self.storage.find(Collection::Bookings, |b: &Booking| {
            scope.as_deref().map_or(true, |c| b.community_id == c)
        })?;
        let ids: Vec<String> = targets.iter().map(|b| b.id.clone()).collect();
        let amenity_ids: HashSet<&str> = targets.iter().map(|b| b.amenity_id.as_str()).collect();

        let report = self
            .storage
            .delete_in_batches(Collection::Bookings, &ids, DELETE_BATCH_SIZE)?;
        for amenity_id in amenity_ids {
            self.storage.bump_version(&version_key(amenity_id))?;
        }

        warn!(
            by = %actor.email,
            community = scope.as_deref().unwrap_or("*"),
            deleted = report.deleted,
            batches = report.batches,
            "bookings cleared"
        );
        Ok(ClearReport {
            deleted_count: report.deleted,
            batches: report.batches,
        })
    }
}

/// Move a booking to a terminal state and hand any capacity it held to the
/// waitlist.
fn release(
    snapshot: &mut Snapshot,
    id: &str,
    to: BookingStatus,
    reason: &str,
    capacity: u32,
) -> AppResult<BookingChange> {
    let now = snapshot.now();
    let booking = snapshot.edit(id)?;
    let from = booking.status;
    if !from.can_transition_to(to) {
        return Err(AppError::Validation(format!("A {from} booking cannot become {to}")));
    }
    booking.status = to;
    booking.waitlist_position = None;
    match to {
        BookingStatus::Expired => {
            booking.expired_at = Some(now);
            booking.expired_reason = Some(reason.to_string());
        }
        _ => {
            booking.cancelled_at = Some(now);
            booking.cancellation_reason = Some(reason.to_string());
        }
    }
    let (start, end) = (booking.start_time, booking.end_time);

    let promoted = if from.is_active() {
        snapshot.promote_into(start, end, capacity)
    } else {
        vec![]
    };
    if from == BookingStatus::Waitlist {
        snapshot.compact_waitlist(start, end);
    }
    let booking = snapshot
        .get(id)
        .cloned()
        .ok_or_else(|| AppError::Internal("released booking missing from snapshot".into()))?;
    Ok(BookingChange { booking, promoted })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{Amenity, Community};
    use crate::notifications::MemoryMailer;
    use chrono::TimeZone;

    struct Fixture {
        service: BookingService,
        storage: Storage,
        clock: Arc<ManualClock>,
        mailer: Arc<MemoryMailer>,
    }

    fn start_of_test() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 6, 1, 8, 0, 0).unwrap()
    }

    fn fixture(capacity: u32) -> Fixture {
        let storage = Storage::temporary().unwrap();
        let clock = Arc::new(ManualClock::new(start_of_test()));
        let mailer = Arc::new(MemoryMailer::new());
        let now = clock.now();
        storage
            .put(
                Collection::Communities,
                "c1",
                &Community {
                    id: "c1".into(),
                    name: "Maple Court".into(),
                    address: None,
                    is_active: true,
                    created_at: now,
                },
            )
            .unwrap();
        storage
            .put(
                Collection::Amenities,
                "hall",
                &Amenity {
                    id: "hall".into(),
                    name: "Party Hall".into(),
                    amenity_type: "hall".into(),
                    description: None,
                    community_id: "c1".into(),
                    capacity,
                    operating_hours: None,
                    time_slots: vec![],
                    max_duration_minutes: 240,
                    manager_contact: None,
                    location: None,
                    is_active: true,
                    created_at: now,
                    updated_at: now,
                },
            )
            .unwrap();
        let amenities = AmenityCatalog::new(storage.clone(), clock.clone(), std::time::Duration::from_secs(60));
        let notifier = Notifier::new(mailer.clone(), storage.clone(), clock.clone(), "test@circlein.app".into());
        let service = BookingService::new(storage.clone(), clock.clone(), amenities, notifier);
        Fixture {
            service,
            storage,
            clock,
            mailer,
        }
    }

    fn resident(email: &str) -> User {
        let now = start_of_test();
        User {
            email: email.into(),
            name: None,
            role: Role::Resident,
            community_id: Some("c1".into()),
            profile_completed: true,
            flat_number: Some("1A".into()),
            phone: None,
            deleted: false,
            deleted_at: None,
            deleted_by: None,
            access_code_used: None,
            password_hash: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn slot(hour: u32) -> NewBooking {
        let start = Utc.with_ymd_and_hms(2030, 6, 1, hour, 0, 0).unwrap();
        NewBooking {
            amenity_id: "hall".into(),
            start_time: start,
            end_time: start + Duration::hours(1),
        }
    }

    async fn book(f: &Fixture, email: &str, hour: u32) -> Booking {
        let b = f.service.create(&resident(email), slot(hour)).await.unwrap();
        f.clock.advance(Duration::seconds(1));
        b
    }

    #[tokio::test]
    async fn capacity_then_waitlist_in_arrival_order() {
        let f = fixture(1);
        let a = book(&f, "a@example.com", 18).await;
        let b = book(&f, "b@example.com", 18).await;
        let c = book(&f, "c@example.com", 18).await;

        assert_eq!(a.status, BookingStatus::Confirmed);
        assert_eq!(b.status, BookingStatus::Waitlist);
        assert_eq!(b.waitlist_position, Some(1));
        assert_eq!(c.waitlist_position, Some(2));

        let other_hour = book(&f, "d@example.com", 20).await;
        assert_eq!(other_hour.status, BookingStatus::Confirmed);

        let kinds: Vec<String> = f.mailer.sent().into_iter().map(|m| m.subject).collect();
        assert!(kinds.iter().any(|s| s.starts_with("Booking confirmed")));
        assert!(kinds.iter().any(|s| s.starts_with("You're on the waitlist")));
    }

    #[tokio::test]
    async fn back_to_back_bookings_do_not_share_capacity() {
        let f = fixture(2);
        let a = book(&f, "a@example.com", 9).await;
        let b = book(&f, "b@example.com", 10).await;
        let two_hours = |hour| NewBooking {
            end_time: slot(hour).start_time + Duration::hours(2),
            ..slot(hour)
        };

        let c = f
            .service
            .create(&resident("c@example.com"), two_hours(9))
            .await
            .unwrap();
        assert_eq!(a.status, BookingStatus::Confirmed);
        assert_eq!(b.status, BookingStatus::Confirmed);
        assert_eq!(c.status, BookingStatus::Confirmed);

        // 9:00-10:00 now holds a and c
        let d = f
            .service
            .create(&resident("d@example.com"), two_hours(9))
            .await
            .unwrap();
        assert_eq!(d.status, BookingStatus::Waitlist);
    }

    #[tokio::test]
    async fn duplicate_and_past_requests_are_rejected() {
        let f = fixture(3);
        book(&f, "a@example.com", 18).await;
        let err = f
            .service
            .create(&resident("a@example.com"), slot(18))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let err = f
            .service
            .create(&resident("a@example.com"), slot(7))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn cancelling_promotes_oldest_and_compacts_positions() {
        let f = fixture(1);
        let a = book(&f, "a@example.com", 18).await;
        let b = book(&f, "b@example.com", 18).await;
        let c = book(&f, "c@example.com", 18).await;

        let change = f
            .service
            .cancel(&resident("a@example.com"), &a.id, None)
            .await
            .unwrap();
        assert_eq!(change.booking.status, BookingStatus::Cancelled);
        assert_eq!(change.promoted.len(), 1);
        assert_eq!(change.promoted[0].id, b.id);
        assert_eq!(change.promoted[0].status, BookingStatus::PendingConfirmation);
        assert!(change.promoted[0].promoted_at.is_some());

        let c_now = f.service.find(&c.id).unwrap();
        assert_eq!(c_now.waitlist_position, Some(1));

        let confirmed = f.service.confirm(&resident("b@example.com"), &b.id).await.unwrap();
        assert_eq!(confirmed.status, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn declining_passes_the_spot_on() {
        let f = fixture(1);
        let a = book(&f, "a@example.com", 18).await;
        let b = book(&f, "b@example.com", 18).await;
        let c = book(&f, "c@example.com", 18).await;
        f.service.cancel(&resident("a@example.com"), &a.id, None).await.unwrap();

        let change = f.service.decline(&resident("b@example.com"), &b.id).await.unwrap();
        assert_eq!(change.booking.status, BookingStatus::Cancelled);
        assert_eq!(change.promoted.len(), 1);
        assert_eq!(change.promoted[0].id, c.id);
    }

    #[tokio::test]
    async fn leaving_the_waitlist_closes_the_gap() {
        let f = fixture(1);
        book(&f, "a@example.com", 18).await;
        let b = book(&f, "b@example.com", 18).await;
        let c = book(&f, "c@example.com", 18).await;
        let d = book(&f, "d@example.com", 18).await;

        let change = f.service.cancel(&resident("c@example.com"), &c.id, None).await.unwrap();
        assert!(change.promoted.is_empty());
        assert_eq!(f.service.find(&b.id).unwrap().waitlist_position, Some(1));
        assert_eq!(f.service.find(&d.id).unwrap().waitlist_position, Some(2));
    }

    #[tokio::test]
    async fn other_residents_cannot_touch_a_booking() {
        let f = fixture(1);
        let a = book(&f, "a@example.com", 18).await;
        let err = f
            .service
            .cancel(&resident("z@example.com"), &a.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let mut admin = resident("admin@example.com");
        admin.role = Role::Admin;
        let change = f.service.cancel(&admin, &a.id, Some("Maintenance".into())).await.unwrap();
        assert_eq!(change.booking.cancellation_reason.as_deref(), Some("Maintenance"));
    }

    #[tokio::test]
    async fn stale_snapshot_retries_instead_of_overbooking() {
        let f = fixture(1);
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let key = version_key("hall");
        let result = f.service.mutate_amenity("hall", |snapshot| {
            if calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                // someone else commits between our read and our write
                f.storage.bump_version(&key)?;
            }
            snapshot.insert(Booking {
                id: "x".into(),
                user_id: "a@example.com".into(),
                user_email: "a@example.com".into(),
                user_name: None,
                community_id: "c1".into(),
                amenity_id: "hall".into(),
                amenity_name: "Party Hall".into(),
                start_time: start_of_test(),
                end_time: start_of_test() + Duration::hours(1),
                status: BookingStatus::Confirmed,
                waitlist_position: None,
                reminder_sent: false,
                reminder_claimed_at: None,
                created_at: start_of_test(),
                updated_at: start_of_test(),
                promoted_at: None,
                promotion_reason: None,
                expired_at: None,
                expired_reason: None,
                cancelled_at: None,
                cancellation_reason: None,
                completed_at: None,
            });
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(f.storage.exists(Collection::Bookings, "x").unwrap());
    }

    #[tokio::test]
    async fn clear_requires_exact_token() {
        let f = fixture(1);
        book(&f, "a@example.com", 18).await;
        book(&f, "b@example.com", 19).await;
        let mut admin = resident("admin@example.com");
        admin.role = Role::Admin;

        let err = f.service.clear(&admin, "clear_all_bookings_confirmed", None).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(f.service.list_for_user("a@example.com").unwrap().len(), 1);

        let report = f.service.clear(&admin, CLEAR_BOOKINGS_TOKEN, Some("c1")).unwrap();
        assert_eq!(report.deleted_count, 2);
        assert_eq!(report.batches, 1);
        assert!(f.service.list_for_user("a@example.com").unwrap().is_empty());

        let err = f.service.clear(&admin, CLEAR_BOOKINGS_TOKEN, Some("c2")).unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }
}
