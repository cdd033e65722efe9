//! Cron-driven sweeps. Each run iterates sequentially, awaits every write,
//! and reports per-document failures instead of stopping.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::booking::BookingService;
use crate::clock::Clock;
use crate::config::{ReminderWindow, SweepConfig};
use crate::error::AppResult;
use crate::models::{Booking, BookingStatus, NotificationKind};
use crate::notifications::booking_payload;
use crate::storage::{Collection, Storage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SweepFailure {
    pub booking_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExpiryReport {
    pub success: bool,
    pub checked: usize,
    pub expired: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<SweepFailure>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReminderReport {
    pub success: bool,
    pub checked: usize,
    pub reminders_sent: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<SweepFailure>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    pub success: bool,
    pub checked: usize,
    pub completed: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<SweepFailure>,
}

#[derive(Clone)]
pub struct Sweeper {
    storage: Storage,
    clock: Arc<dyn Clock>,
    bookings: BookingService,
    config: SweepConfig,
}

impl Sweeper {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>, bookings: BookingService, config: SweepConfig) -> Self {
        Self {
            storage,
            clock,
            bookings,
            config,
        }
    }

    async fn pause(&self, index: usize) {
        if index > 0 && self.config.expiry_delay > Duration::ZERO {
            tokio::time::sleep(self.config.expiry_delay).await;
        }
    }

    /// `waitlist` and `pending_confirmation` bookings whose slot has ended
    /// become `expired`.
    pub async fn expire_waitlist(&self) -> AppResult<ExpiryReport> {
        let now = self.clock.now();
        let due: Vec<Booking> = self.storage.find(Collection::Bookings, |b: &Booking| {
            matches!(b.status, BookingStatus::Waitlist | BookingStatus::PendingConfirmation)
                && b.end_time <= now
        })?;

        let mut report = ExpiryReport {
            success: true,
            checked: due.len(),
            expired: 0,
            failed: 0,
            errors: vec![],
        };
        for (index, booking) in due.iter().enumerate() {
            self.pause(index).await;
            match self.bookings.expire(&booking.id) {
                Ok(Some(change)) => {
                    report.expired += 1;
                    let notifier = self.bookings.notifier();
                    notifier
                        .booking_event(NotificationKind::WaitlistExpired, &change.booking)
                        .await;
                    for promoted in &change.promoted {
                        notifier
                            .booking_event(NotificationKind::WaitlistPromotion, promoted)
                            .await;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(booking_id = %booking.id, error = %e, "failed to expire booking");
                    report.failed += 1;
                    report.errors.push(SweepFailure {
                        booking_id: booking.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            checked = report.checked,
            expired = report.expired,
            failed = report.failed,
            "waitlist expiry sweep finished"
        );
        Ok(report)
    }

    /// Reminders with the configured window.
    pub async fn booking_reminders(&self) -> AppResult<ReminderReport> {
        self.booking_reminders_in(self.config.reminder_window).await
    }

    pub async fn booking_reminders_in(&self, window: ReminderWindow) -> AppResult<ReminderReport> {
        let now = self.clock.now();
        let due: Vec<Booking> = self.storage.find(Collection::Bookings, |b: &Booking| {
            b.status == BookingStatus::Confirmed && !b.reminder_sent && window.contains(now, b.start_time)
        })?;

        let mut report = ReminderReport {
            success: true,
            checked: due.len(),
            reminders_sent: 0,
            failed: 0,
            errors: vec![],
        };
        for booking in &due {
            let claimed = match self.bookings.claim_reminder(&booking.id) {
                Ok(Some(claimed)) => claimed,
                // already sent, or another sweep holds the lease
                Ok(None) => continue,
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(SweepFailure {
                        booking_id: booking.id.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            let notifier = self.bookings.notifier();
            let sent = notifier
                .send_email(
                    NotificationKind::BookingReminder,
                    &booking_payload(&claimed),
                    &claimed.user_email,
                )
                .await;
            let delivered = sent.is_ok();
            if let Err(e) = self.bookings.finish_reminder(&claimed.id, delivered) {
                warn!(booking_id = %claimed.id, error = %e, "failed to record reminder state");
            }

            match sent {
                Ok(_) => {
                    report.reminders_sent += 1;
                    if let Err(e) = notifier.record_in_app(
                        &claimed.community_id,
                        Some(claimed.user_email.as_str()),
                        NotificationKind::BookingReminder,
                        format!("{} starts soon", claimed.amenity_name),
                        format!("Your booking starts at {}", claimed.start_time.format("%H:%M")),
                        Some(claimed.id.as_str()),
                    ) {
                        warn!(booking_id = %claimed.id, error = %e, "failed to store reminder notification");
                    }
                }
                Err(e) => {
                    warn!(booking_id = %claimed.id, error = %e, "reminder email failed");
                    report.failed += 1;
                    report.errors.push(SweepFailure {
                        booking_id: claimed.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            checked = report.checked,
            sent = report.reminders_sent,
            failed = report.failed,
            lead = window.lead_minutes,
            tolerance = window.tolerance_minutes,
            "reminder sweep finished"
        );
        Ok(report)
    }

    /// `confirmed` bookings whose slot has ended become `completed`.
    pub async fn complete_bookings(&self) -> AppResult<CompletionReport> {
        let now = self.clock.now();
        let due: Vec<Booking> = self.storage.find(Collection::Bookings, |b: &Booking| {
            b.status == BookingStatus::Confirmed && b.end_time <= now
        })?;

        let mut report = CompletionReport {
            success: true,
            checked: due.len(),
            completed: 0,
            failed: 0,
            errors: vec![],
        };
        for (index, booking) in due.iter().enumerate() {
            self.pause(index).await;
            match self.bookings.complete(&booking.id) {
                Ok(Some(_)) => report.completed += 1,
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(SweepFailure {
                        booking_id: booking.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        info!(checked = report.checked, completed = report.completed, "completion sweep finished");
        Ok(report)
    }
}
