use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use serde::Deserialize;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::models::{Amenity, OperatingHours, User};
use crate::storage::{Collection, Storage};
use crate::users::require_community_admin;

const DEFAULT_MAX_DURATION_MINUTES: u32 = 120;
const CACHE_MAX_ENTRIES: usize = 512;

/// Create or patch body. On create `name` and `amenityType` are required;
/// on update every field is optional.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AmenityInput {
    pub name: Option<String>,
    pub amenity_type: Option<String>,
    pub description: Option<String>,
    pub community_id: Option<String>,
    pub capacity: Option<u32>,
    pub operating_hours: Option<OperatingHours>,
    pub time_slots: Option<Vec<String>>,
    pub max_duration_minutes: Option<u32>,
    pub manager_contact: Option<String>,
    pub location: Option<String>,
    pub is_active: Option<bool>,
}

fn parse_hhmm(value: &str) -> AppResult<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| AppError::Validation(format!("Invalid time {value:?}, expected HH:MM")))
}

fn validate_hours(hours: &OperatingHours) -> AppResult<()> {
    let open = parse_hhmm(&hours.open)?;
    let close = parse_hhmm(&hours.close)?;
    if open >= close {
        return Err(AppError::Validation(
            "Operating hours must open before they close".into(),
        ));
    }
    Ok(())
}

fn validate_slot_label(label: &str) -> AppResult<()> {
    let (from, to) = label
        .split_once('-')
        .ok_or_else(|| AppError::Validation(format!("Invalid time slot {label:?}, expected HH:MM-HH:MM")))?;
    if parse_hhmm(from)? >= parse_hhmm(to)? {
        return Err(AppError::Validation(format!("Time slot {label:?} ends before it starts")));
    }
    Ok(())
}

fn validate(amenity: &Amenity) -> AppResult<()> {
    if amenity.name.trim().is_empty() {
        return Err(AppError::Validation("Amenity name is required".into()));
    }
    if amenity.amenity_type.trim().is_empty() {
        return Err(AppError::Validation("Amenity type is required".into()));
    }
    if amenity.capacity == 0 {
        return Err(AppError::Validation("Capacity must be at least 1".into()));
    }
    if amenity.max_duration_minutes == 0 || amenity.max_duration_minutes > 24 * 60 {
        return Err(AppError::Validation(
            "Max duration must be between 1 and 1440 minutes".into(),
        ));
    }
    if let Some(hours) = &amenity.operating_hours {
        validate_hours(hours)?;
    }
    for slot in &amenity.time_slots {
        validate_slot_label(slot)?;
    }
    Ok(())
}

/// Reject a requested range the amenity's rules do not allow.
pub fn ensure_bookable(amenity: &Amenity, start: DateTime<Utc>, end: DateTime<Utc>) -> AppResult<()> {
    if !amenity.is_active {
        return Err(AppError::Validation(format!("{} is not accepting bookings", amenity.name)));
    }
    if end <= start {
        return Err(AppError::Validation("End time must be after start time".into()));
    }
    let minutes = (end - start).num_minutes();
    if minutes > i64::from(amenity.max_duration_minutes) {
        return Err(AppError::Validation(format!(
            "Bookings for {} are limited to {} minutes",
            amenity.name, amenity.max_duration_minutes
        )));
    }
    if let Some(hours) = &amenity.operating_hours {
        let open = parse_hhmm(&hours.open)?;
        let close = parse_hhmm(&hours.close)?;
        let same_day = start.date_naive() == end.date_naive();
        if !same_day || start.time() < open || end.time() > close {
            return Err(AppError::Validation(format!(
                "{} is open {}-{} (UTC)",
                amenity.name, hours.open, hours.close
            )));
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct AmenityCatalog {
    storage: Storage,
    clock: Arc<dyn Clock>,
    cache: Arc<Mutex<TtlCache<Amenity>>>,
}

impl AmenityCatalog {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>, cache_ttl: Duration) -> Self {
        Self {
            storage,
            clock,
            cache: Arc::new(Mutex::new(TtlCache::new(cache_ttl, CACHE_MAX_ENTRIES))),
        }
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, TtlCache<Amenity>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, id: &str) -> AppResult<Amenity> {
        if let Some(hit) = self.cache().get(id) {
            return Ok(hit);
        }
        let amenity: Amenity = self
            .storage
            .get(Collection::Amenities, id)?
            .ok_or_else(|| AppError::NotFound(format!("Amenity {id} not found")))?;
        self.cache().insert(id.to_string(), amenity.clone());
        Ok(amenity)
    }

    pub fn list(&self, community_id: &str, include_inactive: bool) -> AppResult<Vec<Amenity>> {
        let mut items: Vec<Amenity> = self.storage.find(Collection::Amenities, |a: &Amenity| {
            a.community_id == community_id && (include_inactive || a.is_active)
        })?;
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    pub fn create(&self, actor: &User, input: AmenityInput) -> AppResult<Amenity> {
        let community_id = input
            .community_id
            .clone()
            .or_else(|| actor.community_id.clone())
            .ok_or_else(|| AppError::Validation("communityId is required".into()))?;
        require_community_admin(actor, &community_id)?;
        if !self.storage.exists(Collection::Communities, &community_id)? {
            return Err(AppError::NotFound(format!("Community {community_id} not found")));
        }

        let now = self.clock.now();
        let amenity = Amenity {
            id: Uuid::new_v4().to_string(),
            name: input.name.unwrap_or_default().trim().to_string(),
            amenity_type: input.amenity_type.unwrap_or_default().trim().to_string(),
            description: input.description,
            community_id,
            capacity: input.capacity.unwrap_or(1),
            operating_hours: input.operating_hours,
            time_slots: input.time_slots.unwrap_or_default(),
            max_duration_minutes: input
                .max_duration_minutes
                .unwrap_or(DEFAULT_MAX_DURATION_MINUTES),
            manager_contact: input.manager_contact,
            location: input.location,
            is_active: input.is_active.unwrap_or(true),
            created_at: now,
            updated_at: now,
        };
        validate(&amenity)?;
        self.storage.put(Collection::Amenities, &amenity.id, &amenity)?;
        info!(amenity_id = %amenity.id, community = %amenity.community_id, name = %amenity.name, "amenity created");
        Ok(amenity)
    }

    pub fn update(&self, actor: &User, id: &str, input: AmenityInput) -> AppResult<Amenity> {
        let mut amenity = self.get(id)?;
        require_community_admin(actor, &amenity.community_id)?;
        if input
            .community_id
            .as_deref()
            .is_some_and(|c| c != amenity.community_id)
        {
            return Err(AppError::Validation("Amenities cannot move between communities".into()));
        }

        if let Some(name) = input.name {
            amenity.name = name.trim().to_string();
        }
        if let Some(kind) = input.amenity_type {
            amenity.amenity_type = kind.trim().to_string();
        }
        if input.description.is_some() {
            amenity.description = input.description;
        }
        if let Some(capacity) = input.capacity {
            amenity.capacity = capacity;
        }
        if input.operating_hours.is_some() {
            amenity.operating_hours = input.operating_hours;
        }
        if let Some(slots) = input.time_slots {
            amenity.time_slots = slots;
        }
        if let Some(max) = input.max_duration_minutes {
            amenity.max_duration_minutes = max;
        }
        if input.manager_contact.is_some() {
            amenity.manager_contact = input.manager_contact;
        }
        if input.location.is_some() {
            amenity.location = input.location;
        }
        if let Some(active) = input.is_active {
            amenity.is_active = active;
        }
        amenity.updated_at = self.clock.now();
        validate(&amenity)?;

        self.storage.put(Collection::Amenities, id, &amenity)?;
        self.cache().invalidate(id);
        Ok(amenity)
    }

    pub fn delete(&self, actor: &User, id: &str) -> AppResult<()> {
        let amenity = self.get(id)?;
        require_community_admin(actor, &amenity.community_id)?;
        self.storage.delete(Collection::Amenities, id)?;
        self.cache().invalidate(id);
        info!(amenity_id = %id, by = %actor.email, "amenity deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pool() -> Amenity {
        let now = Utc::now();
        Amenity {
            id: "pool".into(),
            name: "Pool".into(),
            amenity_type: "pool".into(),
            description: None,
            community_id: "c1".into(),
            capacity: 2,
            operating_hours: Some(OperatingHours {
                open: "06:00".into(),
                close: "22:00".into(),
            }),
            time_slots: vec!["06:00-07:00".into()],
            max_duration_minutes: 120,
            manager_contact: None,
            location: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn bookable_inside_hours_and_duration() {
        let amenity = pool();
        let start = Utc.with_ymd_and_hms(2030, 1, 1, 7, 0, 0).unwrap();
        assert!(ensure_bookable(&amenity, start, start + chrono::Duration::hours(1)).is_ok());
        assert!(ensure_bookable(&amenity, start, start + chrono::Duration::hours(3)).is_err());
        assert!(ensure_bookable(&amenity, start, start).is_err());

        let late = Utc.with_ymd_and_hms(2030, 1, 1, 21, 30, 0).unwrap();
        assert!(ensure_bookable(&amenity, late, late + chrono::Duration::hours(1)).is_err());
    }

    #[test]
    fn rejects_malformed_configuration() {
        let mut amenity = pool();
        amenity.capacity = 0;
        assert!(validate(&amenity).is_err());

        let mut amenity = pool();
        amenity.time_slots = vec!["9am-10am".into()];
        assert!(validate(&amenity).is_err());

        let mut amenity = pool();
        amenity.operating_hours = Some(OperatingHours {
            open: "22:00".into(),
            close: "06:00".into(),
        });
        assert!(validate(&amenity).is_err());

        assert!(validate(&pool()).is_ok());
    }
}
