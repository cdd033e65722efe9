//! One-time community join codes: provisioning, validation, redemption.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use rand::{distributions::Alphanumeric, Rng};
use serde::Serialize;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::models::{AccessCode, Community, Role, User};
use crate::storage::{abort, Collection, Storage};
use crate::users::{normalize_email, require_community_admin};

pub const MAX_CODES_PER_REQUEST: u32 = 50;
pub const CODE_LENGTH: usize = 8;
pub const MAX_ATTEMPTS_PER_CODE: usize = 100;

pub fn random_code<R: Rng>(rng: &mut R) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(CODE_LENGTH)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect()
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Draw `count` codes that collide neither with each other nor with anything
/// `taken` reports as already stored. Each code gets `MAX_ATTEMPTS_PER_CODE`
/// draws before the whole request fails.
pub fn draw_unique_codes<N, T>(count: u32, mut next: N, taken: T) -> AppResult<Vec<String>>
where
    N: FnMut() -> String,
    T: Fn(&str) -> AppResult<bool>,
{
    let mut seen = HashSet::new();
    let mut codes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut accepted = None;
        for _ in 0..MAX_ATTEMPTS_PER_CODE {
            let candidate = next();
            if !seen.contains(&candidate) && !taken(&candidate)? {
                accepted = Some(candidate);
                break;
            }
        }
        let code = accepted.ok_or_else(|| {
            AppError::Internal(format!(
                "Could not generate a unique access code after {MAX_ATTEMPTS_PER_CODE} attempts"
            ))
        })?;
        seen.insert(code.clone());
        codes.push(code);
    }
    Ok(codes)
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CodeCheck {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub community_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub community_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone)]
pub struct AccessCodes {
    storage: Storage,
    clock: Arc<dyn Clock>,
    validity_days: i64,
}

impl AccessCodes {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>, validity_days: i64) -> Self {
        Self {
            storage,
            clock,
            validity_days,
        }
    }

    pub fn generate(&self, actor: &User, community_id: &str, count: u32) -> AppResult<Vec<AccessCode>> {
        if !(1..=MAX_CODES_PER_REQUEST).contains(&count) {
            return Err(AppError::Validation(format!(
                "codeCount must be between 1 and {MAX_CODES_PER_REQUEST}"
            )));
        }
        require_community_admin(actor, community_id)?;
        if !self.storage.exists(Collection::Communities, community_id)? {
            return Err(AppError::NotFound(format!("Community {community_id} not found")));
        }

        let mut rng = rand::thread_rng();
        let codes = draw_unique_codes(
            count,
            || random_code(&mut rng),
            |candidate| self.storage.exists(Collection::AccessCodes, candidate),
        )?;

        let now = self.clock.now();
        let expires_at = (self.validity_days > 0).then(|| now + Duration::days(self.validity_days));
        let docs: Vec<AccessCode> = codes
            .into_iter()
            .map(|code| AccessCode {
                code,
                community_id: community_id.to_string(),
                is_used: false,
                used_by: None,
                used_at: None,
                invalidated: false,
                invalidated_at: None,
                created_by: actor.email.clone(),
                created_at: now,
                expires_at,
            })
            .collect();

        self.storage.transaction(|tx| {
            for doc in &docs {
                if tx.get::<AccessCode>(Collection::AccessCodes, &doc.code)?.is_some() {
                    return abort(AppError::Conflict(format!(
                        "Access code {} was created concurrently",
                        doc.code
                    )));
                }
                tx.put(Collection::AccessCodes, &doc.code, doc)?;
            }
            Ok(())
        })?;

        info!(community = %community_id, count = docs.len(), by = %actor.email, "access codes generated");
        Ok(docs)
    }

    /// Whether a code could be redeemed right now. Does not consume it.
    pub fn check(&self, code: &str) -> AppResult<CodeCheck> {
        let code = normalize_code(code);
        let Some(doc) = self.storage.get::<AccessCode>(Collection::AccessCodes, &code)? else {
            return Ok(CodeCheck {
                valid: false,
                community_id: None,
                community_name: None,
                reason: Some("Access code not found".into()),
            });
        };
        let reason = if doc.invalidated {
            Some("Access code has been invalidated")
        } else if doc.is_used {
            Some("Access code has already been used")
        } else if doc.is_expired(self.clock.now()) {
            Some("Access code has expired")
        } else {
            None
        };
        let community_name = self
            .storage
            .get::<Community>(Collection::Communities, &doc.community_id)?
            .map(|c| c.name);
        Ok(CodeCheck {
            valid: reason.is_none(),
            community_id: Some(doc.community_id),
            community_name,
            reason: reason.map(str::to_string),
        })
    }

    /// Consume a code and move the user into its community, atomically.
    pub fn redeem(&self, email: &str, code: &str, flat_number: Option<String>) -> AppResult<(User, AccessCode)> {
        let email = normalize_email(email);
        let code = normalize_code(code);
        let now = self.clock.now();

        let (user, access_code) = self.storage.transaction(|tx| {
            let Some(mut access_code) = tx.get::<AccessCode>(Collection::AccessCodes, &code)? else {
                return abort(AppError::NotFound("Access code not found".into()));
            };
            if access_code.invalidated {
                return abort(AppError::Validation("Access code has been invalidated".into()));
            }
            if access_code.is_expired(now) {
                return abort(AppError::Validation("Access code has expired".into()));
            }
            if access_code.is_used {
                return abort(AppError::Conflict("Access code has already been used".into()));
            }

            let Some(mut user) = tx.get::<User>(Collection::Users, &email)? else {
                return abort(AppError::NotFound(format!("User {email} not found")));
            };
            if user.deleted {
                return abort(AppError::Forbidden("This account has been deactivated".into()));
            }
            if user.community_id.is_some() {
                return abort(AppError::Conflict("You already belong to a community".into()));
            }

            access_code.is_used = true;
            access_code.used_by = Some(email.clone());
            access_code.used_at = Some(now);

            user.community_id = Some(access_code.community_id.clone());
            if !user.role.is_admin() {
                user.role = Role::Resident;
            }
            user.access_code_used = Some(code.clone());
            if let Some(flat) = flat_number.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
                user.flat_number = Some(flat.to_string());
            }
            user.refresh_profile_completed();
            user.updated_at = now;

            tx.put(Collection::AccessCodes, &code, &access_code)?;
            tx.put(Collection::Users, &email, &user)?;
            Ok((user, access_code))
        })?;

        info!(email = %user.email, community = %access_code.community_id, "access code redeemed");
        Ok((user, access_code))
    }

    pub fn list(&self, actor: &User, community_id: &str) -> AppResult<Vec<AccessCode>> {
        require_community_admin(actor, community_id)?;
        let mut codes: Vec<AccessCode> = self
            .storage
            .find(Collection::AccessCodes, |c: &AccessCode| c.community_id == community_id)?;
        codes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(codes)
    }

    pub fn invalidate(&self, actor: &User, code: &str) -> AppResult<AccessCode> {
        let code = normalize_code(code);
        let now = self.clock.now();
        let existing: AccessCode = self
            .storage
            .get(Collection::AccessCodes, &code)?
            .ok_or_else(|| AppError::NotFound("Access code not found".into()))?;
        require_community_admin(actor, &existing.community_id)?;

        let updated = self.storage.transaction(|tx| {
            let Some(mut doc) = tx.get::<AccessCode>(Collection::AccessCodes, &code)? else {
                return abort(AppError::NotFound("Access code not found".into()));
            };
            if doc.is_used {
                return abort(AppError::Conflict("A used access code cannot be invalidated".into()));
            }
            if !doc.invalidated {
                doc.invalidated = true;
                doc.invalidated_at = Some(now);
                tx.put(Collection::AccessCodes, &code, &doc)?;
            }
            Ok(doc)
        })?;
        warn!(code = %code, by = %actor.email, "access code invalidated");
        Ok(updated)
    }

    /// Invalidate `code` and issue one fresh code for the same community.
    pub fn replace(&self, actor: &User, code: &str) -> AppResult<(AccessCode, AccessCode)> {
        let old = self.invalidate(actor, code)?;
        let mut fresh = self.generate(actor, &old.community_id, 1)?;
        let new = fresh
            .pop()
            .ok_or_else(|| AppError::Internal("No replacement code generated".into()))?;
        Ok((old, new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;

    fn setup() -> (AccessCodes, Storage, User, Arc<ManualClock>) {
        let storage = Storage::temporary().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
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
        let admin = user("admin@example.com", Role::Admin, Some("c1"));
        storage.put(Collection::Users, &admin.email, &admin).unwrap();
        let codes = AccessCodes::new(storage.clone(), clock.clone(), 30);
        (codes, storage, admin, clock)
    }

    fn user(email: &str, role: Role, community: Option<&str>) -> User {
        let now = Utc::now();
        User {
            email: email.into(),
            name: None,
            role,
            community_id: community.map(str::to_string),
            profile_completed: false,
            flat_number: None,
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

    #[test]
    fn generates_fifty_distinct_codes() {
        let (codes, storage, admin, _) = setup();
        let generated = codes.generate(&admin, "c1", 50).unwrap();
        assert_eq!(generated.len(), 50);
        let distinct: HashSet<_> = generated.iter().map(|c| c.code.clone()).collect();
        assert_eq!(distinct.len(), 50);
        for code in &generated {
            assert_eq!(code.code.len(), CODE_LENGTH);
            assert!(code.code.chars().all(|c| c.is_ascii_alphanumeric()));
            assert!(storage.exists(Collection::AccessCodes, &code.code).unwrap());
        }
    }

    #[test]
    fn rejects_out_of_range_counts() {
        let (codes, _, admin, _) = setup();
        assert!(matches!(codes.generate(&admin, "c1", 0), Err(AppError::Validation(_))));
        assert!(matches!(codes.generate(&admin, "c1", 51), Err(AppError::Validation(_))));
    }

    #[test]
    fn collisions_are_redrawn_and_exhaustion_fails() {
        let mut draws = vec!["BBBBBBBB", "AAAAAAAA", "AAAAAAAA", "CCCCCCCC"].into_iter();
        let codes = draw_unique_codes(
            2,
            || draws.next().unwrap_or("ZZZZZZZZ").to_string(),
            |c| Ok(c == "BBBBBBBB"),
        )
        .unwrap();
        assert_eq!(codes, vec!["AAAAAAAA".to_string(), "CCCCCCCC".to_string()]);

        let err = draw_unique_codes(2, || "SAMECODE".to_string(), |_| Ok(false)).unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }

    #[test]
    fn code_is_redeemed_once() {
        let (codes, storage, admin, _) = setup();
        let code = codes.generate(&admin, "c1", 1).unwrap().remove(0).code;
        for email in ["ana@example.com", "bo@example.com"] {
            let u = user(email, Role::Resident, None);
            storage.put(Collection::Users, email, &u).unwrap();
        }

        let (ana, used) = codes
            .redeem("ana@example.com", &code.to_lowercase(), Some("B-204".into()))
            .unwrap();
        assert_eq!(ana.community_id.as_deref(), Some("c1"));
        assert!(ana.profile_completed);
        assert_eq!(used.used_by.as_deref(), Some("ana@example.com"));

        let err = codes.redeem("bo@example.com", &code, None).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        let bo: User = storage.get(Collection::Users, "bo@example.com").unwrap().unwrap();
        assert_eq!(bo.community_id, None);
    }

    #[test]
    fn invalidated_and_expired_codes_are_refused() {
        let (codes, storage, admin, clock) = setup();
        let mut batch = codes.generate(&admin, "c1", 2).unwrap();
        let first = batch.remove(0).code;
        let second = batch.remove(0).code;
        storage
            .put(Collection::Users, "ana@example.com", &user("ana@example.com", Role::Resident, None))
            .unwrap();

        codes.invalidate(&admin, &first).unwrap();
        assert!(!codes.check(&first).unwrap().valid);
        assert!(matches!(
            codes.redeem("ana@example.com", &first, None),
            Err(AppError::Validation(_))
        ));

        clock.advance(Duration::days(31));
        let check = codes.check(&second).unwrap();
        assert!(!check.valid);
        assert_eq!(check.reason.as_deref(), Some("Access code has expired"));
    }

    #[test]
    fn replace_issues_a_new_code() {
        let (codes, _, admin, _) = setup();
        let code = codes.generate(&admin, "c1", 1).unwrap().remove(0).code;
        let (old, new) = codes.replace(&admin, &code).unwrap();
        assert!(old.invalidated);
        assert_ne!(old.code, new.code);
        assert_eq!(new.community_id, "c1");
        assert!(codes.check(&new.code).unwrap().valid);
    }
}
