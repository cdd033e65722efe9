use std::sync::Arc;

use tracing::info;

use crate::auth::Authenticator;
use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::models::{Invite, Role, User};
use crate::storage::{abort, Collection, Storage};

pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// Admins act on their own community; super admins on any.
pub fn require_community_admin(actor: &User, community_id: &str) -> AppResult<()> {
    match actor.role {
        Role::SuperAdmin => Ok(()),
        Role::Admin if actor.community_id.as_deref() == Some(community_id) => Ok(()),
        Role::Admin => Err(AppError::Forbidden(
            "Admins can only manage their own community".into(),
        )),
        Role::Resident => Err(AppError::Forbidden("Admin access required".into())),
    }
}

#[derive(Debug, Default, Clone)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub flat_number: Option<String>,
    pub phone: Option<String>,
}

#[derive(Clone)]
pub struct UserDirectory {
    storage: Storage,
    clock: Arc<dyn Clock>,
    auth: Authenticator,
}

impl UserDirectory {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>, auth: Authenticator) -> Self {
        Self {
            storage,
            clock,
            auth,
        }
    }

    /// First sign-in: create the profile, joining a community straight away
    /// when an invite is waiting for this address.
    pub fn register(&self, email: &str, password: &str, name: Option<String>) -> AppResult<User> {
        let email = normalize_email(email);
        if email.len() < 3 || !email.contains('@') {
            return Err(AppError::Validation("A valid email is required".into()));
        }
        if password.len() < 8 {
            return Err(AppError::Validation(
                "Password must be at least 8 characters".into(),
            ));
        }

        let now = self.clock.now();
        let password_hash = self.auth.hash_password(password)?;
        let template = User {
            email: email.clone(),
            name: name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
            role: Role::Resident,
            community_id: None,
            profile_completed: false,
            flat_number: None,
            phone: None,
            deleted: false,
            deleted_at: None,
            deleted_by: None,
            access_code_used: None,
            password_hash,
            created_at: now,
            updated_at: now,
        };

        let user = self.storage.transaction(|tx| {
            if let Some(existing) = tx.get::<User>(Collection::Users, &email)? {
                return abort(if existing.deleted {
                    AppError::Forbidden("This account has been deactivated".into())
                } else {
                    AppError::Conflict(format!("User {email} already exists"))
                });
            }

            let mut user = template.clone();
            if let Some(mut invite) = tx.get::<Invite>(Collection::Invites, &email)? {
                if !invite.accepted {
                    user.community_id = Some(invite.community_id.clone());
                    user.role = invite.role;
                    invite.accepted = true;
                    invite.accepted_at = Some(now);
                    tx.put(Collection::Invites, &email, &invite)?;
                }
            }
            user.refresh_profile_completed();
            tx.put(Collection::Users, &email, &user)?;
            Ok(user)
        })?;

        info!(email = %user.email, role = ?user.role, community = ?user.community_id, "user created");
        Ok(user)
    }

    pub fn authenticate(&self, email: &str, password: &str) -> AppResult<User> {
        let email = normalize_email(email);
        let user: User = self
            .storage
            .get(Collection::Users, &email)?
            .ok_or_else(|| AppError::Unauthorized("Invalid email or password".into()))?;
        if !self.auth.verify_password(password, &user.password_hash) {
            return Err(AppError::Unauthorized("Invalid email or password".into()));
        }
        if user.deleted {
            return Err(AppError::Forbidden("This account has been deactivated".into()));
        }
        Ok(user)
    }

    pub fn get(&self, email: &str) -> AppResult<User> {
        let email = normalize_email(email);
        self.storage
            .get(Collection::Users, &email)?
            .ok_or_else(|| AppError::NotFound(format!("User {email} not found")))
    }

    pub fn update_profile(&self, email: &str, update: ProfileUpdate) -> AppResult<User> {
        let mut user = self.get(email)?;
        if let Some(name) = update.name {
            user.name = Some(name.trim().to_string()).filter(|n| !n.is_empty());
        }
        if let Some(flat) = update.flat_number {
            user.flat_number = Some(flat.trim().to_string()).filter(|f| !f.is_empty());
        }
        if let Some(phone) = update.phone {
            user.phone = Some(phone.trim().to_string()).filter(|p| !p.is_empty());
        }
        user.refresh_profile_completed();
        user.updated_at = self.clock.now();
        self.storage.put(Collection::Users, &user.email, &user)?;
        Ok(user)
    }

    pub fn list(&self, community_id: Option<&str>, include_deleted: bool) -> AppResult<Vec<User>> {
        self.storage.find(Collection::Users, |u: &User| {
            (include_deleted || !u.deleted)
                && community_id.map_or(true, |c| u.community_id.as_deref() == Some(c))
        })
    }

    fn managed_target(&self, actor: &User, email: &str) -> AppResult<User> {
        let target = self.get(email)?;
        if target.email == actor.email {
            return Err(AppError::Validation("You cannot change your own account here".into()));
        }
        if target.role == Role::SuperAdmin && actor.role != Role::SuperAdmin {
            return Err(AppError::Forbidden("Only super admins can manage super admins".into()));
        }
        match target.community_id.as_deref() {
            Some(community_id) => require_community_admin(actor, community_id)?,
            None if actor.role == Role::SuperAdmin => {}
            None => return Err(AppError::Forbidden("User is outside your community".into())),
        }
        Ok(target)
    }

    /// Soft delete: the profile stays, flagged, and can be restored.
    pub fn soft_delete(&self, actor: &User, email: &str) -> AppResult<User> {
        let mut target = self.managed_target(actor, email)?;
        let now = self.clock.now();
        target.deleted = true;
        target.deleted_at = Some(now);
        target.deleted_by = Some(actor.email.clone());
        target.updated_at = now;
        self.storage.put(Collection::Users, &target.email, &target)?;
        info!(email = %target.email, by = %actor.email, "user soft-deleted");
        Ok(target)
    }

    pub fn restore(&self, actor: &User, email: &str) -> AppResult<User> {
        let mut target = self.managed_target(actor, email)?;
        target.deleted = false;
        target.deleted_at = None;
        target.deleted_by = None;
        target.updated_at = self.clock.now();
        self.storage.put(Collection::Users, &target.email, &target)?;
        info!(email = %target.email, by = %actor.email, "user restored");
        Ok(target)
    }

    pub fn set_role(&self, actor: &User, email: &str, role: Role) -> AppResult<User> {
        if role == Role::SuperAdmin && actor.role != Role::SuperAdmin {
            return Err(AppError::Forbidden("Only super admins can grant super admin".into()));
        }
        let mut target = self.managed_target(actor, email)?;
        target.role = role;
        target.updated_at = self.clock.now();
        self.storage.put(Collection::Users, &target.email, &target)?;
        info!(email = %target.email, role = ?role, by = %actor.email, "role changed");
        Ok(target)
    }

    /// Invite an address into a community. An existing account joins
    /// immediately; otherwise the invite waits for registration.
    pub fn invite(&self, actor: &User, email: &str, role: Role, community_id: &str) -> AppResult<Invite> {
        require_community_admin(actor, community_id)?;
        if role == Role::SuperAdmin {
            return Err(AppError::Validation("Super admins cannot be invited".into()));
        }
        let email = normalize_email(email);
        if !email.contains('@') {
            return Err(AppError::Validation("A valid email is required".into()));
        }
        if !self.storage.exists(Collection::Communities, community_id)? {
            return Err(AppError::NotFound(format!("Community {community_id} not found")));
        }

        let now = self.clock.now();
        let invite = self.storage.transaction(|tx| {
            let mut invite = Invite {
                email: email.clone(),
                community_id: community_id.to_string(),
                role,
                invited_by: actor.email.clone(),
                accepted: false,
                accepted_at: None,
                created_at: now,
            };
            if let Some(mut user) = tx.get::<User>(Collection::Users, &email)? {
                if user.community_id.as_deref().is_some_and(|c| c != community_id) {
                    return abort(AppError::Conflict(format!(
                        "{email} already belongs to another community"
                    )));
                }
                user.community_id = Some(community_id.to_string());
                if user.role != Role::SuperAdmin {
                    user.role = role;
                }
                user.refresh_profile_completed();
                user.updated_at = now;
                tx.put(Collection::Users, &email, &user)?;
                invite.accepted = true;
                invite.accepted_at = Some(now);
            }
            tx.put(Collection::Invites, &email, &invite)?;
            Ok(invite)
        })?;
        info!(email = %invite.email, community = %invite.community_id, accepted = invite.accepted, "invite stored");
        Ok(invite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::AppConfig;
    use crate::models::Community;
    use chrono::Utc;

    fn directory() -> (UserDirectory, Storage) {
        let storage = Storage::temporary().unwrap();
        let mut auth = AppConfig::default().auth;
        auth.bcrypt_cost = 4;
        let dir = UserDirectory::new(
            storage.clone(),
            Arc::new(ManualClock::new(Utc::now())),
            Authenticator::new(&auth),
        );
        (dir, storage)
    }

    fn seed_community(storage: &Storage, id: &str) {
        let community = Community {
            id: id.into(),
            name: "Maple Court".into(),
            address: None,
            is_active: true,
            created_at: Utc::now(),
        };
        storage.put(Collection::Communities, id, &community).unwrap();
    }

    fn make_admin(dir: &UserDirectory, storage: &Storage, email: &str, community: &str) -> User {
        let mut admin = dir.register(email, "password123", None).unwrap();
        admin.role = Role::Admin;
        admin.community_id = Some(community.into());
        storage.put(Collection::Users, &admin.email, &admin).unwrap();
        admin
    }

    #[test]
    fn register_then_authenticate() {
        let (dir, _) = directory();
        let user = dir.register(" Ana@Example.com ", "password123", Some("Ana".into())).unwrap();
        assert_eq!(user.email, "ana@example.com");
        assert_eq!(user.role, Role::Resident);

        assert!(dir.authenticate("ana@example.com", "password123").is_ok());
        assert!(matches!(
            dir.authenticate("ana@example.com", "wrong-password"),
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            dir.register("ana@example.com", "password123", None),
            Err(AppError::Conflict(_))
        ));
    }

    #[test]
    fn pending_invite_is_applied_on_registration() {
        let (dir, storage) = directory();
        seed_community(&storage, "c1");
        let admin = make_admin(&dir, &storage, "admin@example.com", "c1");

        let invite = dir.invite(&admin, "bo@example.com", Role::Admin, "c1").unwrap();
        assert!(!invite.accepted);

        let bo = dir.register("bo@example.com", "password123", None).unwrap();
        assert_eq!(bo.community_id.as_deref(), Some("c1"));
        assert_eq!(bo.role, Role::Admin);
        let stored: Invite = storage.get(Collection::Invites, "bo@example.com").unwrap().unwrap();
        assert!(stored.accepted);
    }

    #[test]
    fn soft_delete_blocks_login_and_restore_reverts() {
        let (dir, storage) = directory();
        seed_community(&storage, "c1");
        let admin = make_admin(&dir, &storage, "admin@example.com", "c1");
        dir.register("cy@example.com", "password123", None).unwrap();
        dir.invite(&admin, "cy@example.com", Role::Resident, "c1").unwrap();

        let deleted = dir.soft_delete(&admin, "cy@example.com").unwrap();
        assert!(deleted.deleted);
        assert!(storage.exists(Collection::Users, "cy@example.com").unwrap());
        assert!(matches!(
            dir.authenticate("cy@example.com", "password123"),
            Err(AppError::Forbidden(_))
        ));

        dir.restore(&admin, "cy@example.com").unwrap();
        assert!(dir.authenticate("cy@example.com", "password123").is_ok());
    }

    #[test]
    fn admins_cannot_reach_other_communities() {
        let (dir, storage) = directory();
        seed_community(&storage, "c1");
        seed_community(&storage, "c2");
        let admin_one = make_admin(&dir, &storage, "one@example.com", "c1");
        let admin_two = make_admin(&dir, &storage, "two@example.com", "c2");

        assert!(matches!(
            dir.soft_delete(&admin_one, &admin_two.email),
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            dir.set_role(&admin_one, &admin_two.email, Role::SuperAdmin),
            Err(AppError::Forbidden(_))
        ));
    }
}
