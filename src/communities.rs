use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::models::{Community, Role, User};
use crate::storage::{Collection, Storage};

fn require_super_admin(actor: &User) -> AppResult<()> {
    if actor.role != Role::SuperAdmin {
        return Err(AppError::Forbidden("Super admin access required".into()));
    }
    Ok(())
}

#[derive(Clone)]
pub struct Communities {
    storage: Storage,
    clock: Arc<dyn Clock>,
}

impl Communities {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    pub fn create(&self, actor: &User, name: &str, address: Option<String>) -> AppResult<Community> {
        require_super_admin(actor)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("Community name is required".into()));
        }
        let community = Community {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            address: address.map(|a| a.trim().to_string()).filter(|a| !a.is_empty()),
            is_active: true,
            created_at: self.clock.now(),
        };
        self.storage
            .put(Collection::Communities, &community.id, &community)?;
        info!(community_id = %community.id, name = %community.name, by = %actor.email, "community created");
        Ok(community)
    }

    pub fn get(&self, id: &str) -> AppResult<Community> {
        self.storage
            .get(Collection::Communities, id)?
            .ok_or_else(|| AppError::NotFound(format!("Community {id} not found")))
    }

    pub fn list(&self, actor: &User) -> AppResult<Vec<Community>> {
        require_super_admin(actor)?;
        let mut items: Vec<Community> = self.storage.list(Collection::Communities)?;
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use chrono::Utc;

    fn actor(role: Role) -> User {
        let now = Utc::now();
        User {
            email: "root@example.com".into(),
            name: None,
            role,
            community_id: None,
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
    fn only_super_admins_manage_communities() {
        let communities = Communities::new(Storage::temporary().unwrap(), Arc::new(SystemClock));
        let err = communities
            .create(&actor(Role::Admin), "Oak Park", None)
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let root = actor(Role::SuperAdmin);
        let created = communities
            .create(&root, "  Oak Park ", Some(" ".into()))
            .unwrap();
        assert_eq!(created.name, "Oak Park");
        assert_eq!(created.address, None);
        assert_eq!(communities.list(&root).unwrap(), vec![created.clone()]);
        assert_eq!(communities.get(&created.id).unwrap(), created);
    }
}
