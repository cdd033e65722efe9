//! Seed a local CircleIn store.
//!
//! Creates a demo community with a super admin, a community admin, a few
//! amenities and a batch of access codes, then prints the codes.
//! Run: cargo run --bin seed_data   (stop the server first; Sled locks the store)

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use circlein::access_codes::AccessCodes;
use circlein::amenities::{AmenityCatalog, AmenityInput};
use circlein::auth::Authenticator;
use circlein::clock::SystemClock;
use circlein::communities::Communities;
use circlein::config::AppConfig;
use circlein::models::{OperatingHours, Role};
use circlein::storage::{Collection, Storage};
use circlein::users::UserDirectory;

const SUPER_ADMIN: &str = "root@circlein.local";
const ADMIN: &str = "admin@maplecourt.local";

fn amenity(name: &str, kind: &str, capacity: u32, open: &str, close: &str, max_minutes: u32) -> AmenityInput {
    AmenityInput {
        name: Some(name.to_string()),
        amenity_type: Some(kind.to_string()),
        capacity: Some(capacity),
        operating_hours: Some(OperatingHours {
            open: open.to_string(),
            close: close.to_string(),
        }),
        max_duration_minutes: Some(max_minutes),
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env().context("invalid configuration")?;
    let password = std::env::var("SEED_PASSWORD").unwrap_or_else(|_| "circlein-demo".to_string());

    let storage = Storage::open(&config.data_path)
        .with_context(|| format!("cannot open store at {}", config.data_path.display()))?;
    if storage.exists(Collection::Users, SUPER_ADMIN)? {
        bail!("{} already seeded ({SUPER_ADMIN} exists)", config.data_path.display());
    }

    let clock = Arc::new(SystemClock);
    let auth = Authenticator::new(&config.auth);
    let directory = UserDirectory::new(storage.clone(), clock.clone(), auth);
    let communities = Communities::new(storage.clone(), clock.clone());
    let amenities = AmenityCatalog::new(storage.clone(), clock.clone(), config.amenity_cache_ttl);
    let codes = AccessCodes::new(storage.clone(), clock, config.access_code_validity_days);

    let mut root = directory.register(SUPER_ADMIN, &password, Some("CircleIn Root".into()))?;
    root.role = Role::SuperAdmin;
    storage.put(Collection::Users, &root.email, &root)?;
    println!("✅ Super admin {SUPER_ADMIN}");

    let community = communities.create(&root, "Maple Court", Some("12 Maple Avenue".into()))?;
    println!("✅ Community {} ({})", community.name, community.id);

    directory.register(ADMIN, &password, Some("Maple Court Office".into()))?;
    directory.invite(&root, ADMIN, Role::Admin, &community.id)?;
    println!("✅ Community admin {ADMIN}");

    for input in [
        amenity("Swimming Pool", "pool", 8, "06:00", "21:00", 120),
        amenity("Tennis Court", "sports", 1, "06:00", "22:00", 60),
        amenity("Party Hall", "hall", 1, "09:00", "23:00", 240),
        amenity("Gym", "fitness", 12, "05:00", "23:00", 90),
    ] {
        let input = AmenityInput {
            community_id: Some(community.id.clone()),
            ..input
        };
        let created = amenities.create(&root, input)?;
        println!("✅ Amenity {} (capacity {})", created.name, created.capacity);
    }

    let batch = codes.generate(&root, &community.id, 10)?;
    println!("✅ {} access codes for {}:", batch.len(), community.name);
    for code in &batch {
        println!("   {}", code.code);
    }

    storage.flush().await?;
    println!("Seeded {}. Sign in with password {password:?}.", config.data_path.display());
    Ok(())
}
