use std::{env, fmt::Display, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;
use tracing::{debug, warn};

const DEV_JWT_SECRET: &str = "circlein-development-secret";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set in production")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("unknown environment {other}")),
        }
    }
}

/// When a reminder is due: `startTime` falls inside
/// `[now + lead - tolerance, now + lead + tolerance]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReminderWindow {
    pub lead_minutes: i64,
    pub tolerance_minutes: i64,
}

impl ReminderWindow {
    /// Width used by the scheduled cron path.
    pub const NARROW: ReminderWindow = ReminderWindow {
        lead_minutes: 60,
        tolerance_minutes: 5,
    };

    /// Width used by the older on-demand reminder path.
    pub const WIDE: ReminderWindow = ReminderWindow {
        lead_minutes: 60,
        tolerance_minutes: 10,
    };

    pub fn bounds(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let lead = ChronoDuration::minutes(self.lead_minutes);
        let tolerance = ChronoDuration::minutes(self.tolerance_minutes);
        (now + lead - tolerance, now + lead + tolerance)
    }

    pub fn contains(&self, now: DateTime<Utc>, start_time: DateTime<Utc>) -> bool {
        let (from, to) = self.bounds(now);
        start_time >= from && start_time <= to
    }
}

impl Default for ReminderWindow {
    fn default() -> Self {
        Self::NARROW
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub session_ttl: Duration,
    pub custom_token_ttl: Duration,
    pub bcrypt_cost: u32,
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Pause between per-document writes.
    pub expiry_delay: Duration,
    pub reminder_window: ReminderWindow,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub relay_url: Option<String>,
    pub api_key: Option<String>,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub bind_addr: SocketAddr,
    pub data_path: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub auth: AuthConfig,
    pub cron_secret: Option<String>,
    pub sweep: SweepConfig,
    pub access_code_validity_days: i64,
    pub amenity_cache_ttl: Duration,
    pub mail: MailConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment: Environment = try_load("APP_ENV", "development")?;

        let jwt_secret = match var("JWT_SECRET") {
            Some(secret) => secret,
            None if environment == Environment::Production => {
                return Err(ConfigError::Missing("JWT_SECRET"))
            }
            None => {
                warn!("JWT_SECRET not set, using the development secret");
                DEV_JWT_SECRET.to_string()
            }
        };

        Ok(Self {
            environment,
            bind_addr: try_load("CIRCLEIN_BIND", "0.0.0.0:11111")?,
            data_path: try_load("CIRCLEIN_DATA", "circlein_data")?,
            log_dir: var("CIRCLEIN_LOG_DIR").map(PathBuf::from),
            auth: AuthConfig {
                jwt_secret,
                session_ttl: Duration::from_secs(try_load("SESSION_TTL_SECS", "86400")?),
                custom_token_ttl: Duration::from_secs(try_load("CUSTOM_TOKEN_TTL_SECS", "3600")?),
                bcrypt_cost: try_load("BCRYPT_COST", "12")?,
            },
            cron_secret: var("CRON_SECRET"),
            sweep: SweepConfig {
                expiry_delay: Duration::from_millis(try_load("EXPIRY_DELAY_MS", "50")?),
                reminder_window: ReminderWindow {
                    lead_minutes: try_load("REMINDER_LEAD_MINUTES", "60")?,
                    tolerance_minutes: try_load("REMINDER_TOLERANCE_MINUTES", "5")?,
                },
            },
            access_code_validity_days: try_load("ACCESS_CODE_VALIDITY_DAYS", "30")?,
            amenity_cache_ttl: Duration::from_secs(try_load("AMENITY_CACHE_TTL_SECS", "60")?),
            mail: MailConfig {
                relay_url: var("MAIL_RELAY_URL"),
                api_key: var("MAIL_API_KEY"),
                from: var("MAIL_FROM").unwrap_or_else(|| "CircleIn <no-reply@circlein.app>".into()),
            },
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 11111)),
            data_path: PathBuf::from("circlein_data"),
            log_dir: None,
            auth: AuthConfig {
                jwt_secret: DEV_JWT_SECRET.to_string(),
                session_ttl: Duration::from_secs(86_400),
                custom_token_ttl: Duration::from_secs(3_600),
                bcrypt_cost: bcrypt::DEFAULT_COST,
            },
            cron_secret: None,
            sweep: SweepConfig {
                expiry_delay: Duration::from_millis(50),
                reminder_window: ReminderWindow::default(),
            },
            access_code_validity_days: 30,
            amenity_cache_ttl: Duration::from_secs(60),
            mail: MailConfig {
                relay_url: None,
                api_key: None,
                from: "CircleIn <no-reply@circlein.app>".into(),
            },
        }
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn try_load<T: FromStr>(key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    let value = var(key).unwrap_or_else(|| {
        debug!("{key} not set, using default: {default}");
        default.to_string()
    });

    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: e.to_string(),
        value,
    })
}
