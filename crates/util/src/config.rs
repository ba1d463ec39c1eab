use std::{env, fmt, net::SocketAddr, time::Duration};

use chrono_tz::Tz;

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://certwatch.db";
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_REMINDER_COOLDOWN_DAYS: i64 = 30;
pub const MAX_REMINDER_COOLDOWN_DAYS: i64 = 3650;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Reminder cool-down as configured, before it is bound to the policy type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownSetting {
    /// Reuse each definition's reminder lead time.
    LeadTime,
    Days(i64),
}

impl CooldownSetting {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("lead_time") {
            return Ok(Self::LeadTime);
        }
        match trimmed.parse::<i64>() {
            Ok(days) if (0..=MAX_REMINDER_COOLDOWN_DAYS).contains(&days) => Ok(Self::Days(days)),
            _ => Err(ConfigError::InvalidCooldown(value.to_string())),
        }
    }
}

/// Connection settings for the template-mail delivery service.
#[derive(Clone)]
pub struct MailerConfig {
    pub base_url: String,
    pub api_key: String,
    pub signing_secret: Vec<u8>,
}

impl fmt::Debug for MailerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailerConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("signing_secret", &"<redacted>")
            .finish()
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub site_timezone: Tz,
    pub mailer: MailerConfig,
    /// `None` disables the built-in sweep worker.
    pub sweep_interval: Option<Duration>,
    pub reminder_cooldown: CooldownSetting,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let site_timezone = match env::var("SITE_TIMEZONE") {
            Ok(value) => value
                .parse::<Tz>()
                .map_err(|_| ConfigError::InvalidTimezone(value))?,
            Err(_) => Tz::UTC,
        };

        let mailer = MailerConfig {
            base_url: required("MAILER_BASE_URL")?,
            api_key: required("MAILER_API_KEY")?,
            signing_secret: hex::decode(required("MAILER_SIGNING_SECRET")?)
                .map_err(|_| ConfigError::InvalidSigningSecret)?,
        };

        let sweep_interval = match env::var("SWEEP_INTERVAL_SECS") {
            Ok(value) => value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidSweepInterval(value))?,
            Err(_) => DEFAULT_SWEEP_INTERVAL_SECS,
        };
        let sweep_interval = (sweep_interval > 0).then(|| Duration::from_secs(sweep_interval));

        let reminder_cooldown = match env::var("SWEEP_REMINDER_COOLDOWN") {
            Ok(value) => CooldownSetting::parse(&value)?,
            Err(_) => CooldownSetting::Days(DEFAULT_REMINDER_COOLDOWN_DAYS),
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            site_timezone,
            mailer,
            sweep_interval,
            reminder_cooldown,
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    Missing(&'static str),
    InvalidTimezone(String),
    InvalidSigningSecret,
    InvalidSweepInterval(String),
    InvalidCooldown(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::Missing(name) => write!(f, "{name} must be set"),
            Self::InvalidTimezone(value) => {
                write!(f, "SITE_TIMEZONE must be an IANA timezone name (got {value})")
            }
            Self::InvalidSigningSecret => {
                write!(f, "MAILER_SIGNING_SECRET must be hex encoded")
            }
            Self::InvalidSweepInterval(value) => write!(
                f,
                "SWEEP_INTERVAL_SECS must be a non-negative integer (got {value})"
            ),
            Self::InvalidCooldown(value) => write!(
                f,
                "SWEEP_REMINDER_COOLDOWN must be 'lead_time' or 0..={MAX_REMINDER_COOLDOWN_DAYS} days (got {value})"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
