use std::{env, fmt, net::SocketAddr, time::Duration};

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://menu.db?mode=rwc";
pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_RESTAURANT_NAME: &str = "The Menu Restaurant";
pub const DEFAULT_MENU_LINK: &str = "https://nav-menu-app.vercel.app";
pub const DEFAULT_TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01/";
const DEFAULT_LOW_STOCK_THRESHOLD: i64 = 5;
const DEFAULT_NOTIFY_TIMEOUT_SECS: u64 = 10;

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

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
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

/// Account credentials for the messaging provider.
#[derive(Clone)]
pub struct TwilioCredentials {
    pub account_sid: String,
    pub auth_token: String,
    pub from_phone: String,
}

impl fmt::Debug for TwilioCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwilioCredentials")
            .field("account_sid", &self.account_sid)
            .field("auth_token", &"<redacted>")
            .field("from_phone", &self.from_phone)
            .finish()
    }
}

/// Outbound notification settings. `credentials` is `None` when any of the
/// three provider variables is missing, which turns dispatch into a no-op.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub credentials: Option<TwilioCredentials>,
    pub api_base: String,
    pub timeout: Duration,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub timezone: String,
    pub restaurant_name: String,
    pub menu_link: String,
    pub low_stock_threshold: i64,
    pub notify: NotifyConfig,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let low_stock_threshold = match non_empty("LOW_STOCK_THRESHOLD") {
            Some(raw) => raw
                .parse::<i64>()
                .ok()
                .filter(|value| *value >= 0)
                .ok_or(ConfigError::InvalidNumber {
                    key: "LOW_STOCK_THRESHOLD",
                    value: raw,
                })?,
            None => DEFAULT_LOW_STOCK_THRESHOLD,
        };

        let timeout_secs = match non_empty("NOTIFY_TIMEOUT_SECS") {
            Some(raw) => raw
                .parse::<u64>()
                .ok()
                .filter(|value| *value > 0)
                .ok_or(ConfigError::InvalidNumber {
                    key: "NOTIFY_TIMEOUT_SECS",
                    value: raw,
                })?,
            None => DEFAULT_NOTIFY_TIMEOUT_SECS,
        };

        let credentials = match (
            non_empty("TWILIO_ACCOUNT_SID"),
            non_empty("TWILIO_AUTH_TOKEN"),
            non_empty("TWILIO_PHONE_NUMBER"),
        ) {
            (Some(account_sid), Some(auth_token), Some(from_phone)) => Some(TwilioCredentials {
                account_sid,
                auth_token,
                from_phone,
            }),
            _ => None,
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url: non_empty("DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            timezone: non_empty("RESTAURANT_TIMEZONE")
                .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string()),
            restaurant_name: non_empty("RESTAURANT_NAME")
                .unwrap_or_else(|| DEFAULT_RESTAURANT_NAME.to_string()),
            menu_link: non_empty("MENU_LINK").unwrap_or_else(|| DEFAULT_MENU_LINK.to_string()),
            low_stock_threshold,
            notify: NotifyConfig {
                credentials,
                api_base: non_empty("TWILIO_API_BASE")
                    .unwrap_or_else(|| DEFAULT_TWILIO_API_BASE.to_string()),
                timeout: Duration::from_secs(timeout_secs),
            },
        })
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidNumber { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidNumber { key, value } => {
                write!(f, "{key} must be a valid non-negative number (got {value})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
