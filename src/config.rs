use std::env;
use std::net::SocketAddr;

use crate::services::payment_store::TransitionPolicy;
use crate::services::session_bridge::MappingConflictPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Stripe,
    Creem,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub frontend_origin: String,
    pub bind_addr: SocketAddr,
    pub payment_provider: ProviderKind,
    pub payment_webhook_secret: String,
    pub transition_policy: TransitionPolicy,
    pub mapping_conflict_policy: MappingConflictPolicy,
    pub session_cookie_name: String,
    pub legacy_session_cookie_name: String,
    pub session_ttl_hours: i64,
    pub auth_cookie_secure: bool,
    pub generation_api_url: Option<String>,
    pub generation_api_key: Option<String>,
    pub run_migrations: bool,
    pub sentry_dsn: Option<String>,
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn optional(key: &'static str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional(key) {
        None => Ok(default),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { key, value }),
        },
    }
}

fn parse_with<T>(
    key: &'static str,
    default: T,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, ConfigError> {
    match optional(key) {
        None => Ok(default),
        Some(value) => parse(value.trim()).ok_or(ConfigError::Invalid { key, value }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok(); // Load .env file

        let payment_provider = parse_with("PAYMENT_PROVIDER", ProviderKind::Stripe, |v| {
            match v.to_ascii_lowercase().as_str() {
                "stripe" => Some(ProviderKind::Stripe),
                "creem" => Some(ProviderKind::Creem),
                _ => None,
            }
        })?;

        let transition_policy = if parse_bool("STRICT_STATUS_TRANSITIONS", false)? {
            TransitionPolicy::Strict
        } else {
            TransitionPolicy::Permissive
        };

        let mapping_conflict_policy = parse_with(
            "MAPPING_CONFLICT_POLICY",
            MappingConflictPolicy::Reject,
            |v| match v.to_ascii_lowercase().as_str() {
                "reject" => Some(MappingConflictPolicy::Reject),
                "ignore" => Some(MappingConflictPolicy::Ignore),
                _ => None,
            },
        )?;

        Ok(Config {
            database_url: required("DATABASE_URL")?,
            frontend_origin: optional("FRONTEND_ORIGIN")
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
            bind_addr: parse_with(
                "BIND_ADDR",
                SocketAddr::from(([127, 0, 0, 1], 3000)),
                |v| v.parse().ok(),
            )?,
            payment_provider,
            payment_webhook_secret: required("PAYMENT_WEBHOOK_SECRET")?,
            transition_policy,
            mapping_conflict_policy,
            session_cookie_name: optional("SESSION_COOKIE_NAME")
                .unwrap_or_else(|| "auth_session".to_string()),
            legacy_session_cookie_name: optional("LEGACY_SESSION_COOKIE_NAME")
                .unwrap_or_else(|| "legacy_session".to_string()),
            session_ttl_hours: parse_with("SESSION_TTL_HOURS", 168, |v| {
                v.parse::<i64>().ok().filter(|h| *h > 0)
            })?,
            auth_cookie_secure: parse_bool("AUTH_COOKIE_SECURE", true)?,
            generation_api_url: optional("GENERATION_API_URL"),
            generation_api_key: optional("GENERATION_API_KEY"),
            run_migrations: parse_bool("RUN_MIGRATIONS", true)?,
            sentry_dsn: optional("SENTRY_DSN"),
        })
    }
}
