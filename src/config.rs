//! Configuration types.
//!
//! Everything is read once from the environment in `main` and then passed
//! down as explicit values.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::capabilities::{HttpFetcherConfig, SmtpConfig};
use crate::error::ConfigError;
use crate::pipeline::RetryPolicy;

/// Process-wide settings.
#[derive(Debug, Clone)]
pub struct OutreachConfig {
    /// Empty when unset; only required for non-dry runs.
    pub api_key: SecretString,
    pub model: String,
    pub db_path: PathBuf,
    /// Directory for daily rolling log files. Stderr only when unset.
    pub log_dir: Option<PathBuf>,
    pub sender_name: String,
    pub smtp: SmtpConfig,
    pub fetcher: HttpFetcherConfig,
    pub retry: RetryPolicy,
    /// Deadline for a single capability call.
    pub call_timeout: Duration,
}

impl Default for OutreachConfig {
    fn default() -> Self {
        Self {
            api_key: SecretString::from(String::new()),
            model: "claude-sonnet-4-20250514".to_string(),
            db_path: PathBuf::from("./data/outreach.db"),
            log_dir: None,
            sender_name: "The Outreach Team".to_string(),
            smtp: SmtpConfig {
                host: String::new(),
                port: 587,
                username: String::new(),
                password: SecretString::from(String::new()),
                from_address: String::new(),
                from_name: String::new(),
                timeout: Duration::from_secs(30),
            },
            fetcher: HttpFetcherConfig::default(),
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(120),
        }
    }
}

impl OutreachConfig {
    /// Build from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(key) = get("ANTHROPIC_API_KEY") {
            config.api_key = SecretString::from(key);
        }
        if let Some(model) = get("OUTREACH_MODEL") {
            config.model = model;
        }
        if let Some(path) = get("OUTREACH_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        config.log_dir = get("OUTREACH_LOG_DIR").map(PathBuf::from);
        if let Some(name) = get("OUTREACH_SENDER_NAME") {
            config.sender_name = name;
        }

        // ── SMTP ──
        if let Some(host) = get("SMTP_HOST") {
            config.smtp.host = host;
        }
        config.smtp.port = parse_or(&get, "SMTP_PORT", config.smtp.port)?;
        if let Some(username) = get("SMTP_USERNAME") {
            config.smtp.username = username;
        }
        if let Some(password) = get("SMTP_PASSWORD") {
            config.smtp.password = SecretString::from(password);
        }
        config.smtp.from_address =
            get("SMTP_FROM_ADDRESS").unwrap_or_else(|| config.smtp.username.clone());
        config.smtp.from_name = config.sender_name.clone();

        // ── Pacing & timeouts ──
        let spacing_ms = parse_or(
            &get,
            "OUTREACH_FETCH_SPACING_MS",
            config.fetcher.min_spacing.as_millis() as u64,
        )?;
        config.fetcher.min_spacing = Duration::from_millis(spacing_ms);
        let timeout_secs = parse_or(
            &get,
            "OUTREACH_CALL_TIMEOUT_SECS",
            config.call_timeout.as_secs(),
        )?;
        if timeout_secs == 0 {
            return Err(invalid("OUTREACH_CALL_TIMEOUT_SECS", "must be at least 1"));
        }
        config.call_timeout = Duration::from_secs(timeout_secs);

        // ── Retry ──
        let max_attempts = parse_or(&get, "OUTREACH_MAX_ATTEMPTS", config.retry.scrape.max_attempts)?;
        if max_attempts == 0 {
            return Err(invalid("OUTREACH_MAX_ATTEMPTS", "must be at least 1"));
        }
        let base_ms = parse_or(
            &get,
            "OUTREACH_BASE_DELAY_MS",
            config.retry.scrape.base_delay.as_millis() as u64,
        )?;
        let max_delay_ms = parse_or(
            &get,
            "OUTREACH_MAX_DELAY_MS",
            config.retry.max_delay.as_millis() as u64,
        )?;
        let reformulation_ceiling = parse_or(
            &get,
            "OUTREACH_REFORMULATION_CEILING",
            config.retry.reformulation_ceiling,
        )?;

        // The rate-limit base keeps its default ratio to the base delay.
        let defaults = RetryPolicy::default().scrape;
        let rate_limit_factor = (defaults.rate_limited_base_delay.as_millis()
            / defaults.base_delay.as_millis().max(1)) as u32;
        for stage in [
            &mut config.retry.scrape,
            &mut config.retry.analyze,
            &mut config.retry.draft,
            &mut config.retry.send,
        ] {
            stage.max_attempts = max_attempts;
            stage.base_delay = Duration::from_millis(base_ms);
            stage.rate_limited_base_delay = stage.base_delay * rate_limit_factor;
        }
        config.retry.max_delay = Duration::from_millis(max_delay_ms);
        config.retry.reformulation_ceiling = reformulation_ceiling;

        Ok(config)
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| invalid(key, e.to_string())),
        None => Ok(default),
    }
}
