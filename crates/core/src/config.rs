use std::time::Duration;
use tracing::Level;

use crate::display::TranscriptPolicy;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

pub const DEFAULT_SERVER_URL: &str = "http://localhost:8000";
pub const DEFAULT_ICE_SERVERS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];
pub const DEFAULT_ICE_GATHERING_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_TRANSCRIPT_DEBOUNCE: Duration = Duration::from_millis(1000);
pub const DEFAULT_DISPLAY_CLEAR_DELAY: Duration = Duration::from_millis(1500);
pub const DEFAULT_CHANNEL_LABEL: &str = "chat";

/// Everything the voice client needs that is supplied from outside.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the signaling service (`/api/offer` is appended).
    pub server_url: String,
    /// Bearer token handed out by the login flow. Only the binary requires it.
    pub auth_token: Option<String>,
    /// STUN/TURN discovery endpoints.
    pub ice_servers: Vec<String>,
    pub ice_gathering_timeout: Duration,
    pub transcript_debounce: Duration,
    pub display_clear_delay: Duration,
    pub channel_label: String,
    pub transcript_policy: TranscriptPolicy,
    pub log_level: Level,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            auth_token: None,
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            ice_gathering_timeout: DEFAULT_ICE_GATHERING_TIMEOUT,
            transcript_debounce: DEFAULT_TRANSCRIPT_DEBOUNCE,
            display_clear_delay: DEFAULT_DISPLAY_CLEAR_DELAY,
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            transcript_policy: TranscriptPolicy::Current,
            log_level: Level::INFO,
        }
    }
}

fn is_ice_url(url: &str) -> bool {
    ["stun:", "turn:", "turns:"]
        .iter()
        .any(|scheme| url.starts_with(scheme))
}

impl ClientConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        let defaults = Self::default();

        let server_url = std::env::var("PARLEY_SERVER_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.server_url);
        if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "PARLEY_SERVER_URL".to_string(),
                format!("'{}' is not an http(s) URL", server_url),
            ));
        }

        let auth_token = std::env::var("PARLEY_AUTH_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty());

        let ice_servers = match std::env::var("PARLEY_ICE_SERVERS") {
            Ok(list) => {
                let servers: Vec<String> = list
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
                if let Some(bad) = servers.iter().find(|s| !is_ice_url(s)) {
                    return Err(ConfigError::InvalidValue(
                        "PARLEY_ICE_SERVERS".to_string(),
                        format!("'{}' is not a stun/turn URL", bad),
                    ));
                }
                servers
            }
            Err(_) => defaults.ice_servers,
        };

        let ice_gathering_timeout =
            duration_ms("PARLEY_ICE_GATHERING_TIMEOUT_MS", defaults.ice_gathering_timeout)?;
        let transcript_debounce =
            duration_ms("PARLEY_TRANSCRIPT_DEBOUNCE_MS", defaults.transcript_debounce)?;
        let display_clear_delay =
            duration_ms("PARLEY_DISPLAY_CLEAR_DELAY_MS", defaults.display_clear_delay)?;

        let channel_label =
            std::env::var("PARLEY_CHANNEL_LABEL").unwrap_or(defaults.channel_label);

        let transcript_policy = match std::env::var("PARLEY_TRANSCRIPT_POLICY") {
            Ok(value) => value.parse::<TranscriptPolicy>().map_err(|_| {
                ConfigError::InvalidValue(
                    "PARLEY_TRANSCRIPT_POLICY".to_string(),
                    format!("'{}' is not one of 'current', 'history'", value),
                )
            })?,
            Err(_) => defaults.transcript_policy,
        };

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            server_url,
            auth_token,
            ice_servers,
            ice_gathering_timeout,
            transcript_debounce,
            display_clear_delay,
            channel_label,
            transcript_policy,
            log_level,
        })
    }

    /// Returns the auth token or the error the binary reports when it is absent.
    pub fn require_auth_token(&self) -> Result<&str, ConfigError> {
        self.auth_token
            .as_deref()
            .ok_or_else(|| ConfigError::MissingVar("PARLEY_AUTH_TOKEN".to_string()))
    }
}

fn duration_ms(var: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| ConfigError::InvalidValue(var.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}
