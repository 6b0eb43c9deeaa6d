//! Configuration management for Murmur
//!
//! Defaults, TOML files and `MURMUR_<SECTION>_<KEY>` environment variables,
//! validated before use.

use crate::core_channel::ReconnectPolicy;
use crate::core_model::ConversationId;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Message server endpoints and credentials
    pub server: ServerConfig,

    /// Push channel behaviour
    pub channel: ChannelConfig,

    /// Fallback poller
    pub poller: PollerConfig,

    /// Local key storage
    pub keys: KeysConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP base URL, e.g. `https://chat.example.org`
    pub base_url: String,

    /// WebSocket base URL, e.g. `wss://chat.example.org`
    pub ws_url: String,

    /// Path templates; `{contact}` is replaced by the contact id
    pub chat_path: String,
    pub security_path: String,
    pub fetch_path: String,
    pub send_path: String,
    pub decrypt_path: String,

    /// Raw `Cookie` header of the authenticated session
    pub session_cookie: Option<String>,

    /// CSRF token sent with state-changing requests
    pub csrf_token: Option<String>,

    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

/// Push channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Policy of the chat channel
    pub policy: ReconnectPolicy,

    /// Retry delay of the security verification channel
    #[serde(with = "humantime_serde")]
    pub security_retry: Duration,

    /// Send read receipts for inbound peer messages automatically
    pub auto_acknowledge: bool,
}

/// Fallback poller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

/// Key storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysConfig {
    /// Directory holding the key slot
    pub dir: PathBuf,

    /// Encrypt the slot at rest; the passphrase comes from `MURMUR_KEYS_PASSPHRASE`
    pub encrypt_at_rest: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Describe and record delivery metrics
    pub enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            ws_url: "ws://127.0.0.1:8000".to_string(),
            chat_path: "/ws/chat/{contact}/".to_string(),
            security_path: "/ws/security/{contact}/".to_string(),
            fetch_path: "/api/get-messages/{contact}/".to_string(),
            send_path: "/api/send-message/".to_string(),
            decrypt_path: "/api/decrypt_message/".to_string(),
            session_cookie: None,
            csrf_token: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::FailFastToFallback,
            security_retry: Duration::from_secs(3),
            auto_acknowledge: true,
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5000),
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/keys"),
            encrypt_at_rest: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl ServerConfig {
    fn join(base: &str, path: &str, contact: Option<&ConversationId>) -> String {
        let path = match contact {
            Some(contact) => path.replace("{contact}", contact.0.as_str()),
            None => path.to_string(),
        };
        format!("{}{}", base.trim_end_matches('/'), path)
    }

    pub fn chat_endpoint(&self, contact: &ConversationId) -> String {
        Self::join(&self.ws_url, &self.chat_path, Some(contact))
    }

    pub fn security_endpoint(&self, contact: &ConversationId) -> String {
        Self::join(&self.ws_url, &self.security_path, Some(contact))
    }

    pub fn fetch_url(&self, contact: &ConversationId) -> String {
        Self::join(&self.base_url, &self.fetch_path, Some(contact))
    }

    pub fn send_url(&self) -> String {
        Self::join(&self.base_url, &self.send_path, None)
    }

    pub fn decrypt_url(&self) -> String {
        Self::join(&self.base_url, &self.decrypt_path, None)
    }
}

fn parse_duration(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    humantime_serde::re::humantime::parse_duration(raw)
        .map_err(|e| ConfigError::invalid_value(key, e))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    raw.parse()
        .map_err(|e: std::str::ParseBoolError| ConfigError::invalid_value(key, e))
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: MURMUR_<SECTION>_<KEY>
    /// Example: MURMUR_POLLER_INTERVAL=10s
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Server config
        if let Some(url) = lookup("MURMUR_SERVER_BASE_URL") {
            config.server.base_url = url;
        }
        if let Some(url) = lookup("MURMUR_SERVER_WS_URL") {
            config.server.ws_url = url;
        }
        if let Some(cookie) = lookup("MURMUR_SERVER_SESSION_COOKIE") {
            config.server.session_cookie = Some(cookie);
        }
        if let Some(token) = lookup("MURMUR_SERVER_CSRF_TOKEN") {
            config.server.csrf_token = Some(token);
        }
        if let Some(timeout) = lookup("MURMUR_SERVER_REQUEST_TIMEOUT") {
            config.server.request_timeout = parse_duration("MURMUR_SERVER_REQUEST_TIMEOUT", &timeout)?;
        }

        // Channel config
        if let Some(policy) = lookup("MURMUR_CHANNEL_POLICY") {
            config.channel.policy = match policy.as_str() {
                "fail_fast" | "fail_fast_to_fallback" => ReconnectPolicy::FailFastToFallback,
                "persistent" | "persistent_retry" => {
                    let delay = match lookup("MURMUR_CHANNEL_RETRY_DELAY") {
                        Some(raw) => parse_duration("MURMUR_CHANNEL_RETRY_DELAY", &raw)?,
                        None => config.channel.security_retry,
                    };
                    ReconnectPolicy::persistent(delay)
                }
                other => {
                    return Err(ConfigError::invalid_value(
                        "MURMUR_CHANNEL_POLICY",
                        format!("unknown policy {}", other),
                    ))
                }
            };
        }
        if let Some(retry) = lookup("MURMUR_CHANNEL_SECURITY_RETRY") {
            config.channel.security_retry = parse_duration("MURMUR_CHANNEL_SECURITY_RETRY", &retry)?;
        }
        if let Some(ack) = lookup("MURMUR_CHANNEL_AUTO_ACKNOWLEDGE") {
            config.channel.auto_acknowledge = parse_bool("MURMUR_CHANNEL_AUTO_ACKNOWLEDGE", &ack)?;
        }

        // Poller config
        if let Some(interval) = lookup("MURMUR_POLLER_INTERVAL") {
            config.poller.interval = parse_duration("MURMUR_POLLER_INTERVAL", &interval)?;
        }

        // Keys config
        if let Some(dir) = lookup("MURMUR_KEYS_DIR") {
            config.keys.dir = PathBuf::from(dir);
        }
        if let Some(encrypt) = lookup("MURMUR_KEYS_ENCRYPT_AT_REST") {
            config.keys.encrypt_at_rest = parse_bool("MURMUR_KEYS_ENCRYPT_AT_REST", &encrypt)?;
        }

        // Logging config
        if let Some(level) = lookup("MURMUR_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(json) = lookup("MURMUR_LOG_JSON") {
            config.logging.json_format = parse_bool("MURMUR_LOG_JSON", &json)?;
        }

        // Metrics config
        if let Some(enabled) = lookup("MURMUR_METRICS_ENABLED") {
            config.metrics.enabled = parse_bool("MURMUR_METRICS_ENABLED", &enabled)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.server.base_url.starts_with("http://") || self.server.base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "base_url must be an http(s) URL: {}",
                self.server.base_url
            )));
        }
        if !(self.server.ws_url.starts_with("ws://") || self.server.ws_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "ws_url must be a ws(s) URL: {}",
                self.server.ws_url
            )));
        }
        for (name, path) in [
            ("chat_path", &self.server.chat_path),
            ("security_path", &self.server.security_path),
            ("fetch_path", &self.server.fetch_path),
        ] {
            if !path.contains("{contact}") {
                return Err(ConfigError::Invalid(format!(
                    "{} must contain the {{contact}} placeholder",
                    name
                )));
            }
        }

        if self.poller.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "poller interval must be greater than 0".to_string(),
            ));
        }
        if self.channel.security_retry.is_zero()
            || self.channel.policy.retry_delay().is_some_and(|d| d.is_zero())
        {
            return Err(ConfigError::Invalid(
                "retry delay must be greater than 0".to_string(),
            ));
        }

        // Validate logging config
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(())
    }
}
