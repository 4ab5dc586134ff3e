//! Configuration module for chatstream.
//!
//! Loads configuration from TOML files with environment variable substitution,
//! then applies a small set of environment overrides.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 8000
//! api_key = "${CHATSTREAM_API_KEY}"
//!
//! [redis]
//! url = "${REDIS_URL}"
//!
//! [consumer]
//! group = "backend-stream"
//! reconnect_delay_ms = 5000
//! ```

use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{DEFAULT_CONSUMER_GROUP, REQUEST_STREAM_NAME, TOKEN_STREAM_NAME};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ChatStreamConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: None,
        }
    }
}

fn default_port() -> u16 {
    8000
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

/// Broker consumer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerConfig {
    /// Consumer name inside the group (defaults to hostname or UUID)
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_consumer_group")]
    pub group: String,

    /// Stream carrying chunk and final events from the workers
    #[serde(default = "default_token_stream")]
    pub token_stream: String,

    /// Stream the originating chat requests are published to
    #[serde(default = "default_request_stream")]
    pub request_stream: String,

    /// Fixed delay between reconnect attempts after a transient failure
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_block_ms")]
    pub block_ms: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            name: None,
            group: default_consumer_group(),
            token_stream: default_token_stream(),
            request_stream: default_request_stream(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            block_ms: default_block_ms(),
            batch_size: default_batch_size(),
        }
    }
}

impl ConsumerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

fn default_consumer_group() -> String {
    DEFAULT_CONSUMER_GROUP.to_string()
}

fn default_token_stream() -> String {
    TOKEN_STREAM_NAME.to_string()
}

fn default_request_stream() -> String {
    REQUEST_STREAM_NAME.to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

fn default_block_ms() -> usize {
    2000
}

fn default_batch_size() -> usize {
    10
}

/// Correlation hub configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HubConfig {
    /// Queue capacity of each live subscriber
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: default_subscriber_capacity(),
        }
    }
}

fn default_subscriber_capacity() -> usize {
    200
}

/// Message store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,

    /// Approximate cap on each per-session message stream
    #[serde(default = "default_max_len")]
    pub max_len: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            stream_prefix: default_stream_prefix(),
            max_len: default_max_len(),
        }
    }
}

fn default_stream_prefix() -> String {
    "chat:messages".to_string()
}

fn default_max_len() -> usize {
    10000
}

/// Shutdown configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ShutdownConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

impl ChatStreamConfig {
    /// Load configuration from the default path or CHATSTREAM_CONFIG env var,
    /// then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = env::var("CHATSTREAM_CONFIG")
            .unwrap_or_else(|_| "config/chatstream.toml".to_string());

        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;

        info!(
            token_stream = %config.consumer.token_stream,
            consumer_group = %config.consumer.group,
            reconnect_delay_ms = config.consumer.reconnect_delay_ms,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Parse configuration text, substituting `${VAR}` placeholders.
    ///
    /// Placeholders whose variable is not set fall back to the field default.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);

        debug!("Parsing TOML configuration");
        let mut config: ChatStreamConfig = toml::from_str(&content)?;
        config.drop_placeholders();
        config.validate()?;

        Ok(config)
    }

    /// Environment variables take precedence over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("REDIS_URL") {
            self.redis.url = url;
        }
        if let Ok(port) = env::var("PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!(port = %port, "Ignoring invalid PORT"),
            }
        }
        if let Ok(key) = env::var("CHATSTREAM_API_KEY") {
            self.server.api_key = Some(key);
        }
        if let Ok(name) = env::var("CHATSTREAM_WORKER_NAME") {
            self.consumer.name = Some(name);
        }
    }

    fn drop_placeholders(&mut self) {
        if is_placeholder(&self.redis.url) {
            warn!(url = %self.redis.url, "Redis URL not substituted, using default");
            self.redis.url = default_redis_url();
        }
        if self.server.api_key.as_deref().is_some_and(is_placeholder) {
            warn!("API key not substituted, leaving it unset");
            self.server.api_key = None;
        }
        if self.consumer.name.as_deref().is_some_and(is_placeholder) {
            self.consumer.name = None;
        }
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.redis.url.starts_with("redis://") && !self.redis.url.starts_with("rediss://") {
            return Err(ConfigError::ValidationError(format!(
                "Redis URL '{}' must start with redis:// or rediss://",
                self.redis.url
            )));
        }

        if self.consumer.group.is_empty() {
            return Err(ConfigError::ValidationError(
                "Consumer group must not be empty".to_string(),
            ));
        }

        if self.consumer.token_stream.is_empty() || self.consumer.request_stream.is_empty() {
            return Err(ConfigError::ValidationError(
                "Stream names must not be empty".to_string(),
            ));
        }

        if self.consumer.token_stream == self.consumer.request_stream {
            return Err(ConfigError::ValidationError(format!(
                "Token and request streams must differ (both '{}')",
                self.consumer.token_stream
            )));
        }

        if self.consumer.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "Consumer batch_size must be at least 1".to_string(),
            ));
        }

        if self.hub.subscriber_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "Hub subscriber_capacity must be at least 1".to_string(),
            ));
        }

        if self.consumer.reconnect_delay_ms == 0 {
            warn!("Reconnect delay is zero, transient failures will retry in a tight loop");
        }

        Ok(())
    }

    /// Consumer name from config, hostname, or a random UUID.
    pub fn worker_name(&self) -> String {
        if let Some(name) = &self.consumer.name {
            return name.clone();
        }

        if let Ok(hostname) = hostname::get() {
            if let Some(name) = hostname.to_str() {
                return format!("chatstream-{}", name);
            }
        }

        format!("chatstream-{}", uuid::Uuid::new_v4())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown.timeout_secs)
    }
}

fn is_placeholder(value: &str) -> bool {
    value.contains("${")
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
    })
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    placeholder_regex()
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("CHATSTREAM_TEST_VAR", "substituted_value");
        let input = "url = \"${CHATSTREAM_TEST_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"substituted_value\"");
        env::remove_var("CHATSTREAM_TEST_VAR");
    }

    #[test]
    fn test_env_var_not_set() {
        let input = "url = \"${CHATSTREAM_NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"${CHATSTREAM_NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_default_config() {
        let config = ChatStreamConfig::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert_eq!(config.consumer.group, "backend-stream");
        assert_eq!(config.consumer.token_stream, "llm:chat:token");
        assert_eq!(config.consumer.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.hub.subscriber_capacity, 200);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_parse_consumer_section() {
        let toml = r#"
            [consumer]
            group = "edge"
            reconnect_delay_ms = 250
            batch_size = 32

            [hub]
            subscriber_capacity = 16
        "#;

        let config = ChatStreamConfig::from_toml(toml).unwrap();
        assert_eq!(config.consumer.group, "edge");
        assert_eq!(config.consumer.reconnect_delay(), Duration::from_millis(250));
        assert_eq!(config.consumer.batch_size, 32);
        assert_eq!(config.consumer.request_stream, "llm:chat:request");
        assert_eq!(config.hub.subscriber_capacity, 16);
    }

    #[test]
    fn test_unsubstituted_placeholders_fall_back() {
        let toml = r#"
            [server]
            api_key = "${CHATSTREAM_UNSET_KEY}"

            [redis]
            url = "${CHATSTREAM_UNSET_URL}"
        "#;

        let config = ChatStreamConfig::from_toml(toml).unwrap();
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert!(config.server.api_key.is_none());
    }

    #[test]
    fn test_validation_invalid_redis_url() {
        let toml = r#"
            [redis]
            url = "http://localhost:6379"
        "#;

        assert!(matches!(
            ChatStreamConfig::from_toml(toml),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_validation_zero_capacity() {
        let toml = r#"
            [hub]
            subscriber_capacity = 0
        "#;

        assert!(ChatStreamConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_validation_same_streams() {
        let toml = r#"
            [consumer]
            token_stream = "llm"
            request_stream = "llm"
        "#;

        assert!(ChatStreamConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_configured_worker_name() {
        let mut config = ChatStreamConfig::default();
        config.consumer.name = Some("ingest-1".to_string());
        assert_eq!(config.worker_name(), "ingest-1");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ChatStreamConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.server.port, 8000);
    }
}
