//! Configuration loading and management.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listener configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Token and user-directory configuration.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Upstream API endpoints.
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Chat behavior tuning.
    #[serde(default)]
    pub chat: ChatConfig,
}

/// Network listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to (e.g., "0.0.0.0:9998").
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { listen: default_listen() }
    }
}

fn default_listen() -> SocketAddr {
    "0.0.0.0:9998".parse().expect("static listen address")
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

fn default_db_path() -> String {
    "chatd.sqlite".to_string()
}

/// Bearer-token and user-directory configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for the signed bearer token.
    #[serde(default)]
    pub jwt_secret: String,
    /// Cookie carrying the token.
    #[serde(default = "default_jwt_cookie")]
    pub jwt_cookie: String,
    /// User id this process authenticates as against the upstream API.
    #[serde(default)]
    pub api_user_id: String,
    /// Username directory endpoint; the external user id is appended.
    #[serde(default = "default_username_api")]
    pub username_api: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            jwt_cookie: default_jwt_cookie(),
            api_user_id: String::new(),
            username_api: default_username_api(),
        }
    }
}

fn default_jwt_cookie() -> String {
    "jwt".to_string()
}

fn default_username_api() -> String {
    "http://localhost:8076/api/username/".to_string()
}

/// Upstream API endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Long-polling viewer-state stream.
    #[serde(default = "default_viewer_state_api")]
    pub viewer_state_api: String,
    /// Emote manifest, re-fetched every minute.
    #[serde(default = "default_emote_manifest")]
    pub emote_manifest: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            viewer_state_api: default_viewer_state_api(),
            emote_manifest: default_emote_manifest(),
        }
    }
}

fn default_viewer_state_api() -> String {
    "http://localhost:8076/api/admin/viewer-state".to_string()
}

fn default_emote_manifest() -> String {
    "https://chat.strims.gg/emote-manifest.json".to_string()
}

/// Chat behavior tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    /// Base per-user message cooldown in milliseconds.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Ceiling for the multiplicative throttle backoff, in seconds.
    #[serde(default = "default_max_throttle_secs")]
    pub max_throttle_secs: u64,
    /// Number of broadcast frames kept for the history endpoint.
    #[serde(default = "default_message_cache_size")]
    pub message_cache_size: usize,
    /// Probability that an outbound message's emotes get the "rare" modifier.
    #[serde(default = "default_rare_chance")]
    pub rare_chance: f64,
    /// Snapshot file for the mute table and submode flag.
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_delay_ms(),
            max_throttle_secs: default_max_throttle_secs(),
            message_cache_size: default_message_cache_size(),
            rare_chance: default_rare_chance(),
            state_file: default_state_file(),
        }
    }
}

fn default_delay_ms() -> u64 {
    300
}

fn default_max_throttle_secs() -> u64 {
    300
}

fn default_message_cache_size() -> usize {
    150
}

fn default_rare_chance() -> f64 {
    0.01
}

fn default_state_file() -> String {
    ".state.bin".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            auth: AuthConfig::default(),
            upstream: UpstreamConfig::default(),
            chat: ChatConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Base message cooldown.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.chat.delay_ms)
    }

    /// Upper bound for the throttle delay scale:
    /// `ceil(max_throttle_time / delay)`.
    pub fn max_delay_scale(&self) -> u16 {
        let delay = self.chat.delay_ms.max(1);
        let max = self.chat.max_throttle_secs.saturating_mul(1000);
        max.div_ceil(delay).clamp(1, u16::MAX as u64) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.chat.delay_ms, 300);
        assert_eq!(config.chat.message_cache_size, 150);
        assert_eq!(config.auth.jwt_cookie, "jwt");
        assert_eq!(config.server.listen.port(), 9998);
    }

    #[test]
    fn max_delay_scale_from_defaults() {
        // 300 s of max throttle at a 300 ms base delay.
        assert_eq!(Config::default().max_delay_scale(), 1000);
    }

    #[test]
    fn parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [chat]
            delay_ms = 100
            rare_chance = 0.5

            [auth]
            jwt_secret = "hunter2"
            "#,
        )
        .expect("valid config");
        assert_eq!(config.chat.delay_ms, 100);
        assert_eq!(config.chat.rare_chance, 0.5);
        assert_eq!(config.auth.jwt_secret, "hunter2");
        // untouched sections keep their defaults
        assert_eq!(config.chat.message_cache_size, 150);
        assert_eq!(config.database.path, "chatd.sqlite");
    }

    #[test]
    fn parse_empty_toml() {
        let config: Config = toml::from_str("").expect("empty config is valid");
        assert_eq!(config.chat.delay_ms, 300);
    }
}
