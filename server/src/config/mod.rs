use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use protocol::{CodecLimits, Row, MAX_FRAME_BODY};

use crate::error::{Result, ServerError};
use crate::source::SourceKind;

pub const DEFAULT_CONFIG_PATH: &str = "server/config/server.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub broker: BrokerConfig,
    pub security: SecurityConfig,
    pub admin: AdminConfig,
    pub monitor: MonitorConfig,
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub handshake_timeout_ms: u64,
    /// Zero disables the idle timeout.
    pub idle_timeout_secs: u64,
    pub max_in_flight: usize,
    pub drain_timeout_ms: u64,
    pub max_frame_bytes: usize,
    pub default_source: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub enable_auth: bool,
    pub secret_key: Option<String>,
    pub token_ttl_secs: u64,
    pub max_attempts: usize,
    pub attempt_window_secs: u64,
    pub sweep_interval_secs: u64,
    pub enforce_permissions: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub admin_key: Option<String>,
    pub token_rate_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub probe_interval_secs: u64,
}

/// A data source declared in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub id: String,
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default = "default_backend")]
    pub backend: String,
    pub connection_string: Option<String>,
    pub endpoint: Option<String>,
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
    #[serde(default = "default_source_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(default)]
    pub latency_ms: u64,
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_source_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8000,
            handshake_timeout_ms: 5_000,
            idle_timeout_secs: 300,
            max_in_flight: 32,
            drain_timeout_ms: 5_000,
            max_frame_bytes: CodecLimits::default().max_frame_payload_size,
            default_source: None,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_auth: true,
            secret_key: None,
            token_ttl_secs: 3_600,
            max_attempts: 5,
            attempt_window_secs: 300,
            sweep_interval_secs: 60,
            enforce_permissions: false,
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8081,
            admin_key: None,
            token_rate_limit: 10,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 30,
        }
    }
}

impl BrokerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Frame limits, capped at what the u32 length prefix can carry.
    pub fn codec_limits(&self) -> CodecLimits {
        CodecLimits {
            max_frame_payload_size: self.max_frame_bytes.min(MAX_FRAME_BODY),
        }
    }
}

impl SecurityConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn attempt_window(&self) -> Duration {
        Duration::from_secs(self.attempt_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl MonitorConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }
}

impl SourceEntry {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

impl ServerConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("Failed to read config file: {}", e)))?;

        let config: ServerConfig = toml::from_str(&content)
            .map_err(|e| ServerError::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    /// Applies `SERVER_HOST`, `SERVER_PORT`, `ADMIN_PORT`, `ENABLE_AUTH`,
    /// `TOKEN_TTL_SECS`, `ADMIN_KEY` and `SECRET_KEY` on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("SERVER_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = env_parse("SERVER_PORT") {
            self.broker.port = port;
        }
        if let Some(port) = env_parse("ADMIN_PORT") {
            self.admin.port = port;
        }
        if let Ok(value) = std::env::var("ENABLE_AUTH") {
            self.security.enable_auth = parse_flag(&value);
        }
        if let Some(ttl) = env_parse("TOKEN_TTL_SECS") {
            self.security.token_ttl_secs = ttl;
        }
        if let Ok(key) = std::env::var("ADMIN_KEY") {
            self.admin.admin_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Ok(secret) = std::env::var("SECRET_KEY") {
            self.security.secret_key = Some(secret).filter(|s| !s.is_empty());
        }
    }

    pub fn source(&self, id: &str) -> Option<&SourceEntry> {
        self.sources.iter().find(|s| s.id == id)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ServerConfig::default();
        assert_eq!(config.broker.port, 8000);
        assert!(config.security.enable_auth);
        assert_eq!(config.security.token_ttl(), Duration::from_secs(3600));
        assert_eq!(config.security.max_attempts, 5);
        assert!(config.broker.handshake_timeout().as_millis() > 0);
        assert!(config.sources.is_empty());
    }

    #[test]
    fn test_parse_sources() {
        let toml_content = r#"
[broker]
port = 9000
default_source = "users"

[[sources]]
id = "users"
kind = "database"
connection_string = "postgres://app:secret@db/users"
timeout_secs = 2
max_retries = 1
rows = [{ id = 1, name = "alice" }]

[[sources]]
id = "weather"
kind = "api"
endpoint = "https://weather.example.com"
        "#;

        let config: ServerConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.broker.port, 9000);
        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.broker.default_source.as_deref(), Some("users"));
        assert_eq!(config.sources.len(), 2);

        let users = config.source("users").unwrap();
        assert_eq!(users.kind, SourceKind::Database);
        assert_eq!(users.backend, "memory");
        assert_eq!(users.timeout(), Duration::from_secs(2));
        assert_eq!(users.rows[0]["name"], "alice");

        let weather = config.source("weather").unwrap();
        assert_eq!(weather.max_retries, 3);
        assert_eq!(weather.timeout_secs, 30);
    }

    #[test]
    fn test_zero_idle_timeout_disables() {
        let config: ServerConfig = toml::from_str("[broker]\nidle_timeout_secs = 0\n").unwrap();
        assert!(config.broker.idle_timeout().is_none());
    }

    #[test]
    fn test_frame_limit_capped_at_length_prefix() {
        let mut config = ServerConfig::default();
        config.broker.max_frame_bytes = usize::MAX;
        assert_eq!(
            config.broker.codec_limits().max_frame_payload_size,
            MAX_FRAME_BODY
        );

        config.broker.max_frame_bytes = 4096;
        assert_eq!(config.broker.codec_limits().max_frame_payload_size, 4096);
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("TRUE"));
        assert!(parse_flag("on"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("nope"));
    }
}
