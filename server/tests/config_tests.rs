use mcp_server::config::ServerConfig;
use mcp_server::source::SourceKind;
use serial_test::serial;
use std::time::Duration;

const SAMPLE_CONFIG: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/config/server.toml");

#[test]
fn test_load_server_config() {
    let config = ServerConfig::load_from_file(SAMPLE_CONFIG).expect("Failed to load config");

    assert_eq!(config.sources.len(), 2);
    assert_eq!(config.broker.port, 8000);
    assert!(config.security.enable_auth);
    assert_eq!(config.security.token_ttl(), Duration::from_secs(3600));
}

#[test]
fn test_config_source_structure() {
    let config = ServerConfig::load_from_file(SAMPLE_CONFIG).expect("Failed to load config");

    let users = config.source("users").expect("users source");
    assert_eq!(users.kind, SourceKind::Database);
    assert_eq!(users.backend, "memory");
    assert!(users.connection_string.is_some());
    assert_eq!(users.rows.len(), 2);

    let weather = config.source("weather").expect("weather source");
    assert_eq!(weather.kind, SourceKind::Api);
    assert_eq!(weather.max_retries, 2);
    assert_eq!(weather.latency(), Duration::from_millis(25));
}

#[test]
fn test_invalid_config_path() {
    let result = ServerConfig::load_from_file("nonexistent/config.toml");
    assert!(result.is_err());
}

#[test]
fn test_all_sources_have_unique_ids() {
    let config = ServerConfig::load_from_file(SAMPLE_CONFIG).expect("Failed to load config");

    let mut ids = std::collections::HashSet::new();
    for source in &config.sources {
        assert!(ids.insert(&source.id), "Duplicate source ID found: {}", source.id);
    }
}

#[test]
#[serial]
fn test_env_overrides() {
    std::env::set_var("SERVER_PORT", "9100");
    std::env::set_var("ENABLE_AUTH", "false");
    std::env::set_var("TOKEN_TTL_SECS", "60");

    let mut config = ServerConfig::default();
    config.apply_env_overrides();

    std::env::remove_var("SERVER_PORT");
    std::env::remove_var("ENABLE_AUTH");
    std::env::remove_var("TOKEN_TTL_SECS");

    assert_eq!(config.broker.port, 9100);
    assert!(!config.security.enable_auth);
    assert_eq!(config.security.token_ttl_secs, 60);
}

#[test]
#[serial]
fn test_unparseable_env_override_is_ignored() {
    std::env::set_var("SERVER_PORT", "not-a-port");

    let mut config = ServerConfig::default();
    config.apply_env_overrides();

    std::env::remove_var("SERVER_PORT");

    assert_eq!(config.broker.port, 8000);
}
