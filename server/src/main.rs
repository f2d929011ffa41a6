use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use mcp_server::config::{ServerConfig, DEFAULT_CONFIG_PATH};
use mcp_server::handlers;
use mcp_server::middleware::{AdminKey, RateLimiter};
use mcp_server::McpServer;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Try the current directory first, then server/
    if dotenvy::dotenv().is_err() {
        dotenvy::from_filename("server/.env").ok();
    }

    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    log::info!("Starting MCP broker...");
    log::info!("Protocol version: {}", protocol::protocol_version());

    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let mut config = ServerConfig::load_from_file(&config_path).unwrap_or_else(|e| {
        log::warn!(
            "Failed to load configuration from '{}': {}. Falling back to defaults.",
            config_path,
            e
        );
        ServerConfig::default()
    });
    config.apply_env_overrides();

    let server = Arc::new(McpServer::new(config.clone()).context("failed to build broker")?);
    let registered = server.register_configured_sources();
    log::info!(
        "Registered {}/{} configured data sources",
        registered,
        config.sources.len()
    );

    let broker_addr = server.start().await.context("failed to start broker")?;
    log::info!("Broker accepting sessions on {}", broker_addr);

    if config.admin.enabled {
        let admin_key = AdminKey::new(config.admin.admin_key.as_deref());
        if !admin_key.is_configured() {
            log::warn!("ADMIN_KEY is not set; protected admin routes will reject every request");
        }
        let token_limiter =
            RateLimiter::with_limits(config.admin.token_rate_limit, Duration::from_secs(60));

        let limiter_clone = token_limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                limiter_clone.cleanup_old_entries();
                log::debug!("Background cleanup: cleaned rate limiter entries");
            }
        });

        log::info!(
            "Starting admin HTTP server at {}:{}...",
            config.admin.host,
            config.admin.port
        );

        let http_result = handlers::serve_admin(
            Arc::clone(&server),
            &config.admin,
            token_limiter,
            admin_key,
        )
        .await;

        if let Err(err) = &http_result {
            log::error!("Admin HTTP server failed: {}", err);
        }
    } else {
        log::info!("Admin HTTP server disabled; press Ctrl+C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")?;
    }

    server.stop().await;
    Ok(())
}
