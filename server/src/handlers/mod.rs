pub mod health;
pub mod sources;
pub mod tokens;

use std::sync::Arc;

use actix_web::middleware::{from_fn, Logger};
use actix_web::{web, App, HttpServer};

use crate::config::AdminConfig;
use crate::middleware::{admin_auth_middleware, rate_limit_middleware, AdminKey, RateLimiter};
use crate::McpServer;

pub use health::{health_check, server_status};
pub use sources::list_sources;
pub use tokens::{issue_token, revoke_token};

/// Mounts the admin routes.
///
/// Expects `SourceRegistry`, `SourceHealthMonitor`, `SessionManager`,
/// `TokenStore`, `McpServer`, `RateLimiter` and `AdminKey` as app data.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(server_status)
        .service(
            web::resource("/sources")
                .wrap(from_fn(admin_auth_middleware))
                .route(web::get().to(list_sources)),
        )
        .service(
            web::resource("/tokens")
                .wrap(from_fn(rate_limit_middleware))
                .wrap(from_fn(admin_auth_middleware))
                .route(web::post().to(issue_token)),
        )
        .service(
            web::resource("/tokens/{token}")
                .wrap(from_fn(admin_auth_middleware))
                .route(web::delete().to(revoke_token)),
        );
}

/// Binds the admin HTTP server and runs it until it is stopped.
///
/// A bind failure is returned like any other server error so callers can
/// still shut the broker down.
pub async fn serve_admin(
    server: Arc<McpServer>,
    admin: &AdminConfig,
    token_limiter: RateLimiter,
    admin_key: AdminKey,
) -> std::io::Result<()> {
    let bound = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::from(Arc::clone(&server)))
            .app_data(web::Data::new(server.registry().clone()))
            .app_data(web::Data::new(server.tokens().clone()))
            .app_data(web::Data::new(server.sessions().clone()))
            .app_data(web::Data::new(server.health().clone()))
            .app_data(web::Data::new(token_limiter.clone()))
            .app_data(web::Data::new(admin_key.clone()))
            .wrap(Logger::default())
            .configure(configure)
    })
    .bind((admin.host.clone(), admin.port))?;

    bound.run().await
}
