use actix_web::{get, web, HttpResponse};
use serde::Serialize;

use crate::broker::SessionManager;
use crate::error::Result;
use crate::monitor::SourceHealthMonitor;
use crate::server::McpServer;
use crate::source::SourceRegistry;

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: String,
    pub active_sessions: usize,
    pub data_sources: usize,
    pub online_sources: usize,
}

#[get("/health")]
pub async fn health_check(
    registry: web::Data<SourceRegistry>,
    health_monitor: web::Data<SourceHealthMonitor>,
    session_manager: Option<web::Data<SessionManager>>,
) -> Result<HttpResponse> {
    let active_sessions = session_manager
        .map(|manager| manager.active_session_count())
        .unwrap_or(0);

    let response = HealthCheckResponse {
        status: "healthy".to_string(),
        active_sessions,
        data_sources: registry.len(),
        online_sources: health_monitor.online_count(),
    };

    Ok(HttpResponse::Ok().json(response))
}

#[get("/status")]
pub async fn server_status(server: web::Data<McpServer>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(server.get_status().await))
}
