use actix_web::{web, HttpResponse};
use serde::Serialize;

use crate::error::Result;
use crate::monitor::{SourceHealth, SourceHealthMonitor};
use crate::source::{SourceInfo, SourceRegistry};

#[derive(Debug, Serialize)]
pub struct SourceListing {
    #[serde(flatten)]
    pub info: SourceInfo,
    pub health: Option<SourceHealth>,
}

#[derive(Debug, Serialize)]
pub struct SourceListResponse {
    pub sources: Vec<SourceListing>,
}

/// `GET /sources`, admin only.
pub async fn list_sources(
    registry: web::Data<SourceRegistry>,
    health_monitor: web::Data<SourceHealthMonitor>,
) -> Result<HttpResponse> {
    let sources = registry
        .list()
        .await
        .into_values()
        .map(|info| SourceListing {
            health: health_monitor.status(&info.id),
            info,
        })
        .collect();

    Ok(HttpResponse::Ok().json(SourceListResponse { sources }))
}
