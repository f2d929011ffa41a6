use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};
use crate::security::TokenStore;

#[derive(Debug, Deserialize)]
pub struct IssueTokenRequest {
    pub user_id: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct IssueTokenResponse {
    pub token: String,
    pub user_id: String,
    pub expires_in: u64,
}

#[derive(Debug, Serialize)]
pub struct RevokeTokenResponse {
    pub revoked: bool,
}

/// `POST /tokens`, admin only and rate limited.
pub async fn issue_token(
    req: web::Json<IssueTokenRequest>,
    tokens: web::Data<TokenStore>,
) -> Result<HttpResponse> {
    let IssueTokenRequest {
        user_id,
        permissions,
    } = req.into_inner();

    let user_id = user_id.trim().to_string();
    if user_id.is_empty() {
        return Err(ServerError::BadRequest("user_id must not be empty".to_string()));
    }

    let token = tokens.issue(&user_id, permissions);

    Ok(HttpResponse::Created().json(IssueTokenResponse {
        token,
        user_id,
        expires_in: tokens.ttl().as_secs(),
    }))
}

/// `DELETE /tokens/{token}`, admin only.
pub async fn revoke_token(
    path: web::Path<String>,
    tokens: web::Data<TokenStore>,
) -> Result<HttpResponse> {
    let revoked = tokens.revoke(&path.into_inner());
    if revoked {
        log::info!("Revoked token via admin API");
    }

    Ok(HttpResponse::Ok().json(RevokeTokenResponse { revoked }))
}
