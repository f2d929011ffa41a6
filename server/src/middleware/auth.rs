use actix_web::{
    body::MessageBody,
    dev::{ServiceRequest, ServiceResponse},
    error::ErrorUnauthorized,
    http::header,
    middleware::Next,
};
use sha2::{Digest, Sha256};

/// Key that admin requests must present as `Authorization: Bearer <key>`.
///
/// Without a configured key every protected route rejects.
#[derive(Clone, Default)]
pub struct AdminKey {
    digest: Option<[u8; 32]>,
}

impl AdminKey {
    pub fn new(key: Option<&str>) -> Self {
        Self {
            digest: key.filter(|k| !k.is_empty()).map(digest),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.digest.is_some()
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.digest
            .map(|expected| expected == digest(candidate))
            .unwrap_or(false)
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

pub async fn admin_auth_middleware(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, actix_web::Error> {
    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or_else(|| ErrorUnauthorized("Authentication required"))?;

    let admin_key = req
        .app_data::<actix_web::web::Data<AdminKey>>()
        .ok_or_else(|| ErrorUnauthorized("Admin key not configured"))?;

    if !admin_key.matches(provided) {
        log::warn!(
            "Rejected admin request to {} from {:?}",
            req.path(),
            req.peer_addr()
        );
        return Err(ErrorUnauthorized("Invalid admin key"));
    }

    next.call(req).await
}
