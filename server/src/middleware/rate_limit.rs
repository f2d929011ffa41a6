use actix_web::{
    body::MessageBody,
    dev::{ServiceRequest, ServiceResponse},
    error::ErrorTooManyRequests,
    middleware::Next,
};
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_MAX_REQUESTS: usize = 10;
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window counter per client IP.
///
/// The admin surface uses it per request; the broker uses it to count
/// failed handshakes.
#[derive(Clone)]
pub struct RateLimiter {
    requests: Arc<DashMap<IpAddr, Vec<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW)
    }

    pub fn with_limits(max_requests: usize, window: Duration) -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
            max_requests,
            window,
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Records a request unless `ip` is already at its limit.
    pub fn check_rate_limit(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut entry = self.requests.entry(ip).or_insert_with(Vec::new);

        entry.retain(|&timestamp| now.duration_since(timestamp) < self.window);

        if entry.len() >= self.max_requests {
            return false;
        }

        entry.push(now);
        true
    }

    /// True when `ip` has used up its window without recording anything.
    pub fn is_limited(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        match self.requests.get_mut(&ip) {
            Some(mut entry) => {
                entry.retain(|&timestamp| now.duration_since(timestamp) < self.window);
                entry.len() >= self.max_requests
            }
            None => false,
        }
    }

    pub fn record(&self, ip: IpAddr) {
        self.requests.entry(ip).or_default().push(Instant::now());
    }

    pub fn clear(&self, ip: IpAddr) {
        self.requests.remove(&ip);
    }

    pub fn cleanup_old_entries(&self) {
        let now = Instant::now();

        self.requests.retain(|_, timestamps| {
            timestamps.retain(|&timestamp| now.duration_since(timestamp) < self.window);
            !timestamps.is_empty()
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn rate_limit_middleware(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, actix_web::Error> {
    // Get client IP
    let peer_addr = req
        .peer_addr()
        .ok_or_else(|| ErrorTooManyRequests("Unable to determine client IP"))?;

    let ip = peer_addr.ip();

    let rate_limiter = req
        .app_data::<actix_web::web::Data<RateLimiter>>()
        .ok_or_else(|| ErrorTooManyRequests("Rate limiter not available"))?;

    if !rate_limiter.check_rate_limit(ip) {
        log::warn!("Rate limit exceeded for IP: {}", ip);
        return Err(ErrorTooManyRequests("Too many requests"));
    }

    next.call(req).await
}
