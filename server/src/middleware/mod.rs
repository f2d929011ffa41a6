pub mod auth;
pub mod rate_limit;

pub use auth::{admin_auth_middleware, AdminKey};
pub use rate_limit::{rate_limit_middleware, RateLimiter};
