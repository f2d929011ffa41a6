//! Bearer tokens handed to agents and checked by the broker.

pub mod token_store;

pub use token_store::{TokenError, TokenRecord, TokenStore, MIN_SECRET_LEN};

/// Grants queries against every data source.
pub const QUERY_ANY: &str = "query:*";

/// Permission required to query `source` when permissions are enforced.
pub fn query_permission(source: &str) -> String {
    format!("query:{source}")
}
