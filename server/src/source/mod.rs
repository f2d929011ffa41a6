//! Pluggable data sources and the registry the broker dispatches to.

pub mod config;
pub mod managed;
pub mod memory;
pub mod registry;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use protocol::{ErrorKind, Payload, QueryResult};
use serde::{Deserialize, Serialize};

pub use config::{ConfigError, DataSourceConfig};
pub use managed::{Connector, ManagedSource};
pub use memory::InMemoryConnector;
pub use registry::{RegistryError, SourceRegistry};

use crate::config::SourceEntry;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Database,
    Api,
    Filesystem,
    #[default]
    Custom,
}

impl SourceKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            SourceKind::Database => "database",
            SourceKind::Api => "api",
            SourceKind::Filesystem => "filesystem",
            SourceKind::Custom => "custom",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend failures observed while connecting to or querying a source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("failed to connect to '{source_id}': {reason}")]
    Connect { source_id: String, reason: String },

    #[error("data source '{0}' is not connected")]
    NotConnected(String),

    #[error("connection to '{source_id}' lost: {reason}")]
    ConnectionLost { source_id: String, reason: String },

    #[error("query on '{source_id}' timed out after {timeout_ms}ms")]
    Timeout { source_id: String, timeout_ms: u64 },

    #[error("data source '{source_id}' is unavailable: {reason}")]
    Unavailable { source_id: String, reason: String },

    #[error("query failed: {0}")]
    Query(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl SourceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SourceError::Connect { .. } | SourceError::Unavailable { .. } => {
                ErrorKind::ConnectError
            }
            SourceError::NotConnected(_) | SourceError::ConnectionLost { .. } => {
                ErrorKind::NotConnected
            }
            SourceError::Timeout { .. } => ErrorKind::Timeout,
            SourceError::Query(_) | SourceError::InvalidQuery(_) => ErrorKind::QueryFailed,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, SourceError::Query(_) | SourceError::InvalidQuery(_))
    }

    /// Failures after which the next attempt must reconnect first.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            SourceError::Connect { .. }
                | SourceError::NotConnected(_)
                | SourceError::ConnectionLost { .. }
        )
    }
}

/// Snapshot of a source for listings.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SourceInfo {
    pub id: String,
    pub kind: SourceKind,
    pub connected: bool,
    pub endpoint: Option<String>,
}

/// A named backend the broker can query.
///
/// `connect` and `disconnect` are idempotent. `execute` reports failures as
/// typed errors; `query` folds them into a failed [`QueryResult`].
#[async_trait]
pub trait DataSource: Send + Sync {
    fn config(&self) -> &DataSourceConfig;

    fn id(&self) -> &str {
        self.config().id()
    }

    fn kind(&self) -> SourceKind {
        self.config().kind()
    }

    async fn is_connected(&self) -> bool;

    async fn connect(&self) -> Result<(), SourceError>;

    async fn disconnect(&self);

    /// Drops any current connection and opens a new one.
    async fn reconnect(&self) -> Result<(), SourceError> {
        self.disconnect().await;
        self.connect().await
    }

    async fn execute(&self, query: &str, params: &Payload) -> Result<QueryResult, SourceError>;

    async fn query(&self, query: &str, params: &Payload) -> QueryResult {
        match self.execute(query, params).await {
            Ok(result) => result,
            Err(err) => QueryResult::failure(err.kind(), err.to_string()),
        }
    }

    /// Probes the live connection without changing state.
    async fn test_connection(&self) -> bool;

    async fn info(&self) -> SourceInfo {
        SourceInfo {
            id: self.id().to_string(),
            kind: self.kind(),
            connected: self.is_connected().await,
            endpoint: self.config().display_endpoint(),
        }
    }
}

/// Builds a source declared in the config file.
pub fn from_entry(entry: &SourceEntry) -> Result<Arc<dyn DataSource>, ConfigError> {
    if entry.backend != "memory" {
        return Err(ConfigError::UnsupportedBackend {
            id: entry.id.clone(),
            backend: entry.backend.clone(),
        });
    }

    let mut config = DataSourceConfig::new(entry.id.clone(), entry.kind)
        .with_timeout(entry.timeout())
        .with_max_retries(entry.max_retries);
    if let Some(connection_string) = &entry.connection_string {
        config = config.with_connection_string(connection_string.clone());
    }
    if let Some(endpoint) = &entry.endpoint {
        config = config.with_endpoint(endpoint.clone());
    }
    for (key, secret) in &entry.credentials {
        config = config.with_credential(key.clone(), secret.clone());
    }

    let connector = InMemoryConnector::new(entry.rows.clone()).with_latency(entry.latency());
    let source: Arc<dyn DataSource> = match entry.kind {
        SourceKind::Database => Arc::new(ManagedSource::database(config, connector)?),
        SourceKind::Api => Arc::new(ManagedSource::api(config, connector)?),
        _ => Arc::new(ManagedSource::new(config, connector)?),
    };
    Ok(source)
}
