use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use protocol::{Payload, Row};

use super::{Connector, DataSourceConfig, SourceError};

/// Fixture backend that answers every query with the same rows.
#[derive(Debug, Clone, Default)]
pub struct InMemoryConnector {
    rows: Arc<Vec<Row>>,
    latency: Duration,
    fail_connect: bool,
}

#[derive(Debug)]
pub struct MemoryHandle {
    rows: Arc<Vec<Row>>,
    opened_at: DateTime<Utc>,
}

impl MemoryHandle {
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }
}

impl InMemoryConnector {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: Arc::new(rows),
            ..Self::default()
        }
    }

    /// Delay applied to every query.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes every `open` fail.
    pub fn failing(mut self) -> Self {
        self.fail_connect = true;
        self
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    type Handle = MemoryHandle;

    async fn open(&self, config: &DataSourceConfig) -> Result<MemoryHandle, SourceError> {
        if self.fail_connect {
            return Err(SourceError::Connect {
                source_id: config.id().to_string(),
                reason: "backend refused connection".to_string(),
            });
        }

        Ok(MemoryHandle {
            rows: Arc::clone(&self.rows),
            opened_at: Utc::now(),
        })
    }

    async fn execute(
        &self,
        handle: &MemoryHandle,
        query: &str,
        _params: &Payload,
    ) -> Result<Vec<Row>, SourceError> {
        if query.trim().is_empty() {
            return Err(SourceError::InvalidQuery("query text is empty".to_string()));
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(handle.rows.as_ref().clone())
    }

    async fn ping(&self, _handle: &MemoryHandle) -> bool {
        true
    }
}
