use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use protocol::{Payload, QueryResult, Row};
use tokio::sync::RwLock;

use super::{ConfigError, DataSource, DataSourceConfig, SourceError, SourceKind};

/// Backend driver behind a [`ManagedSource`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    async fn open(&self, config: &DataSourceConfig) -> Result<Self::Handle, SourceError>;

    async fn execute(
        &self,
        handle: &Self::Handle,
        query: &str,
        params: &Payload,
    ) -> Result<Vec<Row>, SourceError>;

    async fn ping(&self, handle: &Self::Handle) -> bool;

    async fn close(&self, _handle: &Self::Handle) {}
}

/// Connection state machine shared by every source variant.
///
/// The handle is cloned out of the lock before any backend call and a new
/// connection is opened before the lock is taken to install it, so no lock
/// is held while the backend is busy.
pub struct ManagedSource<C: Connector> {
    config: DataSourceConfig,
    connector: C,
    handle: RwLock<Option<Arc<C::Handle>>>,
}

impl<C: Connector> ManagedSource<C> {
    pub fn new(config: DataSourceConfig, connector: C) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            connector,
            handle: RwLock::new(None),
        })
    }

    /// Database source; requires a connection string.
    pub fn database(config: DataSourceConfig, connector: C) -> Result<Self, ConfigError> {
        config.require_kind(SourceKind::Database)?;
        if config.connection_string().is_none() {
            return Err(ConfigError::MissingField {
                id: config.id().to_string(),
                field: "connection string",
            });
        }
        Self::new(config, connector)
    }

    /// API source; requires an endpoint.
    pub fn api(config: DataSourceConfig, connector: C) -> Result<Self, ConfigError> {
        config.require_kind(SourceKind::Api)?;
        if config.endpoint().is_none() {
            return Err(ConfigError::MissingField {
                id: config.id().to_string(),
                field: "endpoint",
            });
        }
        Self::new(config, connector)
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    async fn current_handle(&self) -> Option<Arc<C::Handle>> {
        self.handle.read().await.clone()
    }

    /// Drops `lost` unless a newer connection already replaced it.
    async fn discard(&self, lost: &Arc<C::Handle>) {
        let mut slot = self.handle.write().await;
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, lost)) {
            *slot = None;
            log::warn!("Data source '{}' lost its connection", self.config.id());
        }
    }
}

#[async_trait]
impl<C: Connector> DataSource for ManagedSource<C> {
    fn config(&self) -> &DataSourceConfig {
        &self.config
    }

    async fn is_connected(&self) -> bool {
        self.handle.read().await.is_some()
    }

    async fn connect(&self) -> Result<(), SourceError> {
        if self.is_connected().await {
            return Ok(());
        }

        let handle = match self.connector.open(&self.config).await {
            Ok(handle) => handle,
            Err(err) => {
                log::warn!("Connect to '{}' failed: {}", self.config.id(), err);
                return Err(err);
            }
        };

        let raced = {
            let mut slot = self.handle.write().await;
            if slot.is_some() {
                Some(handle)
            } else {
                *slot = Some(Arc::new(handle));
                None
            }
        };

        match raced {
            // Another task connected first; keep its handle.
            Some(extra) => self.connector.close(&extra).await,
            None => log::info!(
                "Connected to {} source '{}'",
                self.config.kind(),
                self.config.id()
            ),
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let handle = self.handle.write().await.take();
        if let Some(handle) = handle {
            self.connector.close(&handle).await;
            log::info!("Disconnected from source '{}'", self.config.id());
        }
    }

    async fn execute(&self, query: &str, params: &Payload) -> Result<QueryResult, SourceError> {
        let handle = self
            .current_handle()
            .await
            .ok_or_else(|| SourceError::NotConnected(self.config.id().to_string()))?;

        let started = Instant::now();
        match self.connector.execute(&handle, query, params).await {
            Ok(rows) => {
                let row_count = rows.len();
                Ok(QueryResult::rows(rows)
                    .with_metadata("source", self.config.id())
                    .with_metadata("row_count", row_count)
                    .with_query_time_ms(started.elapsed().as_secs_f64() * 1_000.0))
            }
            Err(err) => {
                if matches!(err, SourceError::ConnectionLost { .. }) {
                    self.discard(&handle).await;
                }
                Err(err)
            }
        }
    }

    async fn test_connection(&self) -> bool {
        match self.current_handle().await {
            Some(handle) => self.connector.ping(&handle).await,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Semaphore;

    use super::*;

    /// `open` parks until the test adds a permit to `gate`.
    #[derive(Clone)]
    struct GatedConnector {
        gate: Arc<Semaphore>,
        entered: Arc<Semaphore>,
        closes: Arc<AtomicUsize>,
    }

    impl GatedConnector {
        fn new() -> Self {
            Self {
                gate: Arc::new(Semaphore::new(0)),
                entered: Arc::new(Semaphore::new(0)),
                closes: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Connector for GatedConnector {
        type Handle = ();

        async fn open(&self, _config: &DataSourceConfig) -> Result<(), SourceError> {
            self.entered.add_permits(1);
            self.gate.acquire().await.unwrap().forget();
            Ok(())
        }

        async fn execute(&self, _: &(), _: &str, _: &Payload) -> Result<Vec<Row>, SourceError> {
            Ok(Vec::new())
        }

        async fn ping(&self, _: &()) -> bool {
            true
        }

        async fn close(&self, _: &()) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn gated_source() -> (Arc<ManagedSource<GatedConnector>>, GatedConnector) {
        let connector = GatedConnector::new();
        let config = DataSourceConfig::new("slow", SourceKind::Custom);
        let source = ManagedSource::new(config, connector.clone()).unwrap();
        (Arc::new(source), connector)
    }

    #[tokio::test]
    async fn slow_connect_does_not_block_readers() {
        let (source, connector) = gated_source();

        let connecting = tokio::spawn({
            let source = Arc::clone(&source);
            async move { source.connect().await }
        });
        connector.entered.acquire().await.unwrap().forget();

        let quick = Duration::from_millis(200);
        let info = tokio::time::timeout(quick, source.info()).await.unwrap();
        assert!(!info.connected);
        assert!(!tokio::time::timeout(quick, source.test_connection()).await.unwrap());

        connector.gate.add_permits(1);
        connecting.await.unwrap().unwrap();
        assert!(source.is_connected().await);
        assert!(source.test_connection().await);
    }

    #[tokio::test]
    async fn racing_connects_keep_one_handle() {
        let (source, connector) = gated_source();

        let first = tokio::spawn({
            let source = Arc::clone(&source);
            async move { source.connect().await }
        });
        let second = tokio::spawn({
            let source = Arc::clone(&source);
            async move { source.connect().await }
        });
        connector.entered.acquire_many(2).await.unwrap().forget();

        connector.gate.add_permits(2);
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert!(source.is_connected().await);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
    }
}
