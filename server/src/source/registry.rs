use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{ConfigError, DataSource, SourceInfo};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("data source '{0}' is already registered")]
    DuplicateSource(String),

    #[error("invalid data source config: {0}")]
    InvalidConfig(#[from] ConfigError),
}

/// Named data sources shared by every session.
///
/// Lookups hand out `Arc` clones; no shard guard is held across an await.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: Arc<DashMap<String, Arc<dyn DataSource>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `id` to `source`; an id that is already taken is rejected.
    pub fn register(
        &self,
        id: impl Into<String>,
        source: Arc<dyn DataSource>,
    ) -> Result<(), RegistryError> {
        source.config().validate()?;

        match self.sources.entry(id.into()) {
            Entry::Occupied(entry) => Err(RegistryError::DuplicateSource(entry.key().clone())),
            Entry::Vacant(entry) => {
                log::info!(
                    "Registered {} data source '{}'",
                    source.kind(),
                    entry.key()
                );
                entry.insert(source);
                Ok(())
            }
        }
    }

    /// Binds `id` to `source`, disconnecting whatever was bound before.
    pub async fn replace(
        &self,
        id: impl Into<String>,
        source: Arc<dyn DataSource>,
    ) -> Result<Option<Arc<dyn DataSource>>, RegistryError> {
        source.config().validate()?;

        let id = id.into();
        let previous = self.sources.insert(id.clone(), source);
        if let Some(previous) = &previous {
            previous.disconnect().await;
            log::info!("Replaced data source '{}'", id);
        }
        Ok(previous)
    }

    pub async fn unregister(&self, id: &str) -> bool {
        let removed = self.sources.remove(id);
        match removed {
            Some((_, source)) => {
                source.disconnect().await;
                log::info!("Unregistered data source '{}'", id);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn DataSource>> {
        self.sources.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sources.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sources.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Id/source pairs copied out of the map.
    pub fn entries(&self) -> Vec<(String, Arc<dyn DataSource>)> {
        self.sources
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    pub async fn list(&self) -> BTreeMap<String, SourceInfo> {
        let mut listing = BTreeMap::new();
        for (id, source) in self.entries() {
            listing.insert(id, source.info().await);
        }
        listing
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub async fn disconnect_all(&self) {
        for (_, source) in self.entries() {
            source.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{DataSourceConfig, InMemoryConnector, ManagedSource, SourceKind};
    use std::time::Duration;

    fn memory_source(id: &str) -> Arc<dyn DataSource> {
        let config = DataSourceConfig::new(id, SourceKind::Custom);
        Arc::new(ManagedSource::new(config, InMemoryConnector::default()).unwrap())
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = SourceRegistry::new();
        registry.register("db", memory_source("db")).unwrap();

        let err = registry.register("db", memory_source("db")).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateSource("db".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn replace_disconnects_previous() {
        let registry = SourceRegistry::new();
        let first = memory_source("db");
        first.connect().await.unwrap();
        registry.register("db", Arc::clone(&first)).unwrap();

        let previous = registry.replace("db", memory_source("db")).await.unwrap();
        assert!(previous.is_some());
        assert!(!first.is_connected().await);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn unregister_disconnects_and_is_noop_when_absent() {
        let registry = SourceRegistry::new();
        let source = memory_source("db");
        source.connect().await.unwrap();
        registry.register("db", Arc::clone(&source)).unwrap();

        assert!(registry.unregister("db").await);
        assert!(!source.is_connected().await);
        assert!(!registry.unregister("db").await);
        assert!(registry.get("db").is_none());
    }

    #[tokio::test]
    async fn list_is_a_snapshot() {
        let registry = SourceRegistry::new();
        registry.register("b", memory_source("b")).unwrap();
        registry.register("a", memory_source("a")).unwrap();

        let listing = registry.list().await;
        assert_eq!(listing.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(!listing["a"].connected);

        registry.unregister("a").await;
        assert_eq!(listing.len(), 2);
        assert_eq!(registry.ids(), vec!["b".to_string()]);
    }

    struct Unchecked(DataSourceConfig);

    #[async_trait::async_trait]
    impl DataSource for Unchecked {
        fn config(&self) -> &DataSourceConfig {
            &self.0
        }

        async fn is_connected(&self) -> bool {
            false
        }

        async fn connect(&self) -> Result<(), crate::source::SourceError> {
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn execute(
            &self,
            _query: &str,
            _params: &protocol::Payload,
        ) -> Result<protocol::QueryResult, crate::source::SourceError> {
            Err(crate::source::SourceError::NotConnected(self.0.id().to_string()))
        }

        async fn test_connection(&self) -> bool {
            false
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let registry = SourceRegistry::new();
        let config = DataSourceConfig::new("slow", SourceKind::Custom).with_timeout(Duration::ZERO);

        let err = registry
            .register("slow", Arc::new(Unchecked(config)))
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::InvalidConfig(ConfigError::ZeroTimeout(_))
        ));
        assert!(!registry.contains("slow"));
    }
}
