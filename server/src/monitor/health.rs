use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::source::SourceRegistry;

/// Upper bound on a single probe; sources answer `test_connection` quickly.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub online: bool,
    pub last_checked: DateTime<Utc>,
    pub consecutive_failures: u32,
}

impl SourceHealth {
    fn new(online: bool) -> Self {
        Self {
            online,
            last_checked: Utc::now(),
            consecutive_failures: if online { 0 } else { 1 },
        }
    }

    fn update(&mut self, online: bool) {
        self.online = online;
        self.last_checked = Utc::now();
        if online {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
    }
}

/// Last known reachability of each registered source.
#[derive(Clone, Default)]
pub struct SourceHealthMonitor {
    probes: Arc<DashMap<String, SourceHealth>>,
}

impl SourceHealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_probe(&self, source_id: &str, online: bool) {
        if let Some(mut health) = self.probes.get_mut(source_id) {
            let was_online = health.online;
            health.update(online);
            if was_online != online {
                log::info!(
                    "Data source '{}' is now {}",
                    source_id,
                    if online { "online" } else { "offline" }
                );
            } else {
                log::debug!("Probe of '{}': online={}", source_id, online);
            }
        } else {
            self.probes
                .insert(source_id.to_string(), SourceHealth::new(online));
            log::info!("First probe of data source '{}': online={}", source_id, online);
        }
    }

    /// Probes every registered source and forgets ids no longer registered.
    /// Returns the number of sources that answered.
    pub async fn probe_all(&self, registry: &SourceRegistry) -> usize {
        let entries = registry.entries();
        let mut online = 0;

        for (id, source) in &entries {
            let reachable = tokio::time::timeout(PROBE_TIMEOUT, source.test_connection())
                .await
                .unwrap_or(false);
            if reachable {
                online += 1;
            }
            self.record_probe(id, reachable);
        }

        self.probes
            .retain(|id, _| entries.iter().any(|(registered, _)| registered == id));
        online
    }

    pub fn is_online(&self, source_id: &str) -> bool {
        self.probes
            .get(source_id)
            .map(|h| h.online)
            .unwrap_or(false)
    }

    pub fn status(&self, source_id: &str) -> Option<SourceHealth> {
        self.probes.get(source_id).map(|h| h.value().clone())
    }

    pub fn online_count(&self) -> usize {
        self.probes.iter().filter(|entry| entry.online).count()
    }

    pub fn snapshot(&self) -> BTreeMap<String, SourceHealth> {
        self.probes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn forget(&self, source_id: &str) -> bool {
        self.probes.remove(source_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_probe() {
        let monitor = SourceHealthMonitor::new();
        monitor.record_probe("db", true);

        assert!(monitor.is_online("db"));
        assert_eq!(monitor.status("db").map(|h| h.consecutive_failures), Some(0));
    }

    #[test]
    fn test_failures_accumulate_until_recovery() {
        let monitor = SourceHealthMonitor::new();
        monitor.record_probe("db", false);
        monitor.record_probe("db", false);
        assert_eq!(monitor.status("db").map(|h| h.consecutive_failures), Some(2));

        monitor.record_probe("db", true);
        let health = monitor.status("db").unwrap();
        assert!(health.online);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[test]
    fn test_unknown_source_is_offline() {
        let monitor = SourceHealthMonitor::new();
        assert!(!monitor.is_online("missing"));
        assert!(monitor.status("missing").is_none());
    }

    #[test]
    fn test_online_count() {
        let monitor = SourceHealthMonitor::new();
        monitor.record_probe("a", true);
        monitor.record_probe("b", false);
        monitor.record_probe("c", true);

        assert_eq!(monitor.online_count(), 2);
        assert!(monitor.forget("c"));
        assert_eq!(monitor.online_count(), 1);
    }
}
