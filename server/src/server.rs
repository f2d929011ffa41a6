//! Server façade: owns the registry, token store and listener lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;

use crate::broker::{Broker, SessionError, SessionManager};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::monitor::SourceHealthMonitor;
use crate::security::TokenStore;
use crate::source::{self, DataSource, RegistryError, SourceRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub running: bool,
    pub host: String,
    pub port: u16,
    pub data_sources_count: usize,
    pub connections_count: usize,
}

struct Running {
    local_addr: SocketAddr,
    accept: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

pub struct McpServer {
    config: ServerConfig,
    registry: SourceRegistry,
    tokens: TokenStore,
    sessions: SessionManager,
    health: SourceHealthMonitor,
    broker: Broker,
    shutdown: watch::Sender<bool>,
    /// Serializes `start` and `stop`; `state` is only locked briefly.
    lifecycle: Mutex<()>,
    state: Mutex<Option<Running>>,
}

impl McpServer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let registry = SourceRegistry::new();
        let tokens = TokenStore::from_config(&config.security)?;
        let sessions = SessionManager::new();
        let broker = Broker::new(&config, registry.clone(), tokens.clone(), sessions.clone());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            registry,
            tokens,
            sessions,
            health: SourceHealthMonitor::new(),
            broker,
            shutdown,
            lifecycle: Mutex::new(()),
            state: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn health(&self) -> &SourceHealthMonitor {
        &self.health
    }

    pub fn register_source(
        &self,
        id: impl Into<String>,
        source: Arc<dyn DataSource>,
    ) -> std::result::Result<(), RegistryError> {
        self.registry.register(id, source)
    }

    pub async fn replace_source(
        &self,
        id: impl Into<String>,
        source: Arc<dyn DataSource>,
    ) -> std::result::Result<Option<Arc<dyn DataSource>>, RegistryError> {
        self.registry.replace(id, source).await
    }

    pub async fn unregister_source(&self, id: &str) -> bool {
        self.health.forget(id);
        self.registry.unregister(id).await
    }

    /// Registers every `[[sources]]` entry; bad entries are logged and skipped.
    pub fn register_configured_sources(&self) -> usize {
        let mut registered = 0;
        for entry in &self.config.sources {
            let outcome = source::from_entry(entry)
                .map_err(RegistryError::from)
                .and_then(|source| self.registry.register(entry.id.clone(), source));
            match outcome {
                Ok(()) => registered += 1,
                Err(err) => log::error!("Skipping data source '{}': {}", entry.id, err),
            }
        }
        registered
    }

    pub fn issue_token<I, S>(&self, user_id: &str, permissions: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tokens.issue(user_id, permissions)
    }

    pub fn revoke_token(&self, token: &str) -> bool {
        self.tokens.revoke(token)
    }

    /// Binds the listener and spawns background tasks. Calling it again while
    /// running returns the address already bound.
    pub async fn start(&self) -> Result<SocketAddr> {
        let _lifecycle = self.lifecycle.lock().await;
        if let Some(local_addr) = self.local_addr().await {
            log::debug!("Broker already listening on {}", local_addr);
            return Ok(local_addr);
        }

        let listener =
            TcpListener::bind((self.config.broker.host.as_str(), self.config.broker.port)).await?;
        let local_addr = listener.local_addr()?;
        self.shutdown.send_replace(false);

        let accept = tokio::spawn(accept_loop(
            listener,
            self.broker.clone(),
            self.shutdown.subscribe(),
            self.config.broker.drain_timeout(),
        ));
        let background = vec![self.spawn_sweeper(), self.spawn_health_probe()];

        *self.state.lock().await = Some(Running {
            local_addr,
            accept,
            background,
        });
        log::info!("Broker listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Stops accepting, drains sessions and disconnects every source.
    ///
    /// Status reads see the server as stopped as soon as the drain begins.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(running) = self.state.lock().await.take() else {
            return;
        };

        log::info!("Stopping broker on {}...", running.local_addr);
        self.shutdown.send_replace(true);
        for task in &running.background {
            task.abort();
        }
        if let Err(err) = running.accept.await {
            log::error!("Accept loop ended abnormally: {}", err);
        }

        self.registry.disconnect_all().await;
        log::info!("Broker stopped");
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.as_ref().map(|r| r.local_addr)
    }

    pub async fn get_status(&self) -> ServerStatus {
        let state = self.state.lock().await;
        ServerStatus {
            running: state.is_some(),
            host: self.config.broker.host.clone(),
            port: state
                .as_ref()
                .map(|r| r.local_addr.port())
                .unwrap_or(self.config.broker.port),
            data_sources_count: self.registry.len(),
            connections_count: self.sessions.active_session_count(),
        }
    }

    /// Serves one session over any byte stream.
    pub async fn serve_connection<S>(
        &self,
        stream: S,
        peer: SocketAddr,
    ) -> std::result::Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.broker
            .serve(stream, peer, self.shutdown.subscribe())
            .await
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let tokens = self.tokens.clone();
        let auth_failures = self.broker.auth_failures().clone();
        let period = self.config.security.sweep_interval();

        tokio::spawn(async move {
            let mut interval = time::interval(period);
            loop {
                interval.tick().await;
                let removed = tokens.sweep_expired();
                if removed > 0 {
                    log::info!("Background cleanup: removed {} expired tokens", removed);
                }
                auth_failures.cleanup_old_entries();
            }
        })
    }

    fn spawn_health_probe(&self) -> JoinHandle<()> {
        let health = self.health.clone();
        let registry = self.registry.clone();
        let period = self.config.monitor.probe_interval();

        tokio::spawn(async move {
            let mut interval = time::interval(period);
            loop {
                interval.tick().await;
                let online = health.probe_all(&registry).await;
                log::debug!("Health probe: {}/{} sources online", online, registry.len());
            }
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    broker: Broker,
    mut shutdown: watch::Receiver<bool>,
    drain_timeout: Duration,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        log::debug!("Could not set TCP_NODELAY for {}: {}", peer, err);
                    }
                    let broker = broker.clone();
                    let session_shutdown = shutdown.clone();
                    sessions.spawn(async move {
                        broker.serve_logged(stream, peer, session_shutdown).await;
                    });
                }
                Err(err) => {
                    log::warn!("Failed to accept connection: {}", err);
                    time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }
    drop(listener);

    let pending = sessions.len();
    if pending > 0 {
        log::info!("Draining {} open sessions", pending);
    }
    let drained = time::timeout(drain_timeout, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        log::warn!(
            "{} sessions still open after {:?}; aborting them",
            sessions.len(),
            drain_timeout
        );
        sessions.shutdown().await;
    }
}
