#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcp_server::broker::SessionError;
use mcp_server::config::ServerConfig;
use mcp_server::source::{
    Connector, DataSource, DataSourceConfig, ManagedSource, SourceError, SourceKind,
};
use mcp_server::McpServer;
use protocol::{handshake, Envelope, EnvelopeCodec, Payload, Row, PROTOCOL_VERSION};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Backend double that counts opens and queries.
///
/// A query of the form `sleep:<ms>` waits that long before answering; every
/// answer is a single row echoing the query text.
#[derive(Clone, Default)]
pub struct StubConnector {
    opens: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
    refuse_connect: bool,
    hang: bool,
}

impl StubConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing() -> Self {
        Self {
            refuse_connect: true,
            ..Self::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for StubConnector {
    type Handle = ();

    async fn open(&self, config: &DataSourceConfig) -> Result<(), SourceError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connect {
            return Err(SourceError::Connect {
                source_id: config.id().to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn execute(&self, _handle: &(), query: &str, _params: &Payload) -> Result<Vec<Row>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(ms) = query.strip_prefix("sleep:").and_then(|v| v.parse::<u64>().ok()) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        let mut row = Row::new();
        row.insert("query".into(), json!(query));
        Ok(vec![row])
    }

    async fn ping(&self, _handle: &()) -> bool {
        true
    }
}

pub fn stub_source(
    id: &str,
    connector: StubConnector,
    timeout: Duration,
    max_retries: u32,
) -> Arc<dyn DataSource> {
    let config = DataSourceConfig::new(id, SourceKind::Custom)
        .with_timeout(timeout)
        .with_max_retries(max_retries);
    Arc::new(ManagedSource::new(config, connector).expect("valid stub config"))
}

pub fn test_config(enable_auth: bool) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.broker.host = "127.0.0.1".to_string();
    config.broker.port = 0;
    config.broker.handshake_timeout_ms = 500;
    config.broker.drain_timeout_ms = 500;
    config.security.enable_auth = enable_auth;
    config
}

pub fn peer() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 40_000))
}

/// Frame with an arbitrary body, bypassing the envelope encoder.
pub fn raw_frame(body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(6 + body.len());
    frame.extend_from_slice(b"MC");
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(body);
    frame
}

pub struct TestClient {
    stream: DuplexStream,
    codec: EnvelopeCodec,
    buffer: Vec<u8>,
}

impl TestClient {
    pub async fn send(&mut self, envelope: &Envelope) {
        let frame = self.codec.encode_frame(envelope).unwrap();
        self.send_raw(&frame).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    pub async fn recv(&mut self) -> Envelope {
        self.try_recv().await.expect("broker closed the session")
    }

    /// Next envelope, `None` once the broker has closed the stream.
    pub async fn try_recv(&mut self) -> Option<Envelope> {
        loop {
            if let Some((envelope, used)) = self.codec.try_decode_frame(&self.buffer).unwrap() {
                self.buffer.drain(..used);
                return Some(envelope);
            }

            let mut chunk = [0u8; 4096];
            let read = tokio::time::timeout(RECV_TIMEOUT, self.stream.read(&mut chunk))
                .await
                .expect("timed out waiting for the broker")
                .unwrap();
            if read == 0 {
                assert!(self.buffer.is_empty(), "stream ended mid-frame");
                return None;
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    pub async fn handshake(&mut self, token: Option<&str>) -> Envelope {
        let mut hello = handshake(PROTOCOL_VERSION);
        if let Some(token) = token {
            hello = hello.with_token(token);
        }
        self.send(&hello).await;
        self.recv().await
    }

    pub async fn close(mut self) {
        self.stream.shutdown().await.unwrap();
        while self.try_recv().await.is_some() {}
    }
}

/// Opens an in-memory session against `server`.
pub fn connect(server: &Arc<McpServer>) -> (TestClient, JoinHandle<Result<(), SessionError>>) {
    let (client, broker_side) = tokio::io::duplex(64 * 1024);
    let server = Arc::clone(server);
    let session = tokio::spawn(async move { server.serve_connection(broker_side, peer()).await });

    let client = TestClient {
        stream: client,
        codec: EnvelopeCodec::default(),
        buffer: Vec::new(),
    };
    (client, session)
}
