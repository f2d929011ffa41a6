mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{stub_source, test_config, StubConnector};
use mcp_server::McpServer;
use protocol::{handshake, query_for, EnvelopeCodec, MessageKind, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn read_envelope(stream: &mut TcpStream, buffer: &mut Vec<u8>) -> protocol::Envelope {
    let codec = EnvelopeCodec::default();
    loop {
        if let Some((envelope, used)) = codec.try_decode_frame(buffer).unwrap() {
            buffer.drain(..used);
            return envelope;
        }
        let mut chunk = [0u8; 4096];
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .expect("timed out waiting for the broker")
            .unwrap();
        assert!(read > 0, "broker closed the connection");
        buffer.extend_from_slice(&chunk[..read]);
    }
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let server = McpServer::new(test_config(false)).unwrap();

    let status = server.get_status().await;
    assert!(!status.running);

    let addr = server.start().await.unwrap();
    assert_ne!(addr.port(), 0);
    assert_eq!(server.start().await.unwrap(), addr);

    let status = server.get_status().await;
    assert!(status.running);
    assert_eq!(status.port, addr.port());

    server.stop().await;
    server.stop().await;
    assert!(!server.get_status().await.running);
    assert!(server.local_addr().await.is_none());
}

#[tokio::test]
async fn test_tcp_session_and_status_counts() {
    let server = Arc::new(McpServer::new(test_config(false)).unwrap());
    let source = stub_source("db", StubConnector::new(), Duration::from_secs(2), 0);
    server.register_source("db", Arc::clone(&source)).unwrap();
    let addr = server.start().await.unwrap();

    let codec = EnvelopeCodec::default();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buffer = Vec::new();

    stream
        .write_all(&codec.encode_frame(&handshake(PROTOCOL_VERSION)).unwrap())
        .await
        .unwrap();
    assert_eq!(
        read_envelope(&mut stream, &mut buffer).await.kind(),
        MessageKind::Handshake
    );

    stream
        .write_all(&codec.encode_frame(&query_for("db", "SELECT 1", None)).unwrap())
        .await
        .unwrap();
    assert_eq!(
        read_envelope(&mut stream, &mut buffer).await.kind(),
        MessageKind::Result
    );

    let status = server.get_status().await;
    assert_eq!(status.data_sources_count, 1);
    assert_eq!(status.connections_count, 1);

    server.stop().await;

    let mut chunk = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut chunk))
        .await
        .expect("session should close on stop")
        .unwrap_or(0);
    assert_eq!(read, 0);
    assert_eq!(server.sessions().active_session_count(), 0);
    assert!(!source.is_connected().await);
}

#[tokio::test]
async fn test_stop_drains_in_flight_queries() {
    let server = Arc::new(McpServer::new(test_config(false)).unwrap());
    server
        .register_source(
            "db",
            stub_source("db", StubConnector::new(), Duration::from_secs(2), 0),
        )
        .unwrap();
    let addr = server.start().await.unwrap();

    let codec = EnvelopeCodec::default();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buffer = Vec::new();
    stream
        .write_all(&codec.encode_frame(&handshake(PROTOCOL_VERSION)).unwrap())
        .await
        .unwrap();
    read_envelope(&mut stream, &mut buffer).await;

    stream
        .write_all(
            &codec
                .encode_frame(&query_for("db", "sleep:100", None).with_request_id("slow"))
                .unwrap(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stopping = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.stop().await })
    };

    let reply = read_envelope(&mut stream, &mut buffer).await;
    assert_eq!(reply.kind(), MessageKind::Result);
    assert_eq!(reply.request_id(), Some("slow"));

    stopping.await.unwrap();
}

#[tokio::test]
async fn test_status_answers_while_stop_drains() {
    let mut config = test_config(false);
    config.broker.drain_timeout_ms = 5_000;
    let server = Arc::new(McpServer::new(config).unwrap());
    server
        .register_source(
            "db",
            stub_source("db", StubConnector::new(), Duration::from_secs(5), 0),
        )
        .unwrap();
    let addr = server.start().await.unwrap();

    let codec = EnvelopeCodec::default();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buffer = Vec::new();
    stream
        .write_all(&codec.encode_frame(&handshake(PROTOCOL_VERSION)).unwrap())
        .await
        .unwrap();
    read_envelope(&mut stream, &mut buffer).await;

    stream
        .write_all(
            &codec
                .encode_frame(&query_for("db", "sleep:1500", None).with_request_id("slow"))
                .unwrap(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stopping = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = tokio::time::timeout(Duration::from_millis(300), server.get_status())
        .await
        .expect("status should not wait for the drain");
    assert!(!status.running);
    assert!(tokio::time::timeout(Duration::from_millis(300), server.local_addr())
        .await
        .expect("local_addr should not wait for the drain")
        .is_none());
    assert!(!stopping.is_finished());

    let reply = read_envelope(&mut stream, &mut buffer).await;
    assert_eq!(reply.request_id(), Some("slow"));
    stopping.await.unwrap();
}

#[tokio::test]
async fn test_restart_after_stop() {
    let server = McpServer::new(test_config(false)).unwrap();

    server.start().await.unwrap();
    server.stop().await;

    let addr = server.start().await.unwrap();
    assert!(server.get_status().await.running);
    assert!(TcpStream::connect(addr).await.is_ok());
    server.stop().await;
}

#[tokio::test]
async fn test_configured_sources_are_registered() {
    let mut config = test_config(false);
    config.sources = toml::from_str::<mcp_server::config::ServerConfig>(
        r#"
[[sources]]
id = "users"
kind = "database"
connection_string = "memory://users"

[[sources]]
id = "broken"
kind = "api"

[[sources]]
id = "pg"
backend = "postgres"
"#,
    )
    .unwrap()
    .sources;

    let server = McpServer::new(config).unwrap();
    assert_eq!(server.register_configured_sources(), 1);
    assert!(server.registry().contains("users"));
    assert!(!server.registry().contains("broken"));

    assert!(server.unregister_source("users").await);
    assert!(!server.unregister_source("users").await);
}
