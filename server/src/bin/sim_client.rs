use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use protocol::{handshake, query_for, Envelope, EnvelopeCodec, MessageKind, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Debug, Clone)]
struct SimConfig {
    admin_base: String,
    broker_addr: SocketAddr,
    admin_key: Option<String>,
    token: Option<String>,
    user: String,
    source: String,
    query: String,
    count: usize,
    timeout_ms: u64,
    skip_http: bool,
}

#[derive(Debug, Serialize)]
struct IssueTokenRequest<'a> {
    user_id: &'a str,
    permissions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct IssueTokenResponse {
    token: String,
    user_id: String,
    expires_in: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut cfg = parse_args()?;

    println!("[sim-client] starting simulation");
    println!("[sim-client] admin base: {}", cfg.admin_base);
    println!("[sim-client] broker addr: {}", cfg.broker_addr);

    if !cfg.skip_http && cfg.token.is_none() {
        cfg.token = Some(request_token(&cfg).await?);
    }

    run_broker_session(&cfg).await?;

    println!("[sim-client] simulation finished successfully");
    Ok(())
}

async fn request_token(cfg: &SimConfig) -> anyhow::Result<String> {
    let admin_key = cfg
        .admin_key
        .as_deref()
        .ok_or_else(|| anyhow!("--admin-key is required unless --skip-http or --token is set"))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(cfg.timeout_ms))
        .build()
        .context("failed to build HTTP client")?;

    let url = format!("{}/tokens", cfg.admin_base.trim_end_matches('/'));
    let response = client
        .post(&url)
        .bearer_auth(admin_key)
        .json(&IssueTokenRequest {
            user_id: &cfg.user,
            permissions: vec![format!("query:{}", cfg.source)],
        })
        .send()
        .await
        .with_context(|| format!("POST {} failed", url))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("token request returned {}: {}", status, body);
    }

    let issued: IssueTokenResponse = response
        .json()
        .await
        .context("invalid token response")?;
    println!(
        "[sim-client] token issued for {} (expires in {}s)",
        issued.user_id, issued.expires_in
    );
    Ok(issued.token)
}

async fn run_broker_session(cfg: &SimConfig) -> anyhow::Result<()> {
    let codec = EnvelopeCodec::default();
    let timeout = Duration::from_millis(cfg.timeout_ms);

    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(cfg.broker_addr))
        .await
        .map_err(|_| anyhow!("timed out connecting to {}", cfg.broker_addr))?
        .with_context(|| format!("failed to connect to {}", cfg.broker_addr))?;
    println!("[sim-client] connected to broker");

    let mut hello = handshake(PROTOCOL_VERSION);
    if let Some(token) = &cfg.token {
        hello = hello.with_token(token.clone());
    }
    send(&mut stream, &codec, &hello).await?;

    let mut buffer = Vec::new();
    let ack = receive(&mut stream, &codec, &mut buffer, timeout).await?;
    if ack.kind() != MessageKind::Handshake {
        bail!("handshake rejected: {}", describe(&ack));
    }
    let ack = ack.handshake_payload().context("invalid handshake reply")?;
    println!(
        "[sim-client] handshake OK: session_id={} capabilities={:?}",
        ack.session_id.as_deref().unwrap_or("-"),
        ack.capabilities
    );

    for n in 0..cfg.count {
        let request = query_for(cfg.source.clone(), cfg.query.clone(), None)
            .with_request_id(format!("req-{}", n + 1));
        send(&mut stream, &codec, &request).await?;
    }
    println!("[sim-client] pipelined {} queries", cfg.count);

    for n in 0..cfg.count {
        let expected = format!("req-{}", n + 1);
        let reply = receive(&mut stream, &codec, &mut buffer, timeout).await?;
        if reply.request_id() != Some(expected.as_str()) {
            bail!(
                "response out of order: expected {}, got {:?}",
                expected,
                reply.request_id()
            );
        }
        println!("[sim-client] {} -> {}", expected, describe(&reply));
    }

    stream.shutdown().await.ok();
    Ok(())
}

async fn send(stream: &mut TcpStream, codec: &EnvelopeCodec, envelope: &Envelope) -> anyhow::Result<()> {
    let frame = codec.encode_frame(envelope).context("failed to encode frame")?;
    stream
        .write_all(&frame)
        .await
        .context("failed to write frame")?;
    Ok(())
}

async fn receive(
    stream: &mut TcpStream,
    codec: &EnvelopeCodec,
    buffer: &mut Vec<u8>,
    timeout: Duration,
) -> anyhow::Result<Envelope> {
    loop {
        if let Some((envelope, consumed)) = codec.try_decode_frame(buffer)? {
            buffer.drain(..consumed);
            return Ok(envelope);
        }

        let mut chunk = [0u8; 4096];
        let read = tokio::time::timeout(timeout, stream.read(&mut chunk))
            .await
            .map_err(|_| anyhow!("timed out waiting for broker"))?
            .context("failed to read from broker")?;
        if read == 0 {
            bail!("broker closed the connection");
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
}

fn describe(envelope: &Envelope) -> String {
    match envelope.kind() {
        MessageKind::Result => match envelope.query_result() {
            Ok(result) => format!(
                "{} rows in {:.2}ms",
                result.data().len(),
                result.query_time_ms().unwrap_or_default()
            ),
            Err(err) => format!("unreadable result: {}", err),
        },
        MessageKind::Error => match envelope.error_payload() {
            Ok(error) => format!("error {}: {}", error.kind, error.message),
            Err(err) => format!("unreadable error: {}", err),
        },
        other => format!("unexpected {} envelope", other),
    }
}

fn parse_args() -> anyhow::Result<SimConfig> {
    let mut cfg = SimConfig {
        admin_base: "http://127.0.0.1:8081".to_string(),
        broker_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
        admin_key: std::env::var("ADMIN_KEY").ok(),
        token: None,
        user: "sim-client".to_string(),
        source: "users".to_string(),
        query: "SELECT * FROM users".to_string(),
        count: 3,
        timeout_ms: 5_000,
        skip_http: false,
    };

    let mut args = std::env::args().skip(1).peekable();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--admin-base" => cfg.admin_base = next_arg_value(&mut args, &arg)?,
            "--broker-addr" => {
                let value = next_arg_value(&mut args, &arg)?;
                cfg.broker_addr = SocketAddr::from_str(&value)
                    .with_context(|| format!("invalid --broker-addr: {}", value))?;
            }
            "--admin-key" => cfg.admin_key = Some(next_arg_value(&mut args, &arg)?),
            "--token" => cfg.token = Some(next_arg_value(&mut args, &arg)?),
            "--user" => cfg.user = next_arg_value(&mut args, &arg)?,
            "--source" => cfg.source = next_arg_value(&mut args, &arg)?,
            "--query" => cfg.query = next_arg_value(&mut args, &arg)?,
            "--count" => {
                let value = next_arg_value(&mut args, &arg)?;
                cfg.count = value
                    .parse::<usize>()
                    .with_context(|| format!("invalid --count: {}", value))?;
            }
            "--timeout-ms" => {
                let value = next_arg_value(&mut args, &arg)?;
                cfg.timeout_ms = value
                    .parse::<u64>()
                    .with_context(|| format!("invalid --timeout-ms: {}", value))?;
            }
            "--skip-http" => cfg.skip_http = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                bail!("unknown argument: {}\nUse --help to list the options.", other);
            }
        }
    }

    if cfg.count == 0 {
        bail!("--count must be at least 1");
    }

    Ok(cfg)
}

fn next_arg_value<I>(args: &mut std::iter::Peekable<I>, flag: &str) -> anyhow::Result<String>
where
    I: Iterator<Item = String>,
{
    args.next()
        .ok_or_else(|| anyhow!("missing value for {}", flag))
}

fn print_help() {
    println!(
        "sim-client - drives the admin API and a broker session end to end\n\n\
Usage:\n\
  cargo run -p mcp-server --bin sim-client -- [options]\n\n\
Options:\n\
  --admin-base <url>        Admin HTTP base (default: http://127.0.0.1:8081)\n\
  --admin-key <key>         Admin key for POST /tokens (default: $ADMIN_KEY)\n\
  --token <token>           Use this session token instead of requesting one\n\
  --user <id>               user_id for the issued token (default: sim-client)\n\
  --broker-addr <ip:port>   Broker address (default: 127.0.0.1:8000)\n\
  --source <id>             Data source to query (default: users)\n\
  --query <text>            Query text (default: SELECT * FROM users)\n\
  --count <n>               Number of pipelined queries (default: 3)\n\
  --skip-http               Do not call the admin API\n\
  --timeout-ms <ms>         Network timeout (default: 5000)\n\
  --help                    Show this help\n"
    );
}
