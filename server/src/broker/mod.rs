//! Session broker: handshake, authentication and ordered query multiplexing.

pub mod dispatch;
pub mod frames;
pub mod session;

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use futures_util::future::{self, BoxFuture, FutureExt};
use futures_util::stream::{FuturesOrdered, StreamExt};
use protocol::{
    handshake, CodecError, Envelope, EnvelopeCodec, ErrorKind, MessageKind, PROTOCOL_VERSION,
};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

pub use dispatch::{dispatch, DispatchError};
pub use frames::{write_envelope, FrameReader};
pub use session::{SessionGuard, SessionInfo, SessionManager};

use crate::config::ServerConfig;
use crate::middleware::RateLimiter;
use crate::security::{TokenError, TokenStore};
use crate::source::SourceRegistry;

/// Capabilities advertised in the handshake reply.
pub const CAPABILITIES: [&str; 2] = ["query", "multiplex"];

/// Reasons a session ends early. Each one affects only its own session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(CodecError),

    #[error("connection closed in the middle of a frame")]
    TruncatedFrame,

    #[error("session rejected ({kind}): {message}")]
    Rejected { kind: ErrorKind, message: String },

    #[error("session idle for {0:?}")]
    Idle(Duration),
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub handshake_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_in_flight: usize,
    pub default_source: Option<String>,
    pub enable_auth: bool,
    pub enforce_permissions: bool,
}

impl BrokerSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            handshake_timeout: config.broker.handshake_timeout(),
            idle_timeout: config.broker.idle_timeout(),
            max_in_flight: config.broker.max_in_flight.max(1),
            default_source: config.broker.default_source.clone(),
            enable_auth: config.security.enable_auth,
            enforce_permissions: config.security.enforce_permissions,
        }
    }
}

/// Serves sessions against a shared registry and token store.
#[derive(Clone)]
pub struct Broker {
    settings: Arc<BrokerSettings>,
    codec: EnvelopeCodec,
    registry: SourceRegistry,
    tokens: TokenStore,
    sessions: SessionManager,
    auth_failures: RateLimiter,
}

enum Admission {
    Queued(BoxFuture<'static, Envelope>),
    /// Reply, then stop reading and close once earlier replies are out.
    Closing(BoxFuture<'static, Envelope>, SessionError),
}

impl Broker {
    pub fn new(
        config: &ServerConfig,
        registry: SourceRegistry,
        tokens: TokenStore,
        sessions: SessionManager,
    ) -> Self {
        Self {
            settings: Arc::new(BrokerSettings::from_config(config)),
            codec: EnvelopeCodec::new(config.broker.codec_limits()),
            registry,
            tokens,
            sessions,
            auth_failures: RateLimiter::with_limits(
                config.security.max_attempts,
                config.security.attempt_window(),
            ),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn auth_failures(&self) -> &RateLimiter {
        &self.auth_failures
    }

    /// Runs one session to completion.
    ///
    /// Replies are written in the order requests were read. When `shutdown`
    /// flips to true the session stops reading, writes what is in flight and
    /// returns.
    pub async fn serve<S>(
        &self,
        stream: S,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut frames = FrameReader::new(reader, self.codec.clone());
        let session = self.sessions.open(peer);

        let token = self
            .handshake(&mut frames, &mut writer, &session, peer)
            .await?;
        log::info!(
            "Session {} established with {}{}",
            session.id(),
            peer,
            if token.is_some() { " (authenticated)" } else { "" }
        );

        let outcome = self
            .run(
                &mut frames,
                &mut writer,
                &session,
                token.as_deref(),
                &mut shutdown,
            )
            .await;

        if let Err(err) = writer.shutdown().await {
            log::debug!("Session {} shutdown failed: {}", session.id(), err);
        }
        outcome
    }

    /// [`serve`](Self::serve) with the outcome logged instead of returned.
    pub async fn serve_logged<S>(&self, stream: S, peer: SocketAddr, shutdown: watch::Receiver<bool>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        match self.serve(stream, peer, shutdown).await {
            Ok(()) => log::debug!("Session with {} closed", peer),
            Err(SessionError::Rejected { kind, message }) => {
                log::info!("Session with {} rejected ({}): {}", peer, kind, message)
            }
            Err(SessionError::Idle(after)) => {
                log::info!("Session with {} closed after {:?} idle", peer, after)
            }
            Err(err) => log::warn!("Session with {} terminated: {}", peer, err),
        }
    }

    async fn handshake<R, W>(
        &self,
        frames: &mut FrameReader<R>,
        writer: &mut W,
        session: &SessionGuard,
        peer: SocketAddr,
    ) -> Result<Option<String>, SessionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let first =
            match tokio::time::timeout(self.settings.handshake_timeout, frames.next_frame()).await
            {
                Ok(frame) => frame?,
                Err(_) => {
                    return self
                        .reject(writer, ErrorKind::HandshakeRequired, "no handshake received in time")
                        .await;
                }
            };

        let envelope = match first {
            None => {
                return Err(SessionError::Rejected {
                    kind: ErrorKind::HandshakeRequired,
                    message: "connection closed before handshake".to_string(),
                });
            }
            Some(Err(err)) => {
                return self
                    .reject(writer, err.kind(), &format!("invalid handshake frame: {err}"))
                    .await;
            }
            Some(Ok(envelope)) => envelope,
        };

        if envelope.kind() != MessageKind::Handshake {
            let message = format!("expected handshake, got {}", envelope.kind());
            return self
                .reject(writer, ErrorKind::HandshakeRequired, &message)
                .await;
        }

        let hello = match envelope.handshake_payload() {
            Ok(hello) => hello,
            Err(err) => {
                return self
                    .reject(writer, ErrorKind::MalformedEnvelope, &err.to_string())
                    .await;
            }
        };

        if hello.version != PROTOCOL_VERSION {
            let message = format!(
                "unsupported protocol version '{}', expected '{}'",
                hello.version, PROTOCOL_VERSION
            );
            return self
                .reject(writer, ErrorKind::VersionMismatch, &message)
                .await;
        }

        let token = if self.settings.enable_auth {
            Some(
                self.authenticate(writer, hello.token.as_deref(), session, peer)
                    .await?,
            )
        } else {
            None
        };

        let reply = handshake(PROTOCOL_VERSION)
            .with_field("capabilities", json!(CAPABILITIES))
            .with_field("session_id", session.id());
        self.send(writer, reply).await?;

        Ok(token)
    }

    async fn authenticate<W>(
        &self,
        writer: &mut W,
        token: Option<&str>,
        session: &SessionGuard,
        peer: SocketAddr,
    ) -> Result<String, SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        let ip = peer.ip();
        if self.auth_failures.is_limited(ip) {
            log::warn!("Too many failed handshakes from {}", ip);
            return self
                .reject(
                    writer,
                    ErrorKind::RateLimited,
                    "too many failed authentication attempts",
                )
                .await;
        }

        let Some(token) = token else {
            self.auth_failures.record(ip);
            return self
                .reject(writer, ErrorKind::AuthRequired, "handshake must carry a token")
                .await;
        };

        match self.tokens.check(token) {
            Ok(record) => {
                self.auth_failures.clear(ip);
                session.set_user(&record.user_id);
                Ok(token.to_string())
            }
            Err(err) => {
                self.auth_failures.record(ip);
                self.reject(writer, token_error_kind(&err), &err.to_string())
                    .await
            }
        }
    }

    async fn run<R, W>(
        &self,
        frames: &mut FrameReader<R>,
        writer: &mut W,
        session: &SessionGuard,
        token: Option<&str>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut pending: FuturesOrdered<BoxFuture<'static, Envelope>> = FuturesOrdered::new();
        let mut reading = !*shutdown.borrow_and_update();
        let mut closing = None;
        let idle = self.settings.idle_timeout;
        let mut last_activity = Instant::now();

        loop {
            if !reading && pending.is_empty() {
                break;
            }
            let accepting = reading && pending.len() < self.settings.max_in_flight;
            let idle_deadline = last_activity + idle.unwrap_or_default();

            tokio::select! {
                biased;

                changed = shutdown.changed(), if reading => {
                    if changed.is_err() || *shutdown.borrow() {
                        log::debug!(
                            "Session {} draining {} in-flight requests",
                            session.id(),
                            pending.len()
                        );
                        reading = false;
                    }
                }

                Some(response) = pending.next(), if !pending.is_empty() => {
                    session.record_request();
                    self.send(writer, response).await?;
                    last_activity = Instant::now();
                }

                frame = frames.next_frame(), if accepting => {
                    last_activity = Instant::now();
                    let frame = match frame {
                        Err(SessionError::Framing(err)) => {
                            let notice = Envelope::error(err.kind(), err.to_string());
                            if let Err(write_err) = self.send(writer, notice).await {
                                log::debug!("Could not report framing error: {}", write_err);
                            }
                            return Err(SessionError::Framing(err));
                        }
                        other => other?,
                    };
                    match frame {
                        None => {
                            log::debug!("Session {} reached end of stream", session.id());
                            reading = false;
                        }
                        Some(decoded) => match self.admit(decoded, token, session) {
                            Admission::Queued(reply) => pending.push_back(reply),
                            Admission::Closing(reply, reason) => {
                                pending.push_back(reply);
                                reading = false;
                                closing = Some(reason);
                            }
                        },
                    }
                }

                _ = tokio::time::sleep_until(idle_deadline),
                    if idle.is_some() && reading && pending.is_empty() =>
                {
                    return Err(SessionError::Idle(idle.unwrap_or_default()));
                }
            }
        }

        match closing {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// Turns one decoded frame into a queued reply.
    fn admit(
        &self,
        decoded: Result<Envelope, CodecError>,
        token: Option<&str>,
        session: &SessionGuard,
    ) -> Admission {
        let envelope = match decoded {
            Ok(envelope) => envelope,
            Err(err) => {
                log::debug!("Session {} sent an undecodable frame: {}", session.id(), err);
                return queued(Envelope::error(err.kind(), err.to_string()));
            }
        };
        let request_id = envelope.request_id().map(str::to_owned);
        let request_id = request_id.as_deref();

        if envelope.kind() != MessageKind::Query {
            let message = format!("unexpected {} envelope in an open session", envelope.kind());
            return queued(error_reply(ErrorKind::UnexpectedMessage, message, request_id));
        }

        let query = match envelope.query_payload() {
            Ok(query) => query,
            Err(err) => {
                return queued(error_reply(
                    ErrorKind::MalformedEnvelope,
                    err.to_string(),
                    request_id,
                ));
            }
        };

        let record = match token.map(|token| self.tokens.check(token)) {
            None => None,
            Some(Ok(record)) => Some(record),
            Some(Err(err)) => {
                let kind = token_error_kind(&err);
                let message = format!("session token no longer valid: {err}");
                return Admission::Closing(
                    ready(error_reply(kind, message.clone(), request_id)),
                    SessionError::Rejected { kind, message },
                );
            }
        };

        let Some(source_id) = query
            .source
            .clone()
            .or_else(|| self.settings.default_source.clone())
        else {
            return queued(error_reply(
                ErrorKind::MalformedEnvelope,
                "query does not name a data source".to_string(),
                request_id,
            ));
        };

        if self.settings.enforce_permissions {
            if let Some(record) = &record {
                if !record.can_query(&source_id) {
                    let message = format!(
                        "user '{}' may not query '{}'",
                        record.user_id, source_id
                    );
                    return queued(error_reply(ErrorKind::PermissionDenied, message, request_id));
                }
            }
        }

        let Some(source) = self.registry.get(&source_id) else {
            log::debug!(
                "Session {} queried unknown source '{}'",
                session.id(),
                source_id
            );
            let message = format!("data source '{source_id}' is not registered");
            return queued(error_reply(ErrorKind::UnknownDataSource, message, request_id));
        };

        log::debug!("Session {} dispatching to '{}'", session.id(), source_id);

        let reply_id = query.request_id.clone();
        let task = AbortOnDrop(tokio::spawn(async move {
            let reply = match dispatch(source.as_ref(), &query.query, &query.parameters).await {
                Ok(result) => Envelope::result(&result).with_source(source_id),
                Err(err) => {
                    log::warn!("Query on '{}' failed: {}", source_id, err);
                    err.to_envelope()
                }
            };
            tag(reply, query.request_id.as_deref())
        }));

        Admission::Queued(
            async move {
                match task.await {
                    Ok(reply) => reply,
                    Err(err) => {
                        log::error!("Dispatch task failed: {}", err);
                        error_reply(
                            ErrorKind::Internal,
                            "query dispatch failed".to_string(),
                            reply_id.as_deref(),
                        )
                    }
                }
            }
            .boxed(),
        )
    }

    async fn reject<W, T>(
        &self,
        writer: &mut W,
        kind: ErrorKind,
        message: &str,
    ) -> Result<T, SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        if let Err(err) = self.send(writer, Envelope::error(kind, message)).await {
            log::debug!("Could not deliver {} rejection: {}", kind, err);
        }
        Err(SessionError::Rejected {
            kind,
            message: message.to_string(),
        })
    }

    async fn send<W>(&self, writer: &mut W, envelope: Envelope) -> Result<(), SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        let envelope =
            envelope.with_timestamp(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        write_envelope(writer, &self.codec, &envelope).await
    }
}

fn token_error_kind(err: &TokenError) -> ErrorKind {
    match err {
        TokenError::Expired => ErrorKind::TokenExpired,
        _ => ErrorKind::InvalidToken,
    }
}

fn tag(envelope: Envelope, request_id: Option<&str>) -> Envelope {
    match request_id {
        Some(request_id) => envelope.with_request_id(request_id),
        None => envelope,
    }
}

fn error_reply(kind: ErrorKind, message: String, request_id: Option<&str>) -> Envelope {
    tag(Envelope::error(kind, message), request_id)
}

fn ready(envelope: Envelope) -> BoxFuture<'static, Envelope> {
    future::ready(envelope).boxed()
}

fn queued(envelope: Envelope) -> Admission {
    Admission::Queued(ready(envelope))
}

/// Join handle that aborts its task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
