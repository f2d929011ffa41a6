//! Envelope model exchanged between agents and the broker.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::CodecError;
use crate::result::QueryResult;

/// Protocol version advertised in every handshake.
pub const PROTOCOL_VERSION: &str = "1.0";

/// JSON object carried by an envelope.
pub type Payload = Map<String, Value>;

/// One row returned by a data source.
pub type Row = Map<String, Value>;

/// Message kinds recognised on the wire.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Handshake,
    Query,
    Result,
    Error,
}

impl MessageKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            MessageKind::Handshake => "handshake",
            MessageKind::Query => "query",
            MessageKind::Result => "result",
            MessageKind::Error => "error",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = CodecError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "handshake" => Ok(MessageKind::Handshake),
            "query" => Ok(MessageKind::Query),
            "result" => Ok(MessageKind::Result),
            "error" => Ok(MessageKind::Error),
            other => Err(CodecError::UnknownMessageKind(other.to_string())),
        }
    }
}

/// Error taxonomy reported to clients inside error envelopes.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectError,
    NotConnected,
    Timeout,
    RetriesExhausted,
    MalformedEnvelope,
    UnknownMessageKind,
    AuthRequired,
    InvalidToken,
    TokenExpired,
    UnknownDataSource,
    HandshakeRequired,
    VersionMismatch,
    PermissionDenied,
    RateLimited,
    UnexpectedMessage,
    QueryFailed,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConnectError => "ConnectError",
            ErrorKind::NotConnected => "NotConnected",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::RetriesExhausted => "RetriesExhausted",
            ErrorKind::MalformedEnvelope => "MalformedEnvelope",
            ErrorKind::UnknownMessageKind => "UnknownMessageKind",
            ErrorKind::AuthRequired => "AuthRequired",
            ErrorKind::InvalidToken => "InvalidToken",
            ErrorKind::TokenExpired => "TokenExpired",
            ErrorKind::UnknownDataSource => "UnknownDataSource",
            ErrorKind::HandshakeRequired => "HandshakeRequired",
            ErrorKind::VersionMismatch => "VersionMismatch",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::UnexpectedMessage => "UnexpectedMessage",
            ErrorKind::QueryFailed => "QueryFailed",
            ErrorKind::Internal => "Internal",
        }
    }

    /// Rejections that end the session instead of a single request.
    #[must_use]
    pub const fn is_session_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::AuthRequired
                | ErrorKind::InvalidToken
                | ErrorKind::TokenExpired
                | ErrorKind::HandshakeRequired
                | ErrorKind::VersionMismatch
                | ErrorKind::RateLimited
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed wrapper exchanged over the protocol.
///
/// Equality compares kind, payload and timestamp, so an envelope survives
/// `decode(encode(e)) == e`.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Envelope {
    pub message_type: MessageKind,
    pub payload: Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Envelope {
    #[must_use]
    pub fn new(message_type: MessageKind, payload: Payload) -> Self {
        Self {
            message_type,
            payload,
            timestamp: None,
        }
    }

    /// Result envelope for a completed query.
    #[must_use]
    pub fn result(result: &QueryResult) -> Self {
        let payload = match serde_json::to_value(result) {
            Ok(Value::Object(map)) => map,
            _ => Payload::new(),
        };
        Self::new(MessageKind::Result, payload)
    }

    /// Error envelope with a taxonomy kind and a human readable message.
    #[must_use]
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        let mut payload = Payload::new();
        payload.insert("kind".into(), Value::String(kind.as_str().to_string()));
        payload.insert("message".into(), Value::String(message.into()));
        Self::new(MessageKind::Error, payload)
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.message_type
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_request_id(self, request_id: impl Into<String>) -> Self {
        self.with_field("request_id", request_id.into())
    }

    #[must_use]
    pub fn with_source(self, source: impl Into<String>) -> Self {
        self.with_field("source", source.into())
    }

    #[must_use]
    pub fn with_token(self, token: impl Into<String>) -> Self {
        self.with_field("token", token.into())
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Request id echoed back on responses, when the client supplied one.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.payload.get("request_id").and_then(Value::as_str)
    }

    pub fn handshake_payload(&self) -> Result<HandshakePayload, CodecError> {
        self.typed_payload(MessageKind::Handshake)
    }

    pub fn query_payload(&self) -> Result<QueryPayload, CodecError> {
        self.typed_payload(MessageKind::Query)
    }

    pub fn error_payload(&self) -> Result<ErrorPayload, CodecError> {
        self.typed_payload(MessageKind::Error)
    }

    pub fn query_result(&self) -> Result<QueryResult, CodecError> {
        self.typed_payload(MessageKind::Result)
    }

    fn typed_payload<T>(&self, expected: MessageKind) -> Result<T, CodecError>
    where
        T: for<'de> Deserialize<'de>,
    {
        if self.message_type != expected {
            return Err(CodecError::UnexpectedKind {
                expected,
                actual: self.message_type,
            });
        }

        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|err| {
            CodecError::InvalidPayload {
                kind: expected,
                reason: err.to_string(),
            }
        })
    }
}

/// Builds a handshake envelope advertising `version` and no capabilities.
#[must_use]
pub fn handshake(version: impl Into<String>) -> Envelope {
    let mut payload = Payload::new();
    payload.insert("version".into(), Value::String(version.into()));
    payload.insert("capabilities".into(), Value::Array(Vec::new()));
    Envelope::new(MessageKind::Handshake, payload)
}

/// Builds a query envelope; absent parameters become an empty object.
#[must_use]
pub fn query_envelope(query: impl Into<String>, parameters: Option<Payload>) -> Envelope {
    let mut payload = Payload::new();
    payload.insert("query".into(), Value::String(query.into()));
    payload.insert(
        "parameters".into(),
        Value::Object(parameters.unwrap_or_default()),
    );
    Envelope::new(MessageKind::Query, payload)
}

/// Query envelope addressed to a named data source.
#[must_use]
pub fn query_for(
    source: impl Into<String>,
    query: impl Into<String>,
    parameters: Option<Payload>,
) -> Envelope {
    query_envelope(query, parameters).with_source(source)
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakePayload {
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QueryPayload {
    pub query: String,
    #[serde(default)]
    pub parameters: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<ErrorKind>,
}
