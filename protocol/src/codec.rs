//! JSON codec and stream framing for protocol envelopes.

use serde_json::Value;

use crate::message::{Envelope, ErrorKind, MessageKind};

const FRAME_MAGIC: [u8; 2] = *b"MC";
const FRAME_MAGIC_LEN: usize = 2;
const FRAME_LENGTH_LEN: usize = 4;

/// Number of bytes in the stream frame header.
pub const FRAME_HEADER_LEN: usize = FRAME_MAGIC_LEN + FRAME_LENGTH_LEN;

/// Largest body the u32 length prefix can describe.
pub const MAX_FRAME_BODY: usize = u32::MAX as usize;

/// Limits used by the codec to protect against oversized frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecLimits {
    pub max_frame_payload_size: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_frame_payload_size: 1024 * 1024,
        }
    }
}

/// Errors produced while encoding/decoding envelopes.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("unknown message kind '{0}'")]
    UnknownMessageKind(String),

    #[error("expected {expected} envelope, got {actual}")]
    UnexpectedKind {
        expected: MessageKind,
        actual: MessageKind,
    },

    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: MessageKind, reason: String },

    #[error("invalid frame magic: expected [4D,43], got {actual:02X?}")]
    InvalidFrameMagic { actual: [u8; 2] },

    #[error("frame payload exceeds limit: limit={limit} actual={actual}")]
    FrameTooLarge { limit: usize, actual: usize },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CodecError {
    /// Framing errors leave the byte stream unsynchronised.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CodecError::InvalidFrameMagic { .. } | CodecError::FrameTooLarge { .. }
        )
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            CodecError::UnknownMessageKind(_) => ErrorKind::UnknownMessageKind,
            CodecError::UnexpectedKind { .. } => ErrorKind::UnexpectedMessage,
            CodecError::Serialization(_) => ErrorKind::Internal,
            _ => ErrorKind::MalformedEnvelope,
        }
    }
}

/// Codec that serializes envelopes as JSON inside length-prefixed frames.
#[derive(Clone, Debug, Default)]
pub struct EnvelopeCodec {
    limits: CodecLimits,
}

impl EnvelopeCodec {
    #[must_use]
    pub const fn new(limits: CodecLimits) -> Self {
        Self { limits }
    }

    #[must_use]
    pub const fn limits(&self) -> CodecLimits {
        self.limits
    }

    /// Serializes an envelope to JSON bytes.
    ///
    /// Object keys are emitted in sorted order, so equal envelopes always
    /// produce identical buffers. The buffer owns its bytes.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(envelope)?)
    }

    /// Parses JSON bytes into an envelope.
    pub fn decode(&self, bytes: &[u8]) -> Result<Envelope, CodecError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|err| CodecError::MalformedEnvelope(err.to_string()))?;

        let Value::Object(mut object) = value else {
            return Err(CodecError::MalformedEnvelope(
                "envelope must be a JSON object".to_string(),
            ));
        };

        let message_type = match object.remove("message_type") {
            Some(Value::String(raw)) => raw.parse::<MessageKind>()?,
            Some(_) => {
                return Err(CodecError::MalformedEnvelope(
                    "message_type must be a string".to_string(),
                ));
            }
            None => {
                return Err(CodecError::MalformedEnvelope(
                    "missing message_type".to_string(),
                ));
            }
        };

        let payload = match object.remove("payload") {
            Some(Value::Object(payload)) => payload,
            Some(_) => {
                return Err(CodecError::MalformedEnvelope(
                    "payload must be an object".to_string(),
                ));
            }
            None => {
                return Err(CodecError::MalformedEnvelope(
                    "missing payload".to_string(),
                ));
            }
        };

        let timestamp = match object.remove("timestamp") {
            None | Some(Value::Null) => None,
            Some(Value::String(ts)) => Some(ts),
            Some(_) => {
                return Err(CodecError::MalformedEnvelope(
                    "timestamp must be a string".to_string(),
                ));
            }
        };

        Ok(Envelope {
            message_type,
            payload,
            timestamp,
        })
    }

    /// Encodes a stream frame.
    ///
    /// Frame format:
    /// - bytes 0..2: magic `MC`
    /// - bytes 2..6: body length (LE u32)
    /// - remaining bytes: JSON body
    pub fn encode_frame(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        let body = self.encode(envelope)?;
        if body.len() > self.limits.max_frame_payload_size {
            return Err(CodecError::FrameTooLarge {
                limit: self.limits.max_frame_payload_size,
                actual: body.len(),
            });
        }

        let body_len = u32::try_from(body.len()).map_err(|_| CodecError::FrameTooLarge {
            limit: MAX_FRAME_BODY,
            actual: body.len(),
        })?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.extend_from_slice(&FRAME_MAGIC);
        frame.extend_from_slice(&body_len.to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Splits one frame body off the beginning of `buffer`.
    ///
    /// Returns `Ok(None)` when there are not enough bytes yet, otherwise the
    /// body and the total number of bytes the frame occupies.
    pub fn try_split_frame<'a>(
        &self,
        buffer: &'a [u8],
    ) -> Result<Option<(&'a [u8], usize)>, CodecError> {
        if buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let actual_magic = [buffer[0], buffer[1]];
        if actual_magic != FRAME_MAGIC {
            return Err(CodecError::InvalidFrameMagic {
                actual: actual_magic,
            });
        }

        let body_len = u32::from_le_bytes([buffer[2], buffer[3], buffer[4], buffer[5]]) as usize;
        if body_len > self.limits.max_frame_payload_size {
            return Err(CodecError::FrameTooLarge {
                limit: self.limits.max_frame_payload_size,
                actual: body_len,
            });
        }

        let total_len = FRAME_HEADER_LEN + body_len;
        if buffer.len() < total_len {
            return Ok(None);
        }

        Ok(Some((&buffer[FRAME_HEADER_LEN..total_len], total_len)))
    }

    /// Attempts to decode a single envelope from the beginning of `buffer`.
    pub fn try_decode_frame(
        &self,
        buffer: &[u8],
    ) -> Result<Option<(Envelope, usize)>, CodecError> {
        match self.try_split_frame(buffer)? {
            Some((body, used)) => Ok(Some((self.decode(body)?, used))),
            None => Ok(None),
        }
    }
}
