//! Wire model shared by the broker and its clients.
//!
//! Envelopes are JSON objects carried inside length-prefixed stream frames.

pub mod codec;
pub mod message;
pub mod result;

pub use codec::{CodecError, CodecLimits, EnvelopeCodec, FRAME_HEADER_LEN, MAX_FRAME_BODY};
pub use message::{
    handshake, query_envelope, query_for, Envelope, ErrorKind, ErrorPayload, HandshakePayload,
    MessageKind, Payload, QueryPayload, Row, PROTOCOL_VERSION,
};
pub use result::QueryResult;

/// Returns the protocol crate version string.
pub fn protocol_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_matches_pkg() {
        assert_eq!(protocol_version(), env!("CARGO_PKG_VERSION"));
    }
}
