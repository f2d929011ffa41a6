//! Framed envelope I/O over a byte stream.

use protocol::{CodecError, Envelope, EnvelopeCodec, ErrorKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::SessionError;

const READ_CHUNK: usize = 8 * 1024;

/// Accumulates bytes until whole frames are available.
///
/// `next_frame` is cancel safe: partially received frames stay buffered.
pub struct FrameReader<R> {
    reader: R,
    buffer: Vec<u8>,
    codec: EnvelopeCodec,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, codec: EnvelopeCodec) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(READ_CHUNK),
            codec,
        }
    }

    /// Next frame, `None` on a clean end of stream.
    ///
    /// A frame whose body fails to decode is returned as `Some(Err(_))`; the
    /// stream stays usable. Framing errors end the stream.
    pub async fn next_frame(
        &mut self,
    ) -> Result<Option<Result<Envelope, CodecError>>, SessionError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let split = self
                .codec
                .try_split_frame(&self.buffer)
                .map_err(SessionError::Framing)?;
            if let Some((body, used)) = split {
                let decoded = self.codec.decode(body);
                self.buffer.drain(..used);
                return Ok(Some(decoded));
            }

            let read = self.reader.read(&mut chunk).await?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(SessionError::TruncatedFrame);
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }
}

/// Writes one envelope as a frame.
///
/// An envelope too large for a frame is replaced by an `Internal` error that
/// keeps its request id.
pub async fn write_envelope<W>(
    writer: &mut W,
    codec: &EnvelopeCodec,
    envelope: &Envelope,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    let frame = match codec.encode_frame(envelope) {
        Ok(frame) => frame,
        Err(err) => {
            log::error!("Failed to encode {} envelope: {}", envelope.kind(), err);
            let mut fallback = Envelope::error(ErrorKind::Internal, "response could not be encoded");
            if let Some(request_id) = envelope.request_id() {
                fallback = fallback.with_request_id(request_id);
            }
            codec
                .encode_frame(&fallback)
                .map_err(SessionError::Framing)?
        }
    };

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
