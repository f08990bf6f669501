//! Native-messaging framing.
//!
//! Wire format:
//! ```text
//! +--------------------------+------------------+
//! | LENGTH (4B, native order)| BODY (N bytes)   |
//! +--------------------------+------------------+
//! ```
//!
//! The browser writes the header in the host's native byte order. Reads are
//! exact-length on the raw stream; nothing here adds a buffering layer.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default ceiling for a single frame in either direction.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

pub struct FrameReader<R> {
    inner: R,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_len: usize) -> Self {
        Self { inner, max_len }
    }

    /// Read the next frame body.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a frame boundary or
    /// when the peer sends a zero-length frame.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut header = [0u8; LENGTH_PREFIX_SIZE];
        let got = read_full(&mut self.inner, &mut header).await?;
        if got == 0 {
            return Ok(None);
        }
        if got < LENGTH_PREFIX_SIZE {
            return Err(TransportError::Truncated {
                expected: LENGTH_PREFIX_SIZE,
                read: got,
            });
        }

        let len = u32::from_ne_bytes(header) as usize;
        if len == 0 {
            return Ok(None);
        }
        if len > self.max_len {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_len,
            });
        }

        let mut body = vec![0u8; len];
        let got = read_full(&mut self.inner, &mut body).await?;
        if got < len {
            return Err(TransportError::Truncated {
                expected: len,
                read: got,
            });
        }
        Ok(Some(body))
    }
}

pub struct FrameWriter<W> {
    inner: W,
    max_len: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, max_len: usize) -> Self {
        Self { inner, max_len }
    }

    /// Write header and body as one buffer so concurrent writers on the same
    /// pipe can never interleave inside a frame.
    pub async fn write_frame(&mut self, body: &[u8]) -> Result<(), TransportError> {
        if body.len() > self.max_len || body.len() > u32::MAX as usize {
            return Err(TransportError::FrameTooLarge {
                len: body.len(),
                max: self.max_len,
            });
        }
        let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
        buf.extend_from_slice(&(body.len() as u32).to_ne_bytes());
        buf.extend_from_slice(body);
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Like `read_exact`, but reports how many bytes arrived before EOF instead
/// of discarding that count.
async fn read_full<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<usize, TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u32).to_ne_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    #[tokio::test]
    async fn reads_consecutive_frames() {
        let mut wire = encode(b"{\"a\":1}");
        wire.extend(encode(b"{\"b\":2}"));
        let mut reader = FrameReader::new(wire.as_slice(), DEFAULT_MAX_FRAME_LEN);
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"{\"a\":1}");
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"{\"b\":2}");
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_body_is_fatal() {
        let mut wire = 100u32.to_ne_bytes().to_vec();
        wire.extend(vec![b'x'; 40]);
        let mut reader = FrameReader::new(wire.as_slice(), DEFAULT_MAX_FRAME_LEN);
        match reader.read_frame().await {
            Err(TransportError::Truncated { expected, read }) => {
                assert_eq!(expected, 100);
                assert_eq!(read, 40);
            }
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncated_header_is_fatal() {
        let wire = [7u8, 0];
        let mut reader = FrameReader::new(&wire[..], DEFAULT_MAX_FRAME_LEN);
        assert!(matches!(
            reader.read_frame().await,
            Err(TransportError::Truncated { expected: 4, read: 2 })
        ));
    }

    #[tokio::test]
    async fn zero_length_frame_ends_stream() {
        let mut wire = 0u32.to_ne_bytes().to_vec();
        wire.extend(encode(b"ignored"));
        let mut reader = FrameReader::new(wire.as_slice(), DEFAULT_MAX_FRAME_LEN);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_header_rejected() {
        let wire = encode(&[0u8; 64]);
        let mut reader = FrameReader::new(wire.as_slice(), 16);
        assert!(matches!(
            reader.read_frame().await,
            Err(TransportError::FrameTooLarge { len: 64, max: 16 })
        ));
    }

    #[tokio::test]
    async fn writer_emits_prefix_and_body() {
        let mut writer = FrameWriter::new(Vec::new(), DEFAULT_MAX_FRAME_LEN);
        writer.write_frame(b"hello").await.unwrap();
        assert_eq!(writer.into_inner(), encode(b"hello"));
    }

    #[tokio::test]
    async fn reads_across_split_writes() {
        let (client, server) = tokio::io::duplex(8);
        let mut writer = FrameWriter::new(client, DEFAULT_MAX_FRAME_LEN);
        let body = vec![b'z'; 50];
        let expected = body.clone();
        let send = tokio::spawn(async move {
            writer.write_frame(&body).await.unwrap();
        });
        let mut reader = FrameReader::new(server, DEFAULT_MAX_FRAME_LEN);
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), expected);
        send.await.unwrap();
    }
}
