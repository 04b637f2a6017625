//! Transport layer for controller ↔ agent communication.
//!
//! Provides the `Transport` trait plus two implementations:
//! `FramedTransport` (length-prefixed frames over any byte stream) and
//! `WebSocketTransport` (one text message per envelope).

pub mod framed;
pub mod websocket;

pub use framed::FramedTransport;
pub use websocket::WebSocketTransport;

use anyhow::Result;
use async_trait::async_trait;

/// Maximum message size (64 MB). Safety valve against malformed messages.
const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// A message-oriented, bidirectional connection.
///
/// Frames are opaque bytes; envelopes are encoded and decoded by the caller.
#[async_trait]
pub trait Transport: Send {
    type Sink: FrameSink;
    type Source: FrameSource;

    /// Send one frame.
    async fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Wait for the next inbound frame.
    ///
    /// Returns `Ok(None)` once the peer has closed the connection.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;

    /// Close the connection. Closing twice is a no-op.
    async fn close(&mut self) -> Result<()>;

    /// Split into halves that can be driven concurrently.
    fn split(self) -> (Self::Sink, Self::Source)
    where
        Self: Sized;
}

/// Outbound half of a split transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Close the outbound direction. Closing twice is a no-op.
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a split transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Returns `Ok(None)` once the peer has closed the connection.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Write a length-prefixed message to a writer.
///
/// Format: [4-byte big-endian length][payload bytes]
pub async fn send_message<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| anyhow::anyhow!("Message too large: {} bytes", payload.len()))?;
    anyhow::ensure!(
        len <= MAX_MESSAGE_SIZE,
        "Message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
    );

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed message from a reader.
///
/// Returns `None` on a clean end of stream before the length prefix. An end
/// of stream partway through the prefix or body is an error.
/// Enforces `MAX_MESSAGE_SIZE`.
pub async fn recv_message<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            anyhow::bail!("Stream ended inside a length prefix ({filled} of 4 bytes)");
        }
        filled += n;
    }
    let len = u32::from_be_bytes(len_buf);

    anyhow::ensure!(
        len <= MAX_MESSAGE_SIZE,
        "Message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
    );

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_framing() {
        let payload = br#"{"n":"rf","p":"/tmp/a","s":1000}"#;
        let mut buf = Vec::new();

        send_message(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let received = recv_message(&mut cursor).await.unwrap();
        assert_eq!(received.as_deref(), Some(&payload[..]));
        assert!(recv_message(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_payload() {
        let mut buf = Vec::new();
        send_message(&mut buf, b"").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let received = recv_message(&mut cursor).await.unwrap().unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let mut mock = tokio_test::io::Builder::new()
            .read(&(MAX_MESSAGE_SIZE + 1).to_be_bytes())
            .build();
        assert!(recv_message(&mut mock).await.is_err());
    }

    #[tokio::test]
    async fn truncated_prefix_is_an_error() {
        let mut mock = tokio_test::io::Builder::new().read(&[0, 0]).build();
        let err = recv_message(&mut mock).await.unwrap_err();
        assert!(err.to_string().contains("2 of 4 bytes"));
    }

    #[tokio::test]
    async fn prefix_split_across_reads() {
        let mut mock = tokio_test::io::Builder::new()
            .read(&[0, 0])
            .read(&[0, 2])
            .read(b"ok")
            .build();
        let frame = recv_message(&mut mock).await.unwrap();
        assert_eq!(frame.as_deref(), Some(&b"ok"[..]));
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let mut mock = tokio_test::io::Builder::new()
            .read(&8u32.to_be_bytes())
            .read(b"abc")
            .build();
        assert!(recv_message(&mut mock).await.is_err());
    }
}
