//! WebSocket transport: one text message per envelope.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use super::{FrameSink, FrameSource, Transport};

/// Transport over an established WebSocket stream.
///
/// Ping/pong frames are answered by tungstenite and never surface as frames.
pub struct WebSocketTransport<S> {
    stream: WebSocketStream<S>,
    closed: bool,
}

/// Outbound half of a split [`WebSocketTransport`].
pub struct WebSocketSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    closed: bool,
}

/// Inbound half of a split [`WebSocketTransport`].
pub struct WebSocketSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub const fn new(stream: WebSocketStream<S>) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

impl WebSocketTransport<MaybeTlsStream<TcpStream>> {
    /// Open a client connection to `url` (e.g. `ws://localhost:8765`).
    pub async fn connect(url: &str) -> Result<Self> {
        debug!(url = %url, "Connecting WebSocket transport");
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to {url}"))?;
        Ok(Self::new(stream))
    }
}

impl WebSocketTransport<TcpStream> {
    /// Complete the server side of the WebSocket handshake.
    pub async fn accept(stream: TcpStream) -> Result<Self> {
        let stream = tokio_tungstenite::accept_async(stream)
            .await
            .context("WebSocket handshake failed")?;
        Ok(Self::new(stream))
    }
}

fn text_message(frame: &[u8]) -> Result<Message> {
    let text = std::str::from_utf8(frame).context("Envelope is not valid UTF-8")?;
    Ok(Message::text(text.to_owned()))
}

async fn send_frame<Si>(sink: &mut Si, frame: &[u8]) -> Result<()>
where
    Si: Sink<Message, Error = WsError> + Unpin + Send,
{
    sink.send(text_message(frame)?)
        .await
        .context("Failed to send WebSocket message")
}

async fn next_frame<St>(stream: &mut St) -> Result<Option<Vec<u8>>>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin + Send,
{
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => return Ok(Some(text.as_str().as_bytes().to_vec())),
            Ok(Message::Binary(data)) => return Ok(Some(data.to_vec())),
            Ok(Message::Close(frame)) => {
                debug!(?frame, "Peer closed WebSocket");
                return Ok(None);
            }
            Ok(other) => trace!(?other, "Ignoring control frame"),
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => return Ok(None),
            Err(e) => return Err(e).context("Failed to read WebSocket message"),
        }
    }
    Ok(None)
}

async fn close_sink<Si>(sink: &mut Si) -> Result<()>
where
    Si: Sink<Message, Error = WsError> + Unpin + Send,
{
    match SinkExt::close(sink).await {
        Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
        Err(e) => Err(e).context("Failed to close WebSocket"),
    }
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    type Sink = WebSocketSink<S>;
    type Source = WebSocketSource<S>;

    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        if self.closed {
            anyhow::bail!("Transport is closed");
        }
        send_frame(&mut self.stream, frame).await
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if self.closed {
            return Ok(None);
        }
        next_frame(&mut self.stream).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        close_sink(&mut self.stream).await
    }

    fn split(self) -> (Self::Sink, Self::Source) {
        let (sink, stream) = self.stream.split();
        (
            WebSocketSink {
                sink,
                closed: self.closed,
            },
            WebSocketSource { stream },
        )
    }
}

#[async_trait]
impl<S> FrameSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        if self.closed {
            anyhow::bail!("Transport is closed");
        }
        send_frame(&mut self.sink, frame).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        close_sink(&mut self.sink).await
    }
}

#[async_trait]
impl<S> FrameSource for WebSocketSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        next_frame(&mut self.stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn text_messages_roundtrip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut transport = WebSocketTransport::accept(stream).await.unwrap();
            let frame = transport.recv().await.unwrap().unwrap();
            transport.send(&frame).await.unwrap();
            // Drain until the client closes.
            while transport.recv().await.unwrap().is_some() {}
        });

        let mut client = WebSocketTransport::connect(&format!("ws://{addr}"))
            .await
            .unwrap();
        client.send(br#"{"n":"gsi","p":null,"s":1}"#).await.unwrap();
        let echoed = client.recv().await.unwrap().unwrap();
        assert_eq!(echoed, br#"{"n":"gsi","p":null,"s":1}"#.to_vec());

        client.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn split_halves_share_one_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut transport = WebSocketTransport::accept(stream).await.unwrap();
            while let Some(frame) = transport.recv().await.unwrap() {
                transport.send(&frame).await.unwrap();
            }
        });

        let client = WebSocketTransport::connect(&format!("ws://{addr}"))
            .await
            .unwrap();
        let (mut sink, mut source) = client.split();
        sink.send(b"one").await.unwrap();
        sink.send(b"two").await.unwrap();
        assert_eq!(source.recv().await.unwrap().as_deref(), Some(&b"one"[..]));
        assert_eq!(source.recv().await.unwrap().as_deref(), Some(&b"two"[..]));

        sink.close().await.unwrap();
        server.await.unwrap();
    }
}
