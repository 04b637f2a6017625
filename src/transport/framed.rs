//! Length-prefixed frame transport over any byte stream.
//!
//! Each envelope travels as [4-byte BE length][JSON bytes]. Works over TCP
//! sockets, child-process pipes and in-memory duplex streams alike.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use super::{recv_message, send_message, FrameSink, FrameSource, Transport};

/// Read half: one frame per length-prefixed message.
pub struct FrameReader<R> {
    reader: R,
}

/// Write half: one length-prefixed message per frame.
pub struct FrameWriter<W> {
    writer: W,
    closed: bool,
}

#[async_trait]
impl<R> FrameSource for FrameReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        recv_message(&mut self.reader)
            .await
            .context("Failed to read frame")
    }
}

#[async_trait]
impl<W> FrameSink for FrameWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        if self.closed {
            anyhow::bail!("Transport is closed");
        }
        send_message(&mut self.writer, frame)
            .await
            .context("Failed to send frame")
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer
            .shutdown()
            .await
            .context("Failed to shut down writer")?;
        debug!("Framed transport closed");
        Ok(())
    }
}

/// Transport that frames messages with a 4-byte length prefix.
pub struct FramedTransport<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
}

impl<R, W> FramedTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub const fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FrameReader { reader },
            writer: FrameWriter {
                writer,
                closed: false,
            },
        }
    }
}

impl<S> FramedTransport<ReadHalf<S>, WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send,
{
    /// Split a single bidirectional stream into a framed transport.
    pub fn from_stream(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }
}

impl FramedTransport<OwnedReadHalf, OwnedWriteHalf> {
    /// Connect to a framed peer over TCP.
    pub async fn connect(addr: &str) -> Result<Self> {
        debug!(addr = %addr, "Connecting framed transport");
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {addr}"))?;
        Ok(Self::from_tcp(stream))
    }

    pub fn from_tcp(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer)
    }
}

#[async_trait]
impl<R, W> Transport for FramedTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    type Sink = FrameWriter<W>;
    type Source = FrameReader<R>;

    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.writer.send(frame).await
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if self.writer.closed {
            return Ok(None);
        }
        self.reader.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.close().await
    }

    fn split(self) -> (Self::Sink, Self::Source) {
        (self.writer, self.reader)
    }
}
