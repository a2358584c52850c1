//! # Transport Abstraction
//!
//! A minimal, async interface for moving whole frames between two endpoints.
//!
//! ## Philosophy
//!
//! - **Frame-Oriented**: A Transport knows nothing about envelopes or values.
//!   It moves opaque frame bodies, one `send` per frame, one `recv` per frame.
//! - **Duplex**: Both directions are independent. Requests and responses share
//!   the same transport; telling them apart is the caller's business.
//! - **Exclusive Writes**: A frame is written whole or not at all. Concurrent
//!   senders are serialized by the implementation, never interleaved.

use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::codec::FramedWrite;
use tokio_util::codec::LengthDelimitedCodec;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The peer is unreachable or the stream was dropped.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The frame exceeds the configured maximum length.
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    /// Generic I/O error or internal transport failure.
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => Error::ConnectionLost(e.to_string()),
            _ => Error::Io(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A bidirectional channel of frames.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one frame. Returns once the frame has been handed to the stream.
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Receives the next frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream. A stream that ends in the
    /// middle of a frame is an error.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Shuts down the sending direction so the peer observes end of stream.
    async fn close(&self) -> Result<()>;
}

/// Length-prefixed frames over a byte stream.
///
/// Each frame is a 4-byte big-endian length followed by the body. The write
/// half sits behind a mutex held for exactly one frame write.
pub struct StreamTransport<R, W> {
    reader: Mutex<FramedRead<R, LengthDelimitedCodec>>,
    writer: Mutex<FramedWrite<W, LengthDelimitedCodec>>,
    max_frame_len: usize,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(read: R, write: W, max_frame_len: usize) -> Self {
        let codec = || {
            LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_len)
                .new_codec()
        };
        Self {
            reader: Mutex::new(FramedRead::new(read, codec())),
            writer: Mutex::new(FramedWrite::new(write, codec())),
            max_frame_len,
        }
    }
}

impl StreamTransport<OwnedReadHalf, OwnedWriteHalf> {
    /// Splits a TCP stream into independently owned halves.
    pub fn tcp(stream: TcpStream, max_frame_len: usize) -> Self {
        let (read, write) = stream.into_split();
        Self::new(read, write, max_frame_len)
    }
}

#[async_trait::async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, frame: &[u8]) -> Result<()> {
        if frame.len() > self.max_frame_len {
            return Err(Error::FrameTooLarge { size: frame.len(), limit: self.max_frame_len });
        }
        let mut writer = self.writer.lock().await;
        writer.send(Bytes::copy_from_slice(frame)).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        match reader.next().await {
            Some(Ok(frame)) => Ok(Some(frame.to_vec())),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        SinkExt::<Bytes>::close(&mut *writer).await?;
        Ok(())
    }
}

/// An in-memory duplex transport over unbounded channels.
///
/// Frames sent on one end appear on the other end's `recv`. Closing an end
/// drops its sender, so the other end observes end of stream.
pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl ChannelTransport {
    /// Creates a pair of transports connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self { tx: Mutex::new(Some(tx_a)), rx: Mutex::new(rx_b) };
        let b = Self { tx: Mutex::new(Some(tx_b)), rx: Mutex::new(rx_a) };
        (a, b)
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        let tx = self.tx.lock().await;
        let Some(tx) = tx.as_ref() else {
            return Err(Error::ConnectionLost("transport closed".into()));
        };
        tx.send(frame.to_vec())
            .map_err(|_| Error::ConnectionLost("channel closed".into()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn close(&self) -> Result<()> {
        self.tx.lock().await.take();
        Ok(())
    }
}
