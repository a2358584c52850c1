//! # Connection Lifecycle
//!
//! One duplex transport, one reader task, one published state.
//!
//! ```text
//! Disconnected -> Connecting -> Open -> Closing -> Closed
//! ```
//!
//! ## Invariants
//! - **Single Reader**: While `Open`, exactly one task decodes inbound frames and
//!   hands them to a [`FrameHandler`]. It never runs a call body itself.
//! - **Terminal Close**: EOF, a transport fault, an undecodable frame, or a local
//!   `close()` all end in `Closed`. The handler's `on_close` runs exactly once,
//!   before `Closed` is published.
//! - **Idempotent**: Closing a closed connection is a no-op.

use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use wirerpc::Frame;

use crate::transport;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("connection is closed")]
    Closed,
    #[error("failed to encode frame: {0}")]
    Encode(#[from] wirerpc::Error),
    #[error(transparent)]
    Transport(#[from] transport::Error),
}

impl Error {
    /// True when the failure concerns only the frame being sent, and the
    /// connection itself is still usable.
    pub fn is_local(&self) -> bool {
        matches!(self, Error::Encode(_) | Error::Transport(transport::Error::FrameTooLarge { .. }))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// How long closing waits for the transport to flush and shut down.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called on this side, or the owning server shut down.
    Local,
    /// The peer ended the stream cleanly.
    Eof,
    /// The transport failed while reading or writing.
    Transport(String),
    /// The peer sent something this side cannot accept.
    Protocol(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::Eof => write!(f, "peer closed the stream"),
            CloseReason::Transport(msg) => write!(f, "transport failure: {}", msg),
            CloseReason::Protocol(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

/// Receives every inbound frame of one connection.
#[async_trait::async_trait]
pub(crate) trait FrameHandler: Send + Sync + 'static {
    /// Routes one frame. Returning `Err` closes the connection with that reason.
    async fn on_frame(&self, frame: Frame, conn: &Arc<Connection>) -> std::result::Result<(), CloseReason>;

    /// Called once when the reader stops, before the state becomes `Closed`.
    fn on_close(&self, reason: &CloseReason);
}

pub struct Connection {
    peer: String,
    transport: Arc<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    reason: OnceLock<CloseReason>,
}

impl Connection {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        peer: impl Into<String>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            peer: peer.into(),
            transport,
            state,
            cancel,
            reason: OnceLock::new(),
        })
    }

    /// Spawns the reader task and opens the connection.
    pub(crate) fn start(self: &Arc<Self>, handler: Arc<dyn FrameHandler>) {
        let starting = self.state.send_if_modified(|state| {
            if *state != ConnectionState::Disconnected {
                return false;
            }
            *state = ConnectionState::Connecting;
            true
        });
        if !starting {
            return;
        }

        // open before the reader runs, so replies to its first frames can be sent
        self.state.send_replace(ConnectionState::Open);
        info!(peer = %self.peer, "connection open");

        let conn = self.clone();
        tokio::spawn(async move { conn.read_loop(handler).await });
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// The reason the connection ended, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.reason.get().cloned()
    }

    /// Encodes and writes one frame.
    ///
    /// A transport failure starts closing the connection. Encoding failures and
    /// oversized frames only fail this send. A write still pending when the
    /// connection closes is abandoned with [`Error::Closed`].
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Closed);
        }
        let bytes = frame.encode()?;
        // a write stuck on a full stream must not outlive the connection
        let written = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Closed),
            written = self.transport.send(&bytes) => written,
        };
        if let Err(e) = written {
            let err = Error::from(e);
            if !err.is_local() {
                debug!(peer = %self.peer, error = %err, "write failed, closing connection");
                let _ = self.reason.set(CloseReason::Transport(err.to_string()));
                self.cancel.cancel();
            }
            return Err(err);
        }
        Ok(())
    }

    /// Closes the connection and waits until it is `Closed`.
    pub async fn close(&self) {
        let never_started = self.state.send_if_modified(|state| {
            if *state != ConnectionState::Disconnected {
                return false;
            }
            *state = ConnectionState::Closed;
            true
        });
        if never_started {
            let _ = self.reason.set(CloseReason::Local);
            self.shutdown_transport().await;
            return;
        }

        self.cancel.cancel();
        self.closed().await;
    }

    /// Starts closing without waiting.
    pub(crate) fn abort(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the connection is `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;
    }

    async fn read_loop(self: Arc<Self>, handler: Arc<dyn FrameHandler>) {
        let reason = loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break CloseReason::Local,
                received = self.transport.recv() => received,
            };

            let bytes = match received {
                Ok(Some(bytes)) => bytes,
                Ok(None) => break CloseReason::Eof,
                Err(e) => break CloseReason::Transport(e.to_string()),
            };

            let frame = match Frame::decode(&bytes) {
                Ok(frame) => frame,
                Err(e) => break CloseReason::Protocol(e.to_string()),
            };

            let handled = tokio::select! {
                _ = self.cancel.cancelled() => break CloseReason::Local,
                handled = handler.on_frame(frame, &self) => handled,
            };
            if let Err(reason) = handled {
                break reason;
            }
        };

        self.finish(reason, handler.as_ref()).await;
    }

    async fn finish(&self, reason: CloseReason, handler: &dyn FrameHandler) {
        // a failed write records its reason before cancelling the reader
        let reason = self.reason.get().cloned().unwrap_or(reason);
        self.state.send_replace(ConnectionState::Closing);
        self.cancel.cancel();

        // waiters are released before the transport gets a chance to stall
        handler.on_close(&reason);
        self.shutdown_transport().await;

        match &reason {
            CloseReason::Local | CloseReason::Eof => {
                info!(peer = %self.peer, reason = %reason, "connection closed")
            }
            CloseReason::Transport(_) | CloseReason::Protocol(_) => {
                warn!(peer = %self.peer, reason = %reason, "connection closed")
            }
        }

        let _ = self.reason.set(reason);
        self.state.send_replace(ConnectionState::Closed);
    }

    async fn shutdown_transport(&self) {
        match tokio::time::timeout(CLOSE_GRACE, self.transport.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer = %self.peer, error = %e, "transport close failed"),
            Err(_) => debug!(peer = %self.peer, "transport close timed out, abandoning the stream"),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}
