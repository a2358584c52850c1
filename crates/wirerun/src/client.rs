//! # RPC Client with Correlated Replies
//!
//! A [`Client`] owns one connection. Its reader task routes every inbound
//! response to the caller waiting on that response's id.
//!
//! ## Invariants
//! - **Register Before Send**: A call's entry is in the pending table before its
//!   request can reach the peer, so a fast reply always finds its caller.
//! - **Always Removed**: The entry is removed on every exit path: reply, timeout,
//!   connection failure, or the caller dropping the future.
//! - **No Silent Nulls**: A failed call is always an error, never a null answer.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use wirepack::FromValue;
use wirepack::FromValueError;
use wirepack::Value;
use wirerpc::ErrorSpot;
use wirerpc::Frame;
use wirerpc::Request;
use wirerpc::Response;

use crate::config::ClientConfig;
use crate::connection;
use crate::connection::CloseReason;
use crate::connection::Connection;
use crate::connection::ConnectionState;
use crate::connection::FrameHandler;
use crate::transport::StreamTransport;
use crate::transport::Transport;

/// Everything a call can fail with.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    /// The remote side has no service by that name.
    #[error("service not found: {0}")]
    ServiceNotFound(String),
    /// The service has no method by that name and parameter shape.
    #[error("method not found: {0}")]
    MethodNotFound(String),
    /// The operation ran remotely and failed.
    #[error("remote execution failed: {0}")]
    RemoteExecution(String),
    /// The connection could not be opened, or closed before the reply arrived.
    #[error("connection failure: {0}")]
    ConnectionFailure(String),
    /// No reply arrived within the caller's limit.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    /// The request could not be encoded or exceeds the frame limit.
    #[error("failed to encode call: {0}")]
    Encode(String),
    /// The answer did not have the type the caller asked for.
    #[error("unexpected answer: {0}")]
    UnexpectedAnswer(#[from] FromValueError),
}

impl CallError {
    /// The error spot a remote failure was reported against, if any.
    pub fn error_spot(&self) -> Option<ErrorSpot> {
        match self {
            CallError::ServiceNotFound(_) => Some(ErrorSpot::Service),
            CallError::MethodNotFound(_) => Some(ErrorSpot::Method),
            CallError::RemoteExecution(_) => Some(ErrorSpot::Execution),
            _ => None,
        }
    }
}

impl From<connection::Error> for CallError {
    fn from(e: connection::Error) -> Self {
        if e.is_local() {
            CallError::Encode(e.to_string())
        } else {
            CallError::ConnectionFailure(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, CallError>;

type Reply = std::result::Result<Response, CallError>;
type PendingTable = DashMap<u64, oneshot::Sender<Reply>>;

/// Routes responses to waiting callers.
struct Correlator {
    pending: Arc<PendingTable>,
}

#[async_trait::async_trait]
impl FrameHandler for Correlator {
    async fn on_frame(&self, frame: Frame, _conn: &Arc<Connection>) -> std::result::Result<(), CloseReason> {
        let response = match frame {
            Frame::Response(response) => response,
            Frame::Request(request) => {
                return Err(CloseReason::Protocol(format!(
                    "client received a request (id {})",
                    request.id
                )));
            }
        };

        let Some((_, tx)) = self.pending.remove(&response.id) else {
            // late reply after a timeout, or an id this side never issued
            debug!(id = response.id, "dropping response for unknown call");
            return Ok(());
        };
        // the caller may have gone away in the meantime
        let _ = tx.send(Ok(response));
        Ok(())
    }

    fn on_close(&self, reason: &CloseReason) {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(CallError::ConnectionFailure(reason.to_string())));
            }
        }
    }
}

/// Removes a pending entry however the call ends.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

struct Inner {
    conn: Arc<Connection>,
    pending: Arc<PendingTable>,
    next_id: AtomicU64,
    call_timeout: Option<Duration>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.conn.abort();
    }
}

/// A handle for issuing calls over one connection.
///
/// Cheap to clone; every clone shares the connection and the pending table.
/// Dropping the last clone closes the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Opens a TCP connection to `config.addr`.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let addr = config.addr.as_str();
        info!(addr, "connecting");

        let connecting = TcpStream::connect(addr);
        let stream = match config.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| CallError::ConnectionFailure(format!("connect to {} timed out", addr)))?,
            None => connecting.await,
        }
        .map_err(|e| CallError::ConnectionFailure(format!("connect to {} failed: {}", addr, e)))?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(addr, error = %e, "could not disable nagle");
        }

        Ok(Self::over(StreamTransport::tcp(stream, config.max_frame_len), config))
    }

    /// Runs a client over an already established transport.
    pub fn over<T: Transport>(transport: T, config: &ClientConfig) -> Self {
        let pending = Arc::new(PendingTable::new());
        let conn = Connection::new(Arc::new(transport), config.addr.clone(), CancellationToken::new());
        conn.start(Arc::new(Correlator { pending: pending.clone() }));

        Self {
            inner: Arc::new(Inner {
                conn,
                pending,
                next_id: AtomicU64::new(1),
                call_timeout: config.call_timeout(),
            }),
        }
    }

    /// Calls `service.method(params)` with the configured default timeout.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value> {
        self.call_with_timeout(service, method, params, self.inner.call_timeout).await
    }

    /// Calls and converts a successful answer to `T`.
    pub async fn call_as<T: FromValue>(
        &self,
        service: &str,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T> {
        let answer = self.call(service, method, params).await?;
        Ok(T::from_value(answer)?)
    }

    /// Calls with an explicit timeout. `None` waits until the reply or a
    /// connection failure.
    ///
    /// A timeout abandons the reply. It does not cancel the remote execution.
    pub async fn call_with_timeout(
        &self,
        service: &str,
        method: &str,
        params: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let inner = &self.inner;
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        inner.pending.insert(id, tx);
        let _guard = PendingGuard { pending: &inner.pending, id };

        // checked after registering, so a concurrent close either sees the
        // entry or this call sees the close
        if !inner.conn.is_open() {
            return Err(CallError::ConnectionFailure("connection is closed".into()));
        }

        debug!(id, service, method, "calling");
        let request = Request::new(id, service, method, params);
        inner.conn.send(&Frame::Request(request)).await?;

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    debug!(id, service, method, "call timed out");
                    return Err(CallError::Timeout(limit));
                }
            },
            None => rx.await,
        };

        let response = match received {
            Ok(reply) => reply?,
            Err(_) => return Err(CallError::ConnectionFailure("connection is closed".into())),
        };
        answer_of(response)
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.conn.state()
    }

    pub fn is_open(&self) -> bool {
        self.inner.conn.is_open()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.conn.close_reason()
    }

    /// Closes the connection. Every pending call fails with `ConnectionFailure`.
    pub async fn close(&self) {
        self.inner.conn.close().await;
    }

    /// Resolves once the connection is closed, from either side.
    pub async fn closed(&self) {
        self.inner.conn.closed().await;
    }
}

fn answer_of(response: Response) -> Result<Value> {
    let describe = |answer: Value| match answer {
        Value::Str(msg) => msg,
        other => other.to_string(),
    };
    match response.error_spot {
        ErrorSpot::None => Ok(response.answer),
        ErrorSpot::Service => Err(CallError::ServiceNotFound(describe(response.answer))),
        ErrorSpot::Method => Err(CallError::MethodNotFound(describe(response.answer))),
        ErrorSpot::Execution => Err(CallError::RemoteExecution(describe(response.answer))),
    }
}
