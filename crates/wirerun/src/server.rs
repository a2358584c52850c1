//! # Call Dispatcher
//!
//! Serves a [`ServiceRegistry`] over any number of connections.
//!
//! ## Philosophy
//!
//! - **Reader Never Blocks On Work**: Each request gets its own task. The reader
//!   goes straight back to the stream, so a slow call never delays the next one.
//! - **One Answer Per Request**: Every decoded request produces exactly one
//!   response, success or failure. A panicking operation is an execution failure,
//!   not a dead connection.
//! - **Any Order**: Responses are written as they complete. Callers correlate by id.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use wirerpc::Frame;
use wirerpc::Request;
use wirerpc::Response;

use crate::config::ServerConfig;
use crate::connection::CloseReason;
use crate::connection::Connection;
use crate::connection::FrameHandler;
use crate::registry::ServiceRegistry;
use crate::transport::StreamTransport;
use crate::transport::Transport;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: std::io::Error },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Per-connection dispatch settings.
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    /// Upper bound on concurrently executing requests per connection.
    /// `None` lets every request run as soon as it arrives.
    pub max_in_flight: Option<usize>,
}

impl From<&ServerConfig> for ServeOptions {
    fn from(config: &ServerConfig) -> Self {
        Self { max_in_flight: config.max_in_flight }
    }
}

/// Resolves and runs one request, producing its single response.
pub async fn dispatch(registry: &ServiceRegistry, request: Request) -> Response {
    let Request { id, service, method, params } = request;

    let target = match registry.resolve(&service) {
        Ok(target) => target,
        Err(e) => {
            debug!(id, service = %service, method = %method, error = %e, "unresolved service");
            return Response::service_not_found(id);
        }
    };

    let invocation = match target.resolve(&method, params) {
        Ok(invocation) => invocation,
        Err(e) => {
            debug!(id, service = %service, method = %method, error = %e, "unresolved method");
            return Response::method_not_found(id);
        }
    };

    match invocation.run().await {
        Ok(answer) => Response::ok(id, answer),
        Err(description) => {
            debug!(id, service = %service, method = %method, error = %description, "operation failed");
            Response::execution_failed(id, description)
        }
    }
}

/// Spawns workers for inbound requests.
struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    permits: Option<Arc<Semaphore>>,
}

#[async_trait::async_trait]
impl FrameHandler for Dispatcher {
    async fn on_frame(&self, frame: Frame, conn: &Arc<Connection>) -> std::result::Result<(), CloseReason> {
        let request = match frame {
            Frame::Request(request) => request,
            Frame::Response(response) => {
                return Err(CloseReason::Protocol(format!(
                    "server received a response (id {})",
                    response.id
                )));
            }
        };

        // waiting here stops the reader, which pushes back on the peer
        let permit = match &self.permits {
            Some(permits) => match permits.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return Err(CloseReason::Local),
            },
            None => None,
        };

        let conn = conn.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let response = dispatch(&registry, request).await;
            write_response(&conn, response).await;
            drop(permit);
        });
        Ok(())
    }

    fn on_close(&self, _reason: &CloseReason) {}
}

async fn write_response(conn: &Connection, response: Response) {
    let id = response.id;
    let err = match conn.send(&Frame::Response(response)).await {
        Ok(()) => return,
        Err(err) => err,
    };

    if !err.is_local() {
        debug!(id, peer = conn.peer(), error = %err, "dropping response");
        return;
    }

    warn!(id, error = %err, "response could not be sent, replying with a failure");
    let fallback = Response::execution_failed(id, format!("response could not be sent: {}", err));
    if let Err(e) = conn.send(&Frame::Response(fallback)).await {
        debug!(id, peer = conn.peer(), error = %e, "dropping fallback response");
    }
}

fn serve_connection(
    transport: Arc<dyn Transport>,
    peer: String,
    registry: Arc<ServiceRegistry>,
    options: &ServeOptions,
    cancel: CancellationToken,
) -> Arc<Connection> {
    let dispatcher = Dispatcher {
        registry,
        permits: options.max_in_flight.map(|n| Arc::new(Semaphore::new(n))),
    };
    let conn = Connection::new(transport, peer, cancel);
    conn.start(Arc::new(dispatcher));
    conn
}

/// Serves `registry` over a single transport until either side closes it.
pub fn serve_transport<T: Transport>(
    transport: T,
    registry: Arc<ServiceRegistry>,
    options: ServeOptions,
) -> Arc<Connection> {
    serve_connection(Arc::new(transport), "transport".into(), registry, &options, CancellationToken::new())
}

/// A TCP listener that dispatches every accepted connection.
pub struct Server {
    listener: TcpListener,
    registry: Arc<ServiceRegistry>,
    options: ServeOptions,
    max_frame_len: usize,
    shutdown: CancellationToken,
}

impl Server {
    pub async fn bind(config: &ServerConfig, registry: Arc<ServiceRegistry>) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind)
            .await
            .map_err(|source| Error::Bind { addr: config.bind.clone(), source })?;

        Ok(Self {
            listener,
            registry,
            options: ServeOptions::from(config),
            max_frame_len: config.max_frame_len,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until [`Server::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        info!(addr = %self.local_addr()?, services = self.registry.len(), "listening");

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, error = %e, "could not disable nagle");
            }
            let transport = StreamTransport::tcp(stream, self.max_frame_len);
            serve_connection(
                Arc::new(transport),
                peer.to_string(),
                self.registry.clone(),
                &self.options,
                self.shutdown.child_token(),
            );
        }

        info!("server stopped");
        Ok(())
    }

    /// Stops accepting and closes every connection this server opened.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
