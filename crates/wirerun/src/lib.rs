//! # Wirerun
//!
//! The runtime half of wirecall: connections, the calling side, and the serving side.
//!
//! ## Philosophy
//!
//! - **Shared Stream**: One duplex connection carries many calls at once. A
//!   client correlates replies by id, so responses may arrive in any order.
//! - **Explicit Registries**: Services are plain tables registered up front and
//!   handed to the server; nothing is discovered at runtime.
//! - **Failures Are Typed**: A caller can always tell an unknown service from an
//!   unknown method, a failed operation, a broken connection, and a timeout.
//!
//! ## Example
//!
//! ```ignore
//! let registry = ServiceRegistry::builder()
//!     .service("Service", Service::new().method("getMail", || Ok::<_, String>("vip.alexd@gmail.com")))
//!     .build()?;
//! let server = Server::bind(&ServerConfig::default(), registry).await?;
//!
//! let client = Client::connect(&ClientConfig::new(server.local_addr()?.to_string())).await?;
//! let mail: String = client.call_as("Service", "getMail", vec![]).await?;
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod registry;
pub mod server;
pub mod transport;


pub use client::CallError;
pub use client::Client;
pub use config::ClientConfig;
pub use config::ServerConfig;
pub use connection::CloseReason;
pub use connection::Connection;
pub use connection::ConnectionState;
pub use registry::RegistryBuilder;
pub use registry::Service;
pub use registry::ServiceRegistry;
pub use server::ServeOptions;
pub use server::Server;
pub use server::dispatch;
pub use server::serve_transport;
pub use transport::ChannelTransport;
pub use transport::StreamTransport;
pub use transport::Transport;

pub use wirepack::FromValue;
pub use wirepack::Value;
pub use wirerpc::ErrorSpot;
