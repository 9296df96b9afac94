//! Connection handling for sagiri-guard servers and devices.
//!
//! The server side accepts long-lived notification connections, keeps an
//! ordered registry of online devices and answers one-shot API requests
//! through a pluggable handler. The client side keeps a single notification
//! connection alive and issues API calls on fresh connections.
//!
//! ## Features
//!
//! - **Registry**: newest-first device list with unicast and admin broadcast
//! - **Notification server**: identifier handshake, greeting, echo or sink delivery
//! - **API server**: one request per connection, routed by message type
//! - **Client session**: reconnect loop with a fixed backoff and request/reply demux
//! - **Transfers**: ordered backup and restore helpers
//!
//! ## Example
//!
//! ```rust,no_run
//! use guard_session::{ClientConfig, ClientSession, GuardServer, ServerConfig};
//! use guard_wire::DeviceId;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = GuardServer::new(ServerConfig::default()).start().await?;
//!
//! let client = ClientSession::new(ClientConfig::default());
//! client.connect_notification(DeviceId::new("laptop-01")?).await;
//! let users = client.get_online_users().await?;
//! println!("online: {:?}", users);
//!
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod api_server;
pub mod client;
pub mod events;
mod notify_server;
pub mod registry;
pub mod router;
pub mod server;
pub mod transfer;
pub mod transport;

pub use api_server::{handler_fn, FallbackHandler, HandlerFn, Responder};
pub use client::{ensure_success, ClientConfig, ClientError, ClientSession, ConnectionState};
pub use events::{ConnectHandler, DisconnectHandler, MessageCallback, MessageSink, RequestHandler};
pub use notify_server::CONNECTION_SPAN;
pub use registry::{ConnId, ConnectionHandle, ConnectionRegistry, DuplicatePolicy};
pub use router::RequestRouter;
pub use server::{GuardServer, ServerConfig, ServerHandle};
pub use transfer::{BackupTransfer, RestoreTransfer};
pub use transport::{connect_tcp, listen_tcp};
