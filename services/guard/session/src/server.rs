//! Server lifecycle: both listeners, the shared registry and shutdown.

use anyhow::Context;
use guard_wire::{DEFAULT_FRAME_BUFFER_SIZE, DEFAULT_MAX_API_PAYLOAD};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::api_server::{run_api_listener, ApiContext, FallbackHandler};
use crate::events::{ConnectHandler, DisconnectHandler, MessageSink, RequestHandler};
use crate::notify_server::{run_notify_listener, NotifyContext};
use crate::registry::{ConnectionRegistry, DuplicatePolicy};
use crate::transport::listen_tcp;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Notification listener address
    pub notify_addr: SocketAddr,
    /// API listener address
    pub api_addr: SocketAddr,
    /// Time allowed for the identifier frame
    pub handshake_timeout: Duration,
    /// Time allowed to receive one API request
    pub request_timeout: Duration,
    /// Per-frame receive cap on the notification channel
    pub frame_buffer_size: usize,
    /// Largest accepted API payload
    pub max_api_payload: usize,
    /// Duplicate identifier handling
    pub duplicate_policy: DuplicatePolicy,
    /// Credentials accepted by the fallback login
    pub admin_username: String,
    /// Credentials accepted by the fallback login
    pub admin_password: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            notify_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            api_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            handshake_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            frame_buffer_size: DEFAULT_FRAME_BUFFER_SIZE,
            max_api_payload: DEFAULT_MAX_API_PAYLOAD,
            duplicate_policy: DuplicatePolicy::Allow,
            admin_username: "admin".to_string(),
            admin_password: "admin".to_string(),
        }
    }
}

impl ServerConfig {
    /// Config bound to ephemeral loopback ports
    pub fn loopback() -> Self {
        Self {
            notify_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            api_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Self::default()
        }
    }
}

/// Notification + API server
pub struct GuardServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    request_handler: Option<Arc<dyn RequestHandler>>,
    connect_handler: Option<Arc<dyn ConnectHandler>>,
    disconnect_handler: Option<Arc<dyn DisconnectHandler>>,
    message_sink: Option<Arc<dyn MessageSink>>,
}

impl GuardServer {
    /// Server with a fresh registry
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.duplicate_policy));
        Self {
            config,
            registry,
            request_handler: None,
            connect_handler: None,
            disconnect_handler: None,
            message_sink: None,
        }
    }

    /// Share an existing registry
    pub fn with_registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Install the API handler (replaces the login/list fallback)
    pub fn with_request_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.request_handler = Some(handler);
        self
    }

    /// Observe devices coming online
    pub fn with_connect_handler(mut self, handler: Arc<dyn ConnectHandler>) -> Self {
        self.connect_handler = Some(handler);
        self
    }

    /// Observe devices going offline
    pub fn with_disconnect_handler(mut self, handler: Arc<dyn DisconnectHandler>) -> Self {
        self.disconnect_handler = Some(handler);
        self
    }

    /// Receive inbound notification frames (replaces log-and-echo)
    pub fn with_message_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.message_sink = Some(sink);
        self
    }

    /// Registry shared by both listeners
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// The built-in login/list handler over this server's registry
    pub fn fallback_handler(&self) -> FallbackHandler {
        FallbackHandler::new(
            self.registry.clone(),
            self.config.admin_username.clone(),
            self.config.admin_password.clone(),
        )
    }

    /// Bind both listeners and start accepting
    pub async fn start(self) -> anyhow::Result<ServerHandle> {
        let notify_listener = listen_tcp(self.config.notify_addr)
            .await
            .with_context(|| format!("binding notification port {}", self.config.notify_addr))?;
        let api_listener = listen_tcp(self.config.api_addr)
            .await
            .with_context(|| format!("binding API port {}", self.config.api_addr))?;

        let notify_addr = notify_listener.local_addr()?;
        let api_addr = api_listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let active = Arc::new(AtomicUsize::new(0));

        let notify_ctx = Arc::new(NotifyContext {
            registry: self.registry.clone(),
            handshake_timeout: self.config.handshake_timeout,
            frame_buffer_size: self.config.frame_buffer_size,
            connect_handler: self.connect_handler.clone(),
            disconnect_handler: self.disconnect_handler.clone(),
            message_sink: self.message_sink.clone(),
            active: active.clone(),
        });
        let api_ctx = Arc::new(ApiContext {
            request_handler: self.request_handler.clone(),
            fallback: self.fallback_handler(),
            request_timeout: self.config.request_timeout,
            max_api_payload: self.config.max_api_payload,
        });

        let tasks = vec![
            tokio::spawn(run_notify_listener(
                notify_listener,
                notify_ctx,
                shutdown_rx.clone(),
            )),
            tokio::spawn(run_api_listener(api_listener, api_ctx, shutdown_rx)),
        ];

        info!(
            "Server started: notifications on {}, API on {}",
            notify_addr, api_addr
        );

        Ok(ServerHandle {
            notify_addr,
            api_addr,
            registry: self.registry,
            active,
            shutdown_tx,
            tasks,
        })
    }
}

/// Handle to a running server
pub struct ServerHandle {
    notify_addr: SocketAddr,
    api_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    active: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Bound notification address
    pub fn notify_addr(&self) -> SocketAddr {
        self.notify_addr
    }

    /// Bound API address
    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    /// Shared registry
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Notification connections currently being served
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop both listeners and close every connection
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        let closed = self.registry.close_all().await;
        info!("Server stopped, closed {} connections", closed);
    }
}
