//! Collaborator hooks for servers and clients.

use async_trait::async_trait;
use guard_wire::{ApiRequest, DeviceId, Frame};

use crate::api_server::Responder;
use crate::registry::ConnectionHandle;

/// Called after a device registers and its greeting is queued
#[async_trait]
pub trait ConnectHandler: Send + Sync {
    /// A device came online
    async fn on_connect(&self, conn: &ConnectionHandle);
}

/// Called after a device is unregistered
#[async_trait]
pub trait DisconnectHandler: Send + Sync {
    /// A device went offline
    async fn on_disconnect(&self, device_id: &DeviceId);
}

/// Receives every frame read on a registered notification connection.
///
/// Without a sink the server logs the frame and echoes it back.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Handle one inbound frame
    async fn on_message(&self, conn: &ConnectionHandle, frame: Frame) -> anyhow::Result<()>;
}

/// Serves one API request. The handler owns the response: it must send it
/// (or deliberately not, as for backup cancel) through `responder`, which
/// closes the connection when consumed or dropped.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one request
    async fn handle(&self, request: ApiRequest, responder: Responder) -> anyhow::Result<()>;
}

/// Client-side receiver of notification frames
pub trait MessageCallback: Send + Sync {
    /// Handle one frame
    fn on_message(&self, frame: Frame);
}

impl<F> MessageCallback for F
where
    F: Fn(Frame) + Send + Sync,
{
    fn on_message(&self, frame: Frame) {
        self(frame)
    }
}
