//! Long-lived notification listener.
//!
//! Per connection: read one frame as the device identifier, register, then
//! stream frames to the message sink until the peer goes away, the entry is
//! evicted or the server stops.

use bytes::BytesMut;
use futures::FutureExt;
use guard_wire::{describe, read_frame, DeviceId, Frame, FrameDecoder, MsgType};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::events::{ConnectHandler, DisconnectHandler, MessageSink};
use crate::registry::{ConnectionHandle, ConnectionRegistry, DuplicatePolicy};

/// Name of the span wrapping each device connection; carries `peer`,
/// `device_id` and `conn_id`
pub const CONNECTION_SPAN: &str = "conn";

/// How long teardown waits for queued frames to reach the socket
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) struct NotifyContext {
    pub registry: Arc<ConnectionRegistry>,
    pub handshake_timeout: Duration,
    pub frame_buffer_size: usize,
    pub connect_handler: Option<Arc<dyn ConnectHandler>>,
    pub disconnect_handler: Option<Arc<dyn DisconnectHandler>>,
    pub message_sink: Option<Arc<dyn MessageSink>>,
    pub active: Arc<AtomicUsize>,
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        let total = counter.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Active notification connections: {}", total);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let total = self.0.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!("Active notification connections: {}", total);
    }
}

pub(crate) fn online_message(device_id: &DeviceId) -> String {
    format!("Device {} Online\n", device_id)
}

pub(crate) fn offline_message(device_id: &DeviceId) -> String {
    format!("Device {} Offline\n", device_id)
}

pub(crate) fn greeting(device_id: &DeviceId) -> String {
    format!("Hello {} from server handler\n", device_id)
}

/// Accept notification connections until shutdown is signalled
pub(crate) async fn run_notify_listener(
    listener: TcpListener,
    ctx: Arc<NotifyContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let local = listener.local_addr().ok();
    info!("Notification listener running on {:?}", local);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let ctx = ctx.clone();
                    let shutdown = shutdown.clone();
                    let span = info_span!(
                        CONNECTION_SPAN,
                        %peer,
                        device_id = tracing::field::Empty,
                        conn_id = tracing::field::Empty
                    );
                    tokio::spawn(
                        async move {
                            if let Err(e) = handle_notify_connection(stream, peer, ctx, shutdown).await {
                                warn!("Notification connection from {} failed: {:#}", peer, e);
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) => warn!("Failed to accept notification connection: {}", e),
            }
        }
    }

    info!("Notification listener on {:?} stopped", local);
}

async fn handle_notify_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<NotifyContext>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let _active = ActiveGuard::new(ctx.active.clone());
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = FrameDecoder::with_max_payload(ctx.frame_buffer_size);
    let mut buffer = BytesMut::with_capacity(4096);

    let first = tokio::time::timeout(
        ctx.handshake_timeout,
        read_frame(&mut reader, &mut decoder, &mut buffer),
    )
    .await;
    let device_id = match first {
        Ok(Ok(frame)) => match DeviceId::from_wire(&frame.payload) {
            Some(id) => id,
            None => {
                warn!("Empty device identifier from {}, closing", peer);
                return Ok(());
            }
        },
        Ok(Err(e)) => {
            debug!("{} left before identifying: {}", peer, e);
            return Ok(());
        }
        Err(_) => {
            warn!(
                "{} sent no identifier within {:?}, closing",
                peer, ctx.handshake_timeout
            );
            return Ok(());
        }
    };

    let (handle, mut outbound) =
        ConnectionHandle::new(ctx.registry.next_conn_id(), device_id.clone(), Some(peer));
    let span = tracing::Span::current();
    span.record("device_id", device_id.as_str());
    span.record("conn_id", handle.conn_id());

    let mut writer_task = tokio::spawn(
        async move {
            while let Some(bytes) = outbound.recv().await {
                if let Err(e) = writer.write_all(&bytes).await {
                    debug!("Write failed: {}", e);
                    break;
                }
            }
            let _ = writer.shutdown().await;
        }
        .in_current_span(),
    );

    ctx.registry.register(handle.clone()).await;
    info!("Device {} connected from {}", device_id, peer);

    ctx.registry
        .broadcast(device_id.as_str(), online_message(&device_id).as_bytes())
        .await;
    handle.send(greeting(&device_id).as_bytes());

    if let Some(on_connect) = &ctx.connect_handler {
        if AssertUnwindSafe(on_connect.on_connect(&handle))
            .catch_unwind()
            .await
            .is_err()
        {
            error!("Connect handler panicked for {}", device_id);
        }
    }

    let reason = loop {
        if *shutdown.borrow() {
            break "server shutdown";
        }

        tokio::select! {
            _ = shutdown.changed() => break "server shutdown",
            _ = handle.closed() => break "closed by server",
            result = read_frame(&mut reader, &mut decoder, &mut buffer) => match result {
                Ok(frame) => deliver(&ctx, &handle, frame).await,
                Err(e) if e.is_disconnect() => break "peer disconnected",
                Err(e) => {
                    warn!("Bad frame from {}: {}", device_id, e);
                    break "protocol error";
                }
            }
        }
    };

    ctx.registry.unregister_connection(handle.conn_id()).await;
    info!("Device {} disconnected ({})", device_id, reason);

    // a replacing connection for the same id keeps the device online
    let replaced = ctx.registry.policy() == DuplicatePolicy::Replace
        && ctx.registry.find(device_id.as_str()).await.is_some();
    if !replaced {
        ctx.registry
            .broadcast(device_id.as_str(), offline_message(&device_id).as_bytes())
            .await;
    }

    if let Some(on_disconnect) = &ctx.disconnect_handler {
        if AssertUnwindSafe(on_disconnect.on_disconnect(&device_id))
            .catch_unwind()
            .await
            .is_err()
        {
            error!("Disconnect handler panicked for {}", device_id);
        }
    }

    drop(handle);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task)
        .await
        .is_err()
    {
        writer_task.abort();
    }

    Ok(())
}

async fn deliver(ctx: &NotifyContext, handle: &ConnectionHandle, frame: Frame) {
    debug!(
        "{} from {} ({} bytes{})",
        describe(frame.typ),
        handle.device_id(),
        frame.payload.len(),
        if frame.is_truncated() { ", truncated" } else { "" }
    );

    match &ctx.message_sink {
        Some(sink) => match AssertUnwindSafe(sink.on_message(handle, frame))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Message sink failed for {}: {:#}", handle.device_id(), e),
            Err(_) => error!("Message sink panicked for {}", handle.device_id()),
        },
        None => {
            info!("Client {}: {}", handle.device_id(), frame.text().trim_end());
            handle.send_frame(MsgType::Socket, &frame.payload);
        }
    }
}
