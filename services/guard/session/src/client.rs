//! Device/admin client.
//!
//! The notification socket is owned by one background task that keeps it
//! connected: connect, send the identifier, await the greeting, then read
//! frames until the socket fails, sleep the backoff and start over. That task
//! is the only reader; [`ClientSession::send_and_wait`] parks a reply slot
//! that the reader fills with the next `MSG_SOCKET` frame.
//!
//! API calls are independent of the notification socket: each opens a fresh
//! connection, writes one request and reads one response.

use bytes::{Bytes, BytesMut};
use guard_wire::transfer::{
    AdminRestoreRequest, AdminRestoreResponse, BackupChunkRequest, BackupFinishRequest,
    BackupInitRequest, BackupResumeRequest, CancelRequest, RestoreChunkRequest,
    RestoreFinishRequest, RestoreInitRequest, RestoreResumeRequest,
};
use guard_wire::{
    describe, read_frame, read_response, write_frame, write_request, ApiRequest, ApiResponse,
    DeviceId, Frame, FrameDecoder, MsgType, WireError, DEFAULT_FRAME_BUFFER_SIZE,
    DEFAULT_MAX_API_PAYLOAD,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::events::MessageCallback;
use crate::notify_server::CONNECTION_SPAN;
use crate::transport::connect_tcp;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// TCP connect failed or timed out
    #[error("connect to {addr} failed: {source}")]
    Connect {
        /// Target address
        addr: String,
        /// Cause
        #[source]
        source: std::io::Error,
    },

    /// No response within the receive timeout
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// Framing or payload error
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Socket error after connecting
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The notification socket is not up
    #[error("notification channel not connected")]
    NotConnected,

    /// The notification socket dropped while waiting for a reply
    #[error("notification channel closed while waiting for a reply")]
    Closed,

    /// The server answered with a non-200 status
    #[error("server returned status {status}: {body}")]
    Status {
        /// Status code
        status: u16,
        /// Body text
        body: String,
    },

    /// A transfer helper was used before init/resume attached a transfer id
    #[error("no transfer attached")]
    NoTransfer,
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host
    pub host: String,
    /// Notification port
    pub notify_port: u16,
    /// API port
    pub api_port: u16,
    /// Receive timeout for API responses and the greeting
    pub request_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Pause between reconnect attempts
    pub reconnect_backoff: Duration,
    /// Per-frame receive cap on the notification channel
    pub frame_buffer_size: usize,
    /// Largest accepted API response body
    pub max_api_payload: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            notify_port: 8080,
            api_port: 8081,
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(2),
            frame_buffer_size: DEFAULT_FRAME_BUFFER_SIZE,
            max_api_payload: DEFAULT_MAX_API_PAYLOAD,
        }
    }
}

impl ClientConfig {
    fn notify_addr(&self) -> String {
        format!("{}:{}", self.host, self.notify_port)
    }

    fn api_addr(&self) -> String {
        format!("{}:{}", self.host, self.api_port)
    }
}

/// Notification channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket
    Disconnected,
    /// Dialing or waiting for the greeting
    Connecting,
    /// Greeting received, frames flowing
    Connected,
}

#[derive(Serialize)]
struct LoginPayload<'a> {
    username: &'a str,
    password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct UserList {
    users: Vec<String>,
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    device_id: RwLock<Option<DeviceId>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    pending: Mutex<Option<oneshot::Sender<Frame>>>,
    exchange: Mutex<()>,
    callback: RwLock<Option<Arc<dyn MessageCallback>>>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn dispatch(&self, frame: Frame) {
        if frame.typ == MsgType::Socket.code() {
            if let Some(reply) = self.pending.lock().await.take() {
                let _ = reply.send(frame);
                return;
            }
        }

        self.notify_callback(frame).await;
    }

    async fn notify_callback(&self, frame: Frame) {
        match self.callback.read().await.as_ref() {
            Some(callback) => callback.on_message(frame),
            None => info!("[NOTIFICATION] {}: {}", describe(frame.typ), frame.text().trim_end()),
        }
    }

    async fn reset(&self) {
        *self.writer.lock().await = None;
        // dropping the sender wakes a waiter with `Closed`
        self.pending.lock().await.take();
        self.set_state(ConnectionState::Disconnected);
    }
}

struct Established {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    decoder: FrameDecoder,
    buffer: BytesMut,
    greeting: Frame,
}

async fn establish(config: &ClientConfig, device_id: &DeviceId) -> Result<Established, ClientError> {
    let addr = config.notify_addr();
    let stream = connect_tcp(addr.as_str(), config.connect_timeout)
        .await
        .map_err(|source| ClientError::Connect {
            addr: addr.clone(),
            source,
        })?;
    let (mut reader, mut writer) = stream.into_split();

    write_frame(&mut writer, MsgType::Socket.code(), device_id.as_str().as_bytes()).await?;

    let mut decoder = FrameDecoder::with_max_payload(config.frame_buffer_size);
    let mut buffer = BytesMut::with_capacity(4096);
    let greeting = tokio::time::timeout(
        config.request_timeout,
        read_frame(&mut reader, &mut decoder, &mut buffer),
    )
    .await
    .map_err(|_| ClientError::Timeout(config.request_timeout))??;

    Ok(Established {
        reader,
        writer,
        decoder,
        buffer,
        greeting,
    })
}

async fn run_notification_loop(shared: Arc<Shared>, config: ClientConfig, device_id: DeviceId) {
    loop {
        shared.set_state(ConnectionState::Connecting);

        match establish(&config, &device_id).await {
            Ok(mut conn) => {
                info!(
                    "Connected to notification server {} as {}",
                    config.notify_addr(),
                    device_id
                );
                // the greeting is never a reply to send_and_wait
                shared.notify_callback(conn.greeting).await;
                *shared.writer.lock().await = Some(conn.writer);
                shared.set_state(ConnectionState::Connected);

                loop {
                    match read_frame(&mut conn.reader, &mut conn.decoder, &mut conn.buffer).await {
                        Ok(frame) => shared.dispatch(frame).await,
                        Err(e) => {
                            warn!("Lost connection to notification server ({}), reconnecting", e);
                            break;
                        }
                    }
                }
                shared.reset().await;
            }
            Err(e) => {
                debug!("Notification connect attempt failed: {}", e);
                shared.set_state(ConnectionState::Disconnected);
            }
        }

        tokio::time::sleep(config.reconnect_backoff).await;
    }
}

/// Client for one server
pub struct ClientSession {
    config: ClientConfig,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientSession {
    /// Create a disconnected client
    pub fn new(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            shared: Arc::new(Shared {
                state,
                device_id: RwLock::new(None),
                writer: Mutex::new(None),
                pending: Mutex::new(None),
                exchange: Mutex::new(()),
                callback: RwLock::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    /// Install the notification callback at construction
    pub fn with_callback(self, callback: impl MessageCallback + 'static) -> Self {
        if let Ok(mut slot) = self.shared.callback.try_write() {
            *slot = Some(Arc::new(callback));
        }
        self
    }

    /// Replace the notification callback
    pub async fn set_callback(&self, callback: Arc<dyn MessageCallback>) {
        *self.shared.callback.write().await = Some(callback);
    }

    /// Configuration in use
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Current notification state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch notification state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Identifier saved by the last `connect_notification`
    pub async fn device_id(&self) -> Option<DeviceId> {
        self.shared.device_id.read().await.clone()
    }

    /// Save `device_id` and (re)start the background notification task.
    /// Returns without waiting for the connection.
    pub async fn connect_notification(&self, device_id: DeviceId) {
        *self.shared.device_id.write().await = Some(device_id.clone());

        let mut task = self.task.lock().await;
        if let Some(old) = task.take() {
            old.abort();
            // the old loop must be gone before its writer and state are cleared
            let _ = old.await;
            self.shared.reset().await;
        }

        info!("Starting notification session for {}", device_id);
        let span = info_span!(CONNECTION_SPAN, device_id = device_id.as_str());
        *task = Some(tokio::spawn(
            run_notification_loop(self.shared.clone(), self.config.clone(), device_id)
                .instrument(span),
        ));
    }

    /// Stop the background task and close the notification socket
    pub async fn close(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        self.shared.reset().await;
        info!("Client closed");
    }

    /// Write one frame on the notification socket
    pub async fn send_frame(&self, typ: impl Into<u8>, payload: &[u8]) -> Result<(), ClientError> {
        let mut writer = self.shared.writer.lock().await;
        let stream = writer.as_mut().ok_or(ClientError::NotConnected)?;
        if let Err(e) = write_frame(stream, typ.into(), payload).await {
            *writer = None;
            return Err(e.into());
        }
        Ok(())
    }

    /// Write one `MSG_SOCKET` frame
    pub async fn send_message(&self, payload: &[u8]) -> Result<(), ClientError> {
        self.send_frame(MsgType::Socket, payload).await
    }

    /// Write one `MSG_SOCKET` frame and return the next `MSG_SOCKET` frame
    /// the server sends. Calls are serialized.
    pub async fn send_and_wait(&self, payload: &[u8]) -> Result<Frame, ClientError> {
        let _exchange = self.shared.exchange.lock().await;

        let (tx, rx) = oneshot::channel();
        *self.shared.pending.lock().await = Some(tx);

        if let Err(e) = self.send_message(payload).await {
            self.shared.pending.lock().await.take();
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.shared.pending.lock().await.take();
                Err(ClientError::Timeout(self.config.request_timeout))
            }
        }
    }

    async fn open_api(&self) -> Result<TcpStream, ClientError> {
        let addr = self.config.api_addr();
        connect_tcp(addr.as_str(), self.config.connect_timeout)
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.clone(),
                source,
            })
    }

    /// One API round trip on a fresh connection
    pub async fn request(&self, request: &ApiRequest) -> Result<ApiResponse, ClientError> {
        let mut stream = self.open_api().await?;
        write_request(&mut stream, request).await?;

        let response = tokio::time::timeout(
            self.config.request_timeout,
            read_response(&mut stream, self.config.max_api_payload),
        )
        .await
        .map_err(|_| ClientError::Timeout(self.config.request_timeout))??;

        debug!(
            "{} -> {} status {} ({} bytes)",
            describe(request.typ),
            describe(response.typ),
            response.status,
            response.body.len()
        );
        Ok(response)
    }

    /// Send a JSON request
    pub async fn call<T: Serialize + ?Sized>(
        &self,
        typ: MsgType,
        payload: &T,
    ) -> Result<ApiResponse, ClientError> {
        let request = ApiRequest::new(typ, serde_json::to_vec(payload).map_err(WireError::from)?);
        self.request(&request).await
    }

    async fn call_ok<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        typ: MsgType,
        payload: &T,
    ) -> Result<R, ClientError> {
        let response = ensure_success(self.call(typ, payload).await?)?;
        Ok(response.parse()?)
    }

    /// Send a request that the server acknowledges by closing. A clean close
    /// yields `None`; a response, if the server sends one, is returned.
    pub async fn request_one_way(&self, request: &ApiRequest) -> Result<Option<ApiResponse>, ClientError> {
        let mut stream = self.open_api().await?;
        write_request(&mut stream, request).await?;

        let read = tokio::time::timeout(
            self.config.request_timeout,
            read_response(&mut stream, self.config.max_api_payload),
        )
        .await
        .map_err(|_| ClientError::Timeout(self.config.request_timeout))?;

        match read {
            Ok(response) => Ok(Some(response)),
            Err(e) if e.is_disconnect() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Device login; the saved device identifier is included when present
    pub async fn login(&self, username: &str, password: &str) -> Result<ApiResponse, ClientError> {
        let device_id = self.device_id().await;
        let payload = LoginPayload {
            username,
            password,
            device_id: device_id.as_ref().map(DeviceId::as_str),
        };
        self.call(MsgType::LoginReq, &payload).await
    }

    /// Admin console login
    pub async fn admin_login(&self, username: &str, password: &str) -> Result<ApiResponse, ClientError> {
        let payload = LoginPayload {
            username,
            password,
            device_id: None,
        };
        self.call(MsgType::AdminLoginReq, &payload).await
    }

    /// Register device details
    pub async fn register_device<T: Serialize + ?Sized>(&self, info: &T) -> Result<ApiResponse, ClientError> {
        self.call(MsgType::DeviceReq, info).await
    }

    /// Identifiers currently online, newest first
    pub async fn get_online_users(&self) -> Result<Vec<String>, ClientError> {
        let response = ensure_success(self.request(&ApiRequest::new(MsgType::ListReq, Bytes::new())).await?)?;
        let list: UserList = response.parse()?;
        Ok(list.users)
    }

    /// Ask a device to upload its last `line_count` log lines
    pub async fn admin_get_logs(&self, target_device_id: &str, line_count: u32) -> Result<ApiResponse, ClientError> {
        let payload = serde_json::json!({
            "target_device_id": target_device_id,
            "line_count": line_count,
        });
        self.call(MsgType::AdminGetLogsReq, &payload).await
    }

    /// Read logs stored on the server for a device
    pub async fn admin_view_logs(&self, target_device_id: &str) -> Result<ApiResponse, ClientError> {
        let payload = serde_json::json!({ "target_device_id": target_device_id });
        self.call(MsgType::AdminGetStoredLogsReq, &payload).await
    }

    /// Page through a device's command history
    pub async fn admin_get_history(
        &self,
        target_device_id: &str,
        page: u32,
        size: u32,
    ) -> Result<ApiResponse, ClientError> {
        let payload = serde_json::json!({
            "target_device_id": target_device_id,
            "page": page,
            "size": size,
        });
        self.call(MsgType::AdminGetCommandHistoryReq, &payload).await
    }

    /// Upload requested logs (raw payload)
    pub async fn upload_logs(&self, logs: impl Into<Bytes>) -> Result<ApiResponse, ClientError> {
        self.request(&ApiRequest::new(MsgType::ClientGetLogReq, logs)).await
    }

    /// Fetch this device's firewall policy
    pub async fn get_firewall_config<T: Serialize + ?Sized>(&self, query: &T) -> Result<ApiResponse, ClientError> {
        self.call(MsgType::ClientGetFirewallConfigReq, query).await
    }

    /// Change a device's firewall policy
    pub async fn admin_firewall_control(
        &self,
        target_device_id: &str,
        enable: bool,
        categories: &[String],
    ) -> Result<ApiResponse, ClientError> {
        let payload = serde_json::json!({
            "target_device_id": target_device_id,
            "enable": enable,
            "categories": categories,
        });
        self.call(MsgType::AdminFirewallControlReq, &payload).await
    }

    /// Report file changes
    pub async fn file_sync<T: Serialize + ?Sized>(&self, changes: &T) -> Result<ApiResponse, ClientError> {
        self.call(MsgType::ClientFileSyncReq, changes).await
    }

    /// Browse a device's file tree
    pub async fn admin_get_file_tree<T: Serialize + ?Sized>(&self, query: &T) -> Result<ApiResponse, ClientError> {
        self.call(MsgType::AdminGetFileTreeReq, query).await
    }

    /// Ask the server to push a restore command to a device
    pub async fn admin_restore(&self, request: &AdminRestoreRequest) -> Result<AdminRestoreResponse, ClientError> {
        self.call_ok(MsgType::AdminRestoreReq, request).await
    }

    /// Open a backup transfer
    pub async fn backup_init(&self, request: &BackupInitRequest) -> Result<ApiResponse, ClientError> {
        self.call(MsgType::BackupInitReq, request).await
    }

    /// Upload one backup chunk
    pub async fn backup_chunk(&self, request: &BackupChunkRequest) -> Result<ApiResponse, ClientError> {
        self.call(MsgType::BackupChunkReq, request).await
    }

    /// Close a backup transfer
    pub async fn backup_finish(&self, request: &BackupFinishRequest) -> Result<ApiResponse, ClientError> {
        self.call(MsgType::BackupFinishReq, request).await
    }

    /// Abandon a backup transfer; the server normally closes without answering
    pub async fn backup_cancel(&self, request: &CancelRequest) -> Result<Option<ApiResponse>, ClientError> {
        let payload = serde_json::to_vec(request).map_err(WireError::from)?;
        self.request_one_way(&ApiRequest::new(MsgType::BackupCancelReq, payload))
            .await
    }

    /// Look up an interrupted backup
    pub async fn backup_resume(&self, request: &BackupResumeRequest) -> Result<ApiResponse, ClientError> {
        self.call(MsgType::BackupResumeReq, request).await
    }

    /// Open a restore transfer
    pub async fn restore_init(&self, request: &RestoreInitRequest) -> Result<ApiResponse, ClientError> {
        self.call(MsgType::RestoreInitReq, request).await
    }

    /// Download one restore chunk
    pub async fn restore_chunk(&self, request: &RestoreChunkRequest) -> Result<ApiResponse, ClientError> {
        self.call(MsgType::RestoreChunkReq, request).await
    }

    /// Close a restore transfer
    pub async fn restore_finish(&self, request: &RestoreFinishRequest) -> Result<ApiResponse, ClientError> {
        self.call(MsgType::RestoreFinishReq, request).await
    }

    /// Reattach to a restore transfer
    pub async fn restore_resume(&self, request: &RestoreResumeRequest) -> Result<ApiResponse, ClientError> {
        self.call(MsgType::RestoreResumeReq, request).await
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.try_lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

/// Turn a non-200 response into [`ClientError::Status`]
pub fn ensure_success(response: ApiResponse) -> Result<ApiResponse, ClientError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(ClientError::Status {
            status: response.status,
            body: response.text(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{GuardServer, ServerConfig};
    use guard_wire::encode_frame;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    const STEP: Duration = Duration::from_secs(5);

    fn fast_config(notify_port: u16, api_port: u16) -> ClientConfig {
        ClientConfig {
            notify_port,
            api_port,
            reconnect_backoff: Duration::from_millis(50),
            request_timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        }
    }

    async fn wait_connected(client: &ClientSession) {
        let mut state = client.subscribe_state();
        tokio::time::timeout(STEP, state.wait_for(|s| *s == ConnectionState::Connected))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_after_two_failed_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepts = Arc::new(AtomicUsize::new(0));

        let counter = accepts.clone();
        let server = tokio::spawn(async move {
            // the first two connections are dropped right after accept
            for _ in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }

            let (mut stream, _) = listener.accept().await.unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            let mut decoder = FrameDecoder::new();
            let mut buffer = BytesMut::new();

            let id = read_frame(&mut stream, &mut decoder, &mut buffer).await.unwrap();
            assert_eq!(id.text(), "dev-r");
            write_frame(&mut stream, 0x01, b"Hello dev-r from server handler\n")
                .await
                .unwrap();

            let ping = read_frame(&mut stream, &mut decoder, &mut buffer).await.unwrap();
            assert_eq!(ping.text(), "ping");
            // a server command arriving first must not satisfy the wait
            let mut burst = BytesMut::new();
            burst.extend_from_slice(&encode_frame(MsgType::ServerGetLogCmd.code(), b"{}").unwrap());
            burst.extend_from_slice(&encode_frame(0x01, b"pong").unwrap());
            stream.write_all(&burst).await.unwrap();

            // hold the connection until the client goes away
            let _ = read_frame(&mut stream, &mut decoder, &mut buffer).await;
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = ClientSession::new(fast_config(port, 1)).with_callback(move |frame: Frame| {
            let _ = tx.send(frame);
        });
        assert_eq!(client.state(), ConnectionState::Disconnected);

        client
            .connect_notification(DeviceId::new("dev-r").unwrap())
            .await;
        wait_connected(&client).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 3);

        let greeting = tokio::time::timeout(STEP, rx.recv()).await.unwrap().unwrap();
        assert!(greeting.text().starts_with("Hello dev-r"));

        let reply = client.send_and_wait(b"ping").await.unwrap();
        assert_eq!(reply.text(), "pong");

        let command = tokio::time::timeout(STEP, rx.recv()).await.unwrap().unwrap();
        assert_eq!(command.typ, MsgType::ServerGetLogCmd.code());

        client.close().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        tokio::time::timeout(STEP, server).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_login_and_list_against_server() {
        let server = GuardServer::new(ServerConfig::loopback()).start().await.unwrap();
        let client = ClientSession::new(fast_config(
            server.notify_addr().port(),
            server.api_addr().port(),
        ));

        client
            .connect_notification(DeviceId::new("dev-1").unwrap())
            .await;
        wait_connected(&client).await;

        let login = client.login("admin", "admin").await.unwrap();
        assert!(login.is_success());
        let denied = client.login("admin", "wrong").await.unwrap();
        assert_eq!(denied.status, 401);

        assert_eq!(client.get_online_users().await.unwrap(), vec!["dev-1"]);

        let echoed = client.send_and_wait(b"hello").await.unwrap();
        assert_eq!(echoed.text(), "hello");

        client.close().await;
        let registry = server.registry();
        tokio::time::timeout(STEP, async {
            while !registry.is_empty().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_while_connected_stays_closed() {
        let server = GuardServer::new(ServerConfig::loopback()).start().await.unwrap();
        let client = ClientSession::new(fast_config(
            server.notify_addr().port(),
            server.api_addr().port(),
        ));

        for round in 0..5 {
            client
                .connect_notification(DeviceId::new(format!("dev-c{}", round)).unwrap())
                .await;
            // restarting mid-handshake must not leave the old loop behind
            client
                .connect_notification(DeviceId::new("dev-c").unwrap())
                .await;
            wait_connected(&client).await;

            client.close().await;
            assert_eq!(client.state(), ConnectionState::Disconnected);
            assert!(matches!(
                client.send_message(b"late").await,
                Err(ClientError::NotConnected)
            ));

            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(client.state(), ConnectionState::Disconnected);
            assert!(matches!(
                client.send_message(b"late").await,
                Err(ClientError::NotConnected)
            ));
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn test_api_timeout_and_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(3)).await;
            drop(stream);
        });

        let mut config = fast_config(1, port);
        config.request_timeout = Duration::from_millis(200);
        let client = ClientSession::new(config);
        let err = client.get_online_users().await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
        silent.abort();

        let err = client.send_message(b"x").await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }
}
