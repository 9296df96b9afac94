//! One-shot API listener.
//!
//! Each accepted connection carries exactly one request. The installed
//! [`RequestHandler`] owns the response; without one the built-in
//! [`FallbackHandler`] answers login and list. Known response or command
//! codes sent as requests never reach the handler: their payload is drained
//! and they get a 400. The socket is always closed afterwards.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use guard_wire::{
    describe, read_body, read_request_header, write_response, ApiRequest, ApiResponse, MsgKind,
    MsgType, WireError, STATUS_BAD_REQUEST, STATUS_INTERNAL_ERROR, STATUS_OK,
    STATUS_UNAUTHORIZED,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::events::RequestHandler;
use crate::registry::ConnectionRegistry;

const UNKNOWN_REQUEST_BODY: &str = r#"{"error": "Unknown Request Type"}"#;

/// Write side of one API exchange
#[derive(Debug)]
pub struct Responder {
    stream: TcpStream,
    peer: SocketAddr,
    request_type: u8,
}

impl Responder {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr, request_type: u8) -> Self {
        Self {
            stream,
            peer,
            request_type,
        }
    }

    /// Caller address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Code of the request being answered
    pub fn request_type(&self) -> u8 {
        self.request_type
    }

    /// Response code paired with the request, 0 when there is none
    pub fn response_type(&self) -> u8 {
        MsgType::try_from(self.request_type)
            .ok()
            .and_then(MsgType::response)
            .map(MsgType::code)
            .unwrap_or(0)
    }

    /// Write `response` and close the connection
    pub async fn send(mut self, response: &ApiResponse) -> Result<(), WireError> {
        write_response(&mut self.stream, response).await?;
        debug!(
            "Answered {} from {} with {} ({} bytes)",
            describe(self.request_type),
            self.peer,
            response.status,
            response.body.len()
        );
        let _ = self.stream.shutdown().await;
        Ok(())
    }

    /// Answer with the paired response code
    pub async fn reply(self, status: u16, body: impl Into<Bytes>) -> Result<(), WireError> {
        let response = ApiResponse::new(self.response_type(), status, body);
        self.send(&response).await
    }

    /// Answer with a JSON body and the paired response code
    pub async fn reply_json<T: Serialize>(self, status: u16, value: &T) -> Result<(), WireError> {
        let body = serde_json::to_vec(value)?;
        self.reply(status, body).await
    }

    /// Close without answering
    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

#[derive(Debug, Deserialize)]
struct Credentials {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

/// Built-in login/list behavior used when no handler is installed.
///
/// Replies carry the paired response code (`MSG_LOGIN_RESP`, `MSG_LIST_RESP`)
/// and 0 for unknown requests; older peers tagged every fallback reply 0xA2.
#[derive(Debug, Clone)]
pub struct FallbackHandler {
    registry: Arc<ConnectionRegistry>,
    admin_username: String,
    admin_password: String,
}

impl FallbackHandler {
    /// Fallback over `registry` accepting one credential pair
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        admin_username: impl Into<String>,
        admin_password: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            admin_username: admin_username.into(),
            admin_password: admin_password.into(),
        }
    }

    /// Compute the response for a request
    pub async fn respond(&self, request: &ApiRequest) -> ApiResponse {
        match request.msg_type() {
            Ok(MsgType::LoginReq) => {
                let accepted = request
                    .parse::<Credentials>()
                    .map(|c| c.username == self.admin_username && c.password == self.admin_password)
                    .unwrap_or(false);
                if accepted {
                    info!("Login accepted");
                    ApiResponse::new(
                        MsgType::LoginResp,
                        STATUS_OK,
                        r#"{"message": "Login Successful"}"#,
                    )
                } else {
                    info!("Login rejected");
                    ApiResponse::new(
                        MsgType::LoginResp,
                        STATUS_UNAUTHORIZED,
                        r#"{"error": "Invalid Credentials"}"#,
                    )
                }
            }
            Ok(MsgType::ListReq) => {
                let users = self.registry.list().await;
                let body = serde_json::json!({ "users": users });
                ApiResponse::new(MsgType::ListResp, STATUS_OK, body.to_string())
            }
            _ => ApiResponse::new(0u8, STATUS_BAD_REQUEST, UNKNOWN_REQUEST_BODY),
        }
    }
}

#[async_trait]
impl RequestHandler for FallbackHandler {
    async fn handle(&self, request: ApiRequest, responder: Responder) -> anyhow::Result<()> {
        let response = self.respond(&request).await;
        responder.send(&response).await?;
        Ok(())
    }
}

/// Adapter turning an async closure into a [`RequestHandler`].
///
/// The closure's response is sent as-is; an error becomes a 500 with the
/// paired response code.
pub struct HandlerFn<F>(F);

/// Wrap an async closure as a request handler
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(ApiRequest) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<ApiResponse>> + Send,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> RequestHandler for HandlerFn<F>
where
    F: Fn(ApiRequest) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<ApiResponse>> + Send,
{
    async fn handle(&self, request: ApiRequest, responder: Responder) -> anyhow::Result<()> {
        match (self.0)(request).await {
            Ok(response) => responder.send(&response).await?,
            Err(e) => {
                warn!("Request handler failed: {:#}", e);
                let body = serde_json::json!({ "error": e.to_string() });
                responder.reply_json(STATUS_INTERNAL_ERROR, &body).await?;
            }
        }
        Ok(())
    }
}

pub(crate) struct ApiContext {
    pub request_handler: Option<Arc<dyn RequestHandler>>,
    pub fallback: FallbackHandler,
    pub request_timeout: Duration,
    pub max_api_payload: usize,
}

/// Accept API connections until shutdown is signalled
pub(crate) async fn run_api_listener(
    listener: TcpListener,
    ctx: Arc<ApiContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let local = listener.local_addr().ok();
    info!("API listener running on {:?}", local);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_api_connection(stream, peer, ctx).await {
                            warn!("API connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("Failed to accept API connection: {}", e),
            }
        }
    }

    info!("API listener on {:?} stopped", local);
}

enum Inbound {
    Request(ApiRequest),
    /// A known code that is never sent as a request; its payload was drained
    Rejected(u8),
}

/// Whether `typ` may open an API exchange. Unknown codes pass so the
/// handler decides.
fn accepts_request(typ: u8) -> bool {
    MsgType::try_from(typ)
        .map(|t| t.kind() == MsgKind::Request)
        .unwrap_or(true)
}

async fn read_inbound(stream: &mut TcpStream, max_payload: usize) -> Result<Inbound, WireError> {
    let header = read_request_header(stream).await?;
    let len = header.len as usize;
    if len > max_payload {
        warn!(
            "Refusing {} request of {} bytes (limit {})",
            describe(header.typ),
            len,
            max_payload
        );
        return Err(WireError::Size(len));
    }

    if !accepts_request(header.typ) {
        read_body(stream, len, None).await?;
        return Ok(Inbound::Rejected(header.typ));
    }

    let mut payload = BytesMut::with_capacity(len);
    read_body(stream, len, Some(&mut payload)).await?;
    Ok(Inbound::Request(ApiRequest {
        typ: header.typ,
        payload: payload.freeze(),
    }))
}

async fn handle_api_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ApiContext>,
) -> anyhow::Result<()> {
    let inbound = tokio::time::timeout(
        ctx.request_timeout,
        read_inbound(&mut stream, ctx.max_api_payload),
    )
    .await;
    let request = match inbound {
        Ok(Ok(Inbound::Request(request))) => request,
        Ok(Ok(Inbound::Rejected(typ))) => {
            warn!("API peer {} sent {} as a request", peer, describe(typ));
            Responder::new(stream, peer, typ)
                .send(&ApiResponse::new(0u8, STATUS_BAD_REQUEST, UNKNOWN_REQUEST_BODY))
                .await?;
            return Ok(());
        }
        Ok(Err(e)) if e.is_disconnect() => {
            debug!("API peer {} closed before a full request: {}", peer, e);
            return Ok(());
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            warn!("API peer {} sent no request within {:?}", peer, ctx.request_timeout);
            return Ok(());
        }
    };

    debug!(
        "API {} from {} ({} bytes)",
        describe(request.typ),
        peer,
        request.payload.len()
    );

    let responder = Responder::new(stream, peer, request.typ);
    match &ctx.request_handler {
        Some(handler) => handler.handle(request, responder).await,
        None => ctx.fallback.handle(request, responder).await,
    }
}
