//! Request routing by message type.

use async_trait::async_trait;
use guard_wire::{describe, ApiRequest, ApiResponse, STATUS_BAD_REQUEST};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::api_server::Responder;
use crate::events::RequestHandler;

/// Dispatches requests to per-type handlers.
///
/// Unrouted types get status 400 `{"error": "Route Not Found"}` with
/// response type 0.
#[derive(Default)]
pub struct RequestRouter {
    routes: HashMap<u8, Arc<dyn RequestHandler>>,
}

impl RequestRouter {
    /// Empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `typ` to `handler`, replacing any previous route
    pub fn route<H>(mut self, typ: impl Into<u8>, handler: H) -> Self
    where
        H: RequestHandler + 'static,
    {
        self.routes.insert(typ.into(), Arc::new(handler));
        self
    }

    /// Route `typ` to a shared handler
    pub fn route_shared(mut self, typ: impl Into<u8>, handler: Arc<dyn RequestHandler>) -> Self {
        self.routes.insert(typ.into(), handler);
        self
    }

    /// Whether `typ` has a route
    pub fn has_route(&self, typ: u8) -> bool {
        self.routes.contains_key(&typ)
    }
}

#[async_trait]
impl RequestHandler for RequestRouter {
    async fn handle(&self, request: ApiRequest, responder: Responder) -> anyhow::Result<()> {
        match self.routes.get(&request.typ) {
            Some(handler) => {
                debug!("Routing {}", describe(request.typ));
                handler.handle(request, responder).await
            }
            None => {
                warn!("No route for {}", describe(request.typ));
                let response =
                    ApiResponse::new(0u8, STATUS_BAD_REQUEST, r#"{"error": "Route Not Found"}"#);
                responder.send(&response).await?;
                Ok(())
            }
        }
    }
}
