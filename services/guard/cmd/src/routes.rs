//! Request routes installed by `guard serve`.

use async_trait::async_trait;
use guard_session::{ConnectionRegistry, FallbackHandler, RequestHandler, RequestRouter, Responder};
use guard_wire::transfer::{AdminRestoreRequest, AdminRestoreResponse, RestoreCommand};
use guard_wire::{ApiRequest, MsgType, STATUS_BAD_REQUEST, STATUS_OK};
use std::sync::Arc;
use tracing::{info, warn};

/// Login and list go to the built-in fallback; admin restore pushes a
/// command to the target device.
pub fn build_router(registry: Arc<ConnectionRegistry>, fallback: FallbackHandler) -> RequestRouter {
    let fallback: Arc<dyn RequestHandler> = Arc::new(fallback);
    RequestRouter::new()
        .route_shared(MsgType::LoginReq, fallback.clone())
        .route_shared(MsgType::ListReq, fallback)
        .route(MsgType::AdminRestoreReq, AdminRestoreRoute { registry })
}

struct AdminRestoreRoute {
    registry: Arc<ConnectionRegistry>,
}

#[async_trait]
impl RequestHandler for AdminRestoreRoute {
    async fn handle(&self, request: ApiRequest, responder: Responder) -> anyhow::Result<()> {
        let restore: AdminRestoreRequest = match request.parse() {
            Ok(restore) => restore,
            Err(e) => {
                warn!(component = "routes", "Invalid admin restore payload: {}", e);
                let body = AdminRestoreResponse {
                    status: "error".into(),
                    message: "Invalid Payload".into(),
                };
                responder.reply_json(STATUS_BAD_REQUEST, &body).await?;
                return Ok(());
            }
        };

        let command = serde_json::to_vec(&RestoreCommand::new(&restore.file_uuid, restore.version))?;
        let delivered = self
            .registry
            .send_to_device(&restore.device_id, MsgType::ServerRestoreCmd, &command)
            .await;

        let body = if delivered {
            info!(
                component = "routes",
                "Restore of {} v{} sent to {}", restore.file_uuid, restore.version, restore.device_id
            );
            AdminRestoreResponse {
                status: "ok".into(),
                message: "Restore command sent to device".into(),
            }
        } else {
            AdminRestoreResponse {
                status: "error".into(),
                message: "Device Offline".into(),
            }
        };
        responder.reply_json(STATUS_OK, &body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guard_session::{ClientConfig, ClientSession, ConnectionState, GuardServer, ServerConfig};
    use guard_wire::{DeviceId, Frame};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_admin_restore_reaches_device() {
        let server = GuardServer::new(ServerConfig::loopback());
        let router = build_router(server.registry(), server.fallback_handler());
        let server = server
            .with_request_handler(Arc::new(router))
            .start()
            .await
            .unwrap();

        let config = ClientConfig {
            notify_port: server.notify_addr().port(),
            api_port: server.api_addr().port(),
            ..ClientConfig::default()
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        let device = ClientSession::new(config.clone()).with_callback(move |frame: Frame| {
            let _ = tx.send(frame);
        });
        let mut state = device.subscribe_state();
        device
            .connect_notification(DeviceId::new("laptop-01").unwrap())
            .await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while *state.borrow_and_update() != ConnectionState::Connected {
                state.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        let admin = ClientSession::new(config);
        let offline = admin
            .admin_restore(&AdminRestoreRequest {
                device_id: "nobody".into(),
                file_uuid: "f-1".into(),
                version: 1,
            })
            .await
            .unwrap();
        assert_eq!(offline.status, "error");

        let sent = admin
            .admin_restore(&AdminRestoreRequest {
                device_id: "laptop-01".into(),
                file_uuid: "f-1".into(),
                version: 3,
            })
            .await
            .unwrap();
        assert_eq!(sent.status, "ok");

        let command = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let frame = rx.recv().await.unwrap();
                if frame.typ == u8::from(MsgType::ServerRestoreCmd) {
                    break frame;
                }
            }
        })
        .await
        .unwrap();
        let command: RestoreCommand = serde_json::from_slice(&command.payload).unwrap();
        assert_eq!(command, RestoreCommand::new("f-1", 3));

        assert!(admin.login("admin", "admin").await.unwrap().is_success());

        device.close().await;
        server.stop().await;
    }
}
