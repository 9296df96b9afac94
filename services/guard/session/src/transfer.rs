//! Ordered backup and restore transfers over [`ClientSession`].
//!
//! Each helper checks the next operation against a [`TransferSequence`]
//! before calling the server and only advances it once the call succeeded.

use guard_wire::transfer::{
    BackupChunkRequest, BackupFinishRequest, BackupInitRequest, BackupInitResponse,
    BackupResumeRequest, BackupResumeResponse, CancelRequest, RestoreChunkRequest,
    RestoreChunkResponse, RestoreFinishRequest, RestoreInitRequest, RestoreInitResponse,
    RestoreResumeRequest, ResumeStatus,
};
use guard_wire::{ApiResponse, TransferDirection, TransferOp, TransferSequence};
use tracing::{debug, info};

use crate::client::{ensure_success, ClientError, ClientSession};

/// Device-to-server file upload
pub struct BackupTransfer<'a> {
    client: &'a ClientSession,
    sequence: TransferSequence,
}

impl<'a> BackupTransfer<'a> {
    /// New, unopened transfer
    pub fn new(client: &'a ClientSession) -> Self {
        Self {
            client,
            sequence: TransferSequence::new(TransferDirection::Backup),
        }
    }

    /// Sequence state
    pub fn sequence(&self) -> &TransferSequence {
        &self.sequence
    }

    fn transfer_id(&self) -> Result<String, ClientError> {
        self.sequence
            .transfer_id()
            .map(str::to_string)
            .ok_or(ClientError::NoTransfer)
    }

    /// Open the transfer
    pub async fn init(&mut self, request: &BackupInitRequest) -> Result<BackupInitResponse, ClientError> {
        self.sequence.check(TransferOp::BackupInit)?;
        let response = ensure_success(self.client.backup_init(request).await?)?;
        let session: BackupInitResponse = response.parse()?;

        self.sequence.advance(TransferOp::BackupInit)?;
        self.sequence
            .attach(session.transfer_id.clone(), session.current_offset.max(0) as u64);
        info!(
            "Backup {} opened for {} at offset {}",
            session.transfer_id, request.file_name, session.current_offset
        );
        Ok(session)
    }

    /// Look up an interrupted transfer; on `found` the sequence continues
    /// from the server's offset
    pub async fn resume(&mut self, request: &BackupResumeRequest) -> Result<BackupResumeResponse, ClientError> {
        self.sequence.check(TransferOp::BackupResume)?;
        let response = ensure_success(self.client.backup_resume(request).await?)?;
        let resume: BackupResumeResponse = response.parse()?;

        if resume.status == ResumeStatus::Found {
            self.sequence.advance(TransferOp::BackupResume)?;
            self.sequence
                .attach(resume.transfer_id.clone(), resume.offset.max(0) as u64);
            info!("Backup {} resumes at offset {}", resume.transfer_id, resume.offset);
        }
        Ok(resume)
    }

    /// Upload the next chunk at the current offset
    pub async fn send_chunk(&mut self, data: &[u8]) -> Result<(), ClientError> {
        self.sequence.check(TransferOp::BackupChunk)?;
        let transfer_id = self.transfer_id()?;
        let request = BackupChunkRequest::from_bytes(transfer_id, self.sequence.offset() as i64, data);

        ensure_success(self.client.backup_chunk(&request).await?)?;
        self.sequence.advance(TransferOp::BackupChunk)?;
        self.sequence.record_chunk(data.len() as u64);
        debug!("Backup chunk accepted, offset now {}", self.sequence.offset());
        Ok(())
    }

    /// Close the transfer
    pub async fn finish(&mut self, server_path: &str, file_hash: &str) -> Result<ApiResponse, ClientError> {
        self.sequence.check(TransferOp::BackupFinish)?;
        let request = BackupFinishRequest {
            transfer_id: self.transfer_id()?,
            server_path: server_path.to_string(),
            file_hash: file_hash.to_string(),
        };

        let response = ensure_success(self.client.backup_finish(&request).await?)?;
        self.sequence.advance(TransferOp::BackupFinish)?;
        Ok(response)
    }

    /// Abandon the transfer
    pub async fn cancel(&mut self) -> Result<(), ClientError> {
        self.sequence.check(TransferOp::BackupCancel)?;
        if let Some(transfer_id) = self.sequence.transfer_id() {
            let request = CancelRequest {
                transfer_id: transfer_id.to_string(),
            };
            if let Some(response) = self.client.backup_cancel(&request).await? {
                ensure_success(response)?;
            }
        }
        self.sequence.advance(TransferOp::BackupCancel)?;
        Ok(())
    }
}

/// Server-to-device file download
pub struct RestoreTransfer<'a> {
    client: &'a ClientSession,
    sequence: TransferSequence,
    total_size: u64,
}

impl<'a> RestoreTransfer<'a> {
    /// New, unopened transfer
    pub fn new(client: &'a ClientSession) -> Self {
        Self {
            client,
            sequence: TransferSequence::new(TransferDirection::Restore),
            total_size: 0,
        }
    }

    /// Sequence state
    pub fn sequence(&self) -> &TransferSequence {
        &self.sequence
    }

    /// Size announced by init/resume
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Whether every byte has been fetched
    pub fn is_complete(&self) -> bool {
        self.sequence.transfer_id().is_some() && self.sequence.offset() >= self.total_size
    }

    fn opened(&mut self, op: TransferOp, response: ApiResponse) -> Result<RestoreInitResponse, ClientError> {
        let session: RestoreInitResponse = ensure_success(response)?.parse()?;
        if !session.is_ok() {
            return Err(ClientError::Status {
                status: 200,
                body: format!("restore status {}", session.status),
            });
        }

        self.sequence.advance(op)?;
        let offset = self.sequence.offset();
        self.sequence.attach(session.transfer_id.clone(), offset);
        self.total_size = session.total_size.max(0) as u64;
        Ok(session)
    }

    /// Open a restore of one file version
    pub async fn init(&mut self, request: &RestoreInitRequest) -> Result<RestoreInitResponse, ClientError> {
        self.sequence.check(TransferOp::RestoreInit)?;
        let response = self.client.restore_init(request).await?;
        let session = self.opened(TransferOp::RestoreInit, response)?;
        info!(
            "Restore {} opened: {} ({} bytes)",
            session.transfer_id, session.file_name, session.total_size
        );
        Ok(session)
    }

    /// Reattach to a transfer, keeping the local offset
    pub async fn resume(&mut self, transfer_id: &str) -> Result<RestoreInitResponse, ClientError> {
        self.sequence.check(TransferOp::RestoreResume)?;
        let request = RestoreResumeRequest {
            transfer_id: transfer_id.to_string(),
        };
        let response = self.client.restore_resume(&request).await?;
        self.opened(TransferOp::RestoreResume, response)
    }

    /// Fetch up to `size` bytes at the current offset
    pub async fn next_chunk(&mut self, size: i32) -> Result<Vec<u8>, ClientError> {
        self.sequence.check(TransferOp::RestoreChunk)?;
        let request = RestoreChunkRequest {
            transfer_id: self
                .sequence
                .transfer_id()
                .map(str::to_string)
                .ok_or(ClientError::NoTransfer)?,
            offset: self.sequence.offset() as i64,
            size,
        };

        let chunk: RestoreChunkResponse =
            ensure_success(self.client.restore_chunk(&request).await?)?.parse()?;
        let data = chunk.bytes()?;

        self.sequence.advance(TransferOp::RestoreChunk)?;
        self.sequence.record_chunk(data.len() as u64);
        Ok(data)
    }

    /// Close the transfer
    pub async fn finish(&mut self) -> Result<ApiResponse, ClientError> {
        self.sequence.check(TransferOp::RestoreFinish)?;
        let request = RestoreFinishRequest {
            transfer_id: self
                .sequence
                .transfer_id()
                .map(str::to_string)
                .ok_or(ClientError::NoTransfer)?,
        };

        let response = ensure_success(self.client.restore_finish(&request).await?)?;
        self.sequence.advance(TransferOp::RestoreFinish)?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_server::{handler_fn, Responder};
    use crate::client::ClientConfig;
    use crate::events::RequestHandler;
    use crate::router::RequestRouter;
    use crate::server::{GuardServer, ServerConfig, ServerHandle};
    use async_trait::async_trait;
    use guard_wire::transfer::{decode_chunk_data, encode_chunk_data};
    use guard_wire::{ApiRequest, MsgType, TransferPhase, WireError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct SilentCancel(Arc<AtomicUsize>);

    #[async_trait]
    impl RequestHandler for SilentCancel {
        async fn handle(&self, _request: ApiRequest, responder: Responder) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            responder.close().await;
            Ok(())
        }
    }

    fn ok(typ: MsgType, body: serde_json::Value) -> anyhow::Result<ApiResponse> {
        Ok(ApiResponse::new(typ, 200, body.to_string()))
    }

    async fn start(router: RequestRouter) -> (ServerHandle, ClientSession) {
        let server = GuardServer::new(ServerConfig::loopback())
            .with_request_handler(Arc::new(router))
            .start()
            .await
            .unwrap();
        let client = ClientSession::new(ClientConfig {
            notify_port: server.notify_addr().port(),
            api_port: server.api_addr().port(),
            ..ClientConfig::default()
        });
        (server, client)
    }

    #[tokio::test]
    async fn test_backup_flow_and_silent_cancel() {
        let received = Arc::new(AtomicUsize::new(0));
        let chunks = received.clone();
        let cancels = Arc::new(AtomicUsize::new(0));

        let router = RequestRouter::new()
            .route(
                MsgType::BackupInitReq,
                handler_fn(|_req| async {
                    ok(
                        MsgType::BackupInitResp,
                        serde_json::json!({"transfer_id": "t-1", "current_offset": 0}),
                    )
                }),
            )
            .route(
                MsgType::BackupChunkReq,
                handler_fn(move |req: ApiRequest| {
                    let chunks = chunks.clone();
                    async move {
                        let chunk: BackupChunkRequest = req.parse()?;
                        assert_eq!(decode_chunk_data(&chunk.data)?.len() as i64, chunk.data_len);
                        chunks.fetch_add(1, Ordering::SeqCst);
                        ok(MsgType::BackupChunkResp, serde_json::json!({"status": "chunk_received"}))
                    }
                }),
            )
            .route(
                MsgType::BackupFinishReq,
                handler_fn(|_req| async {
                    ok(MsgType::BackupFinishResp, serde_json::json!({"status": "backup_done"}))
                }),
            )
            .route(MsgType::BackupCancelReq, SilentCancel(cancels.clone()));
        let (server, client) = start(router).await;

        let mut backup = BackupTransfer::new(&client);
        assert!(matches!(
            backup.send_chunk(b"early").await,
            Err(ClientError::Wire(WireError::Sequence { .. }))
        ));

        let init = BackupInitRequest {
            device_id: "dev-1".into(),
            file_uuid: "f-1".into(),
            file_name: "report.pdf".into(),
            total_size: 8,
            head_hash: "abc".into(),
        };
        assert_eq!(backup.init(&init).await.unwrap().transfer_id, "t-1");
        backup.send_chunk(b"0123").await.unwrap();
        backup.send_chunk(b"4567").await.unwrap();
        assert_eq!(backup.sequence().offset(), 8);
        backup.finish("/srv/backups/report.pdf", "ffff").await.unwrap();
        assert_eq!(backup.sequence().phase(), TransferPhase::Finished);
        assert_eq!(received.load(Ordering::SeqCst), 2);

        let mut abandoned = BackupTransfer::new(&client);
        abandoned.init(&init).await.unwrap();
        abandoned.cancel().await.unwrap();
        assert_eq!(abandoned.sequence().phase(), TransferPhase::Cancelled);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_restore_flow() {
        let content = b"restored bytes".to_vec();
        let served = content.clone();

        let router = RequestRouter::new()
            .route(
                MsgType::RestoreInitReq,
                handler_fn(|_req| async {
                    ok(
                        MsgType::RestoreInitResp,
                        serde_json::json!({
                            "transfer_id": "r-1",
                            "file_name": "notes.txt",
                            "total_size": 14,
                            "file_hash": "h",
                            "status": "ok"
                        }),
                    )
                }),
            )
            .route(
                MsgType::RestoreChunkReq,
                handler_fn(move |req: ApiRequest| {
                    let served = served.clone();
                    async move {
                        let chunk: RestoreChunkRequest = req.parse()?;
                        let start = chunk.offset as usize;
                        let end = (start + chunk.size as usize).min(served.len());
                        let data = &served[start..end];
                        ok(
                            MsgType::RestoreChunkResp,
                            serde_json::json!({
                                "data": encode_chunk_data(data),
                                "data_len": data.len(),
                                "status": "ok"
                            }),
                        )
                    }
                }),
            )
            .route(
                MsgType::RestoreFinishReq,
                handler_fn(|_req| async {
                    ok(MsgType::RestoreFinishResp, serde_json::json!({"status": "ok"}))
                }),
            );
        let (server, client) = start(router).await;

        let mut restore = RestoreTransfer::new(&client);
        restore
            .init(&RestoreInitRequest {
                device_id: "dev-1".into(),
                file_uuid: "f-1".into(),
                version: 2,
            })
            .await
            .unwrap();
        assert_eq!(restore.total_size(), 14);

        let mut out = Vec::new();
        while !restore.is_complete() {
            out.extend(restore.next_chunk(5).await.unwrap());
        }
        assert_eq!(out, content);
        restore.finish().await.unwrap();
        assert!(restore.finish().await.is_err());

        server.stop().await;
    }
}
