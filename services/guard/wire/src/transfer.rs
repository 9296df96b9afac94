//! Backup and restore transfer messages.
//!
//! Each operation is one API round trip carrying a JSON payload. The server
//! keeps transfer state keyed by the opaque `transfer_id`; the client side can
//! use [`TransferSequence`] to keep its calls in a legal order:
//!
//! ```text
//! Idle --init/resume--> Streaming --chunk--> Streaming --finish--> Finished
//!                           |  ^                  |
//!                           |  +-----resume-------+
//!                           +--cancel (backup)--> Cancelled
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::msg_type::MsgType;
use crate::WireError;

/// Transfer operations and their codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferOp {
    /// Admin asks the server to push a restore command to a device
    AdminRestore,
    /// Open a backup transfer
    BackupInit,
    /// Upload one chunk
    BackupChunk,
    /// Close a backup transfer
    BackupFinish,
    /// Abandon a backup transfer
    BackupCancel,
    /// Look up an interrupted backup
    BackupResume,
    /// Open a restore transfer
    RestoreInit,
    /// Download one chunk
    RestoreChunk,
    /// Close a restore transfer
    RestoreFinish,
    /// Reattach to a restore transfer
    RestoreResume,
}

/// Which way file data flows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Device to server
    Backup,
    /// Server to device
    Restore,
}

impl TransferOp {
    /// Request code
    pub fn request(self) -> MsgType {
        match self {
            TransferOp::AdminRestore => MsgType::AdminRestoreReq,
            TransferOp::BackupInit => MsgType::BackupInitReq,
            TransferOp::BackupChunk => MsgType::BackupChunkReq,
            TransferOp::BackupFinish => MsgType::BackupFinishReq,
            TransferOp::BackupCancel => MsgType::BackupCancelReq,
            TransferOp::BackupResume => MsgType::BackupResumeReq,
            TransferOp::RestoreInit => MsgType::RestoreInitReq,
            TransferOp::RestoreChunk => MsgType::RestoreChunkReq,
            TransferOp::RestoreFinish => MsgType::RestoreFinishReq,
            TransferOp::RestoreResume => MsgType::RestoreResumeReq,
        }
    }

    /// Response code; `None` for backup cancel, which is never answered
    pub fn response(self) -> Option<MsgType> {
        self.request().response()
    }

    /// Direction, `None` for the admin trigger
    pub fn direction(self) -> Option<TransferDirection> {
        match self {
            TransferOp::AdminRestore => None,
            TransferOp::BackupInit
            | TransferOp::BackupChunk
            | TransferOp::BackupFinish
            | TransferOp::BackupCancel
            | TransferOp::BackupResume => Some(TransferDirection::Backup),
            _ => Some(TransferDirection::Restore),
        }
    }

    /// Operation for a request code
    pub fn from_request(typ: MsgType) -> Option<Self> {
        Some(match typ {
            MsgType::AdminRestoreReq => TransferOp::AdminRestore,
            MsgType::BackupInitReq => TransferOp::BackupInit,
            MsgType::BackupChunkReq => TransferOp::BackupChunk,
            MsgType::BackupFinishReq => TransferOp::BackupFinish,
            MsgType::BackupCancelReq => TransferOp::BackupCancel,
            MsgType::BackupResumeReq => TransferOp::BackupResume,
            MsgType::RestoreInitReq => TransferOp::RestoreInit,
            MsgType::RestoreChunkReq => TransferOp::RestoreChunk,
            MsgType::RestoreFinishReq => TransferOp::RestoreFinish,
            MsgType::RestoreResumeReq => TransferOp::RestoreResume,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            TransferOp::AdminRestore => "admin restore",
            TransferOp::BackupInit => "backup init",
            TransferOp::BackupChunk => "backup chunk",
            TransferOp::BackupFinish => "backup finish",
            TransferOp::BackupCancel => "backup cancel",
            TransferOp::BackupResume => "backup resume",
            TransferOp::RestoreInit => "restore init",
            TransferOp::RestoreChunk => "restore chunk",
            TransferOp::RestoreFinish => "restore finish",
            TransferOp::RestoreResume => "restore resume",
        }
    }
}

impl fmt::Display for TransferOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Position of a transfer in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    /// Nothing opened yet
    Idle,
    /// Init or resume accepted, chunks flowing
    Streaming,
    /// Finish acknowledged
    Finished,
    /// Cancel sent
    Cancelled,
}

impl TransferPhase {
    fn name(self) -> &'static str {
        match self {
            TransferPhase::Idle => "idle",
            TransferPhase::Streaming => "streaming",
            TransferPhase::Finished => "finished",
            TransferPhase::Cancelled => "cancelled",
        }
    }
}

/// Client-side ordering check for one transfer
#[derive(Debug, Clone)]
pub struct TransferSequence {
    direction: TransferDirection,
    phase: TransferPhase,
    transfer_id: Option<String>,
    offset: u64,
}

impl TransferSequence {
    /// Fresh sequence
    pub fn new(direction: TransferDirection) -> Self {
        Self {
            direction,
            phase: TransferPhase::Idle,
            transfer_id: None,
            offset: 0,
        }
    }

    /// Current phase
    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    /// Transfer id assigned by the server, once known
    pub fn transfer_id(&self) -> Option<&str> {
        self.transfer_id.as_deref()
    }

    /// Bytes confirmed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether `op` is legal in the current phase
    pub fn check(&self, op: TransferOp) -> Result<TransferPhase, WireError> {
        self.next_phase(op).ok_or(WireError::Sequence {
            op: op.name(),
            phase: self.phase.name(),
        })
    }

    /// Validate `op` against the current phase and move to the next one
    pub fn advance(&mut self, op: TransferOp) -> Result<(), WireError> {
        self.phase = self.check(op)?;
        Ok(())
    }

    fn next_phase(&self, op: TransferOp) -> Option<TransferPhase> {
        if op.direction() != Some(self.direction) {
            return None;
        }

        use TransferOp::*;
        use TransferPhase::*;
        match (op, self.phase) {
            (BackupInit | RestoreInit, Idle) => Some(Streaming),
            (BackupResume | RestoreResume, Idle | Streaming) => Some(Streaming),
            (BackupChunk | RestoreChunk, Streaming) => Some(Streaming),
            (BackupFinish | RestoreFinish, Streaming) => Some(Finished),
            (BackupCancel, Idle | Streaming) => Some(Cancelled),
            _ => None,
        }
    }

    /// Record the id and offset returned by init or resume
    pub fn attach(&mut self, transfer_id: impl Into<String>, offset: u64) {
        self.transfer_id = Some(transfer_id.into());
        self.offset = offset;
    }

    /// Record a confirmed chunk
    pub fn record_chunk(&mut self, len: u64) {
        self.offset += len;
    }
}

/// Hex-encode chunk data
pub fn encode_chunk_data(data: &[u8]) -> String {
    hex::encode(data)
}

/// Decode hex chunk data
pub fn decode_chunk_data(data: &str) -> Result<Vec<u8>, WireError> {
    Ok(hex::decode(data)?)
}

/// `MSG_BACKUP_INIT_REQ` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInitRequest {
    pub device_id: String,
    pub file_uuid: String,
    pub file_name: String,
    pub total_size: i64,
    pub head_hash: String,
}

/// `MSG_BACKUP_INIT_RESP` body (the stored session)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupInitResponse {
    pub transfer_id: String,
    pub device_id: String,
    pub file_uuid: String,
    pub file_name: String,
    pub version: i32,
    pub current_offset: i64,
    pub total_size: i64,
    pub status: String,
}

/// `MSG_BACKUP_CHUNK_REQ` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupChunkRequest {
    pub transfer_id: String,
    pub offset: i64,
    pub data_len: i64,
    /// Hex encoded bytes
    pub data: String,
}

impl BackupChunkRequest {
    /// Build a chunk from raw bytes
    pub fn from_bytes(transfer_id: impl Into<String>, offset: i64, data: &[u8]) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            offset,
            data_len: data.len() as i64,
            data: encode_chunk_data(data),
        }
    }
}

/// `MSG_BACKUP_FINISH_REQ` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFinishRequest {
    pub transfer_id: String,
    pub server_path: String,
    pub file_hash: String,
}

/// `MSG_BACKUP_RESUME_REQ` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupResumeRequest {
    pub device_id: String,
    pub file_uuid: String,
    pub head_hash: String,
    pub total_size: i64,
}

/// Outcome of a backup resume lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeStatus {
    /// Session found, continue from `offset`
    Found,
    /// No active session
    NotFound,
    /// Session exists but size or head hash differ
    Mismatch,
}

/// `MSG_BACKUP_RESUME_RESP` body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupResumeResponse {
    #[serde(default)]
    pub transfer_id: String,
    #[serde(default)]
    pub offset: i64,
    pub status: ResumeStatus,
}

/// `MSG_BACKUP_CANCEL_REQ` and `MSG_RESTORE_FINISH_REQ` / `MSG_RESTORE_RESUME_REQ` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferIdRequest {
    pub transfer_id: String,
}

/// Backup cancel payload
pub type CancelRequest = TransferIdRequest;
/// Restore finish payload
pub type RestoreFinishRequest = TransferIdRequest;
/// Restore resume payload
pub type RestoreResumeRequest = TransferIdRequest;

/// `MSG_ADMIN_RESTORE_REQ` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminRestoreRequest {
    pub device_id: String,
    pub file_uuid: String,
    pub version: i32,
}

/// `MSG_ADMIN_RESTORE_RESP` body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminRestoreResponse {
    pub status: String,
    pub message: String,
}

/// `MSG_SERVER_RESTORE_CMD` payload pushed to the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreCommand {
    /// Always `RESTORE_CMD`
    pub op: String,
    pub file_uuid: String,
    pub version: i32,
}

impl RestoreCommand {
    /// Command for one file version
    pub fn new(file_uuid: impl Into<String>, version: i32) -> Self {
        Self {
            op: "RESTORE_CMD".to_string(),
            file_uuid: file_uuid.into(),
            version,
        }
    }
}

/// `MSG_RESTORE_INIT_REQ` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreInitRequest {
    pub device_id: String,
    pub file_uuid: String,
    pub version: i32,
}

/// `MSG_RESTORE_INIT_RESP` and `MSG_RESTORE_RESUME_RESP` body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreInitResponse {
    pub transfer_id: String,
    pub file_name: String,
    pub total_size: i64,
    pub file_hash: String,
    pub status: String,
}

impl RestoreInitResponse {
    /// `status == "ok"`
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Restore resume body
pub type RestoreResumeResponse = RestoreInitResponse;

/// `MSG_RESTORE_CHUNK_REQ` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreChunkRequest {
    pub transfer_id: String,
    pub offset: i64,
    pub size: i32,
}

/// `MSG_RESTORE_CHUNK_RESP` body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreChunkResponse {
    /// Hex encoded bytes
    pub data: String,
    pub data_len: i32,
    pub status: String,
}

impl RestoreChunkResponse {
    /// Decoded chunk bytes
    pub fn bytes(&self) -> Result<Vec<u8>, WireError> {
        decode_chunk_data(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_codes() {
        assert_eq!(TransferOp::BackupInit.request().code(), 0xF1);
        assert_eq!(TransferOp::BackupInit.response().unwrap().code(), 0xF2);
        assert_eq!(TransferOp::BackupCancel.request().code(), 0xF7);
        assert_eq!(TransferOp::BackupCancel.response(), None);
        assert_eq!(TransferOp::RestoreResume.response().unwrap().code(), 0x7A);
        assert_eq!(
            TransferOp::from_request(MsgType::RestoreChunkReq),
            Some(TransferOp::RestoreChunk)
        );
        assert_eq!(TransferOp::from_request(MsgType::LoginReq), None);
    }

    #[test]
    fn test_backup_sequence() {
        let mut seq = TransferSequence::new(TransferDirection::Backup);
        assert!(seq.advance(TransferOp::BackupChunk).is_err());

        seq.advance(TransferOp::BackupInit).unwrap();
        seq.attach("t-1", 0);
        seq.advance(TransferOp::BackupChunk).unwrap();
        seq.record_chunk(4096);
        seq.advance(TransferOp::BackupResume).unwrap();
        seq.advance(TransferOp::BackupChunk).unwrap();
        seq.advance(TransferOp::BackupFinish).unwrap();

        assert_eq!(seq.phase(), TransferPhase::Finished);
        assert_eq!(seq.transfer_id(), Some("t-1"));
        assert_eq!(seq.offset(), 4096);

        let err = seq.advance(TransferOp::BackupChunk).unwrap_err();
        assert_eq!(err.to_string(), "backup chunk not allowed while transfer is finished");
    }

    #[test]
    fn test_restore_sequence_rejects_backup_ops() {
        let mut seq = TransferSequence::new(TransferDirection::Restore);
        assert!(seq.advance(TransferOp::BackupInit).is_err());
        assert!(seq.advance(TransferOp::AdminRestore).is_err());
        // restore has no cancel; resume can open a sequence directly
        seq.advance(TransferOp::RestoreResume).unwrap();
        assert!(seq.advance(TransferOp::BackupCancel).is_err());
        seq.advance(TransferOp::RestoreFinish).unwrap();
    }

    #[test]
    fn test_payload_shapes() {
        let chunk = BackupChunkRequest::from_bytes("t-9", 1024, &[0xde, 0xad]);
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["data"], "dead");
        assert_eq!(json["data_len"], 2);

        let resume: BackupResumeResponse =
            serde_json::from_str(r#"{"transfer_id":"","offset":0,"status":"not_found"}"#).unwrap();
        assert_eq!(resume.status, ResumeStatus::NotFound);

        let cmd = serde_json::to_string(&RestoreCommand::new("f-1", 3)).unwrap();
        assert_eq!(cmd, r#"{"op":"RESTORE_CMD","file_uuid":"f-1","version":3}"#);

        let chunk: RestoreChunkResponse =
            serde_json::from_str(r#"{"data":"6869","data_len":2,"status":"ok"}"#).unwrap();
        assert_eq!(chunk.bytes().unwrap(), b"hi");
    }
}
