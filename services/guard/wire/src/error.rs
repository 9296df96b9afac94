//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Peer closed the connection before a complete unit was read
    #[error("connection closed")]
    Closed,

    /// Underlying socket error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload does not fit the length field or the configured cap
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Unknown message type code
    #[error("unknown type 0x{0:02X}")]
    Type(u8),

    /// Device identifier is empty or longer than 63 bytes
    #[error("invalid device id: {0}")]
    DeviceId(String),

    /// Payload could not be (de)serialized as JSON
    #[error("json payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Chunk data is not valid hex
    #[error("chunk data: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Transfer operation issued out of order
    #[error("{op} not allowed while transfer is {phase}")]
    Sequence {
        /// Operation attempted
        op: &'static str,
        /// Phase the transfer was in
        phase: &'static str,
    },
}

impl WireError {
    /// True when the error means the peer went away (EOF or socket failure)
    pub fn is_disconnect(&self) -> bool {
        matches!(self, WireError::Closed | WireError::Io(_))
    }
}
