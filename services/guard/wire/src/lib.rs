//! Wire protocol for sagiri-guard devices and servers.
//!
//! Two TCP channels share one message type registry:
//!
//! - the **notification** channel is long-lived and carries small frames in
//!   both directions (device identifier, greetings, server commands);
//! - the **API** channel is one request and one response per connection, with
//!   an extended header for payloads above 64 KiB.
//!
//! ## Wire Format
//!
//! ```text
//! notification frame   | type u8 | len u16 BE | payload |
//! API request          | type u8 | len u16 BE | payload |
//!                      | 0xFE | type u8 | len u32 BE | payload |
//! API response         | type u8 | len u16 BE | status u16 BE | body |
//!                      | 0xFE | type u8 | len u32 BE | status u16 BE | body |
//! ```

#![warn(clippy::all)]

pub mod api;
pub mod error;
pub mod frame;
pub mod identity;
pub mod msg_type;
pub mod transfer;

// Re-export main types
pub use api::{
    encode_request, encode_response, read_body, read_request, read_request_header,
    read_response, read_response_header, write_request, write_response, ApiRequest, ApiResponse,
    HeaderShape, RequestHeader, ResponseHeader, DEFAULT_MAX_API_PAYLOAD, DRAIN_CHUNK, EXT_MAGIC,
    STANDARD_MAX_LEN, STATUS_BAD_REQUEST, STATUS_INTERNAL_ERROR, STATUS_OK, STATUS_UNAUTHORIZED,
};
pub use error::WireError;
pub use frame::{
    encode_frame, read_frame, write_frame, Frame, FrameDecoder, DEFAULT_FRAME_BUFFER_SIZE,
    FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD,
};
pub use identity::{DeviceId, ADMIN_CONSOLE_ID, MAX_DEVICE_ID_LEN};
pub use msg_type::{describe, MsgKind, MsgType};
pub use transfer::{TransferDirection, TransferOp, TransferPhase, TransferSequence};
