//! API channel headers and one-shot request/response exchange.
//!
//! ```text
//! standard request   | type u8 | len u16 BE |
//! standard response  | type u8 | len u16 BE | status u16 BE |
//! extended request   | 0xFE | type u8 | len u32 BE |
//! extended response  | 0xFE | type u8 | len u32 BE | status u16 BE |
//! ```
//!
//! The standard shape is used iff the payload fits in 16 bits. Receivers read
//! exactly one byte first: `0xFE` selects the extended path, anything else is
//! the type of a standard header.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::msg_type::{describe, MsgType};
use crate::WireError;

/// First byte of an extended header
pub const EXT_MAGIC: u8 = 0xFE;

/// Largest payload carried by a standard header
pub const STANDARD_MAX_LEN: usize = u16::MAX as usize;

/// Success status
pub const STATUS_OK: u16 = 200;
/// Malformed or unroutable request
pub const STATUS_BAD_REQUEST: u16 = 400;
/// Rejected credentials
pub const STATUS_UNAUTHORIZED: u16 = 401;
/// Handler failure
pub const STATUS_INTERNAL_ERROR: u16 = 500;

/// Chunk size used when a body is read without a destination
pub const DRAIN_CHUNK: usize = 1024;

/// Default upper bound on an accepted payload
pub const DEFAULT_MAX_API_PAYLOAD: usize = 64 * 1024 * 1024;

/// Which header layout a payload length selects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderShape {
    /// `type + u16 len`
    Standard,
    /// `0xFE + type + u32 len`
    Extended,
}

impl HeaderShape {
    /// Shape required for a payload of `len` bytes
    pub fn for_len(len: usize) -> Self {
        if len <= STANDARD_MAX_LEN {
            HeaderShape::Standard
        } else {
            HeaderShape::Extended
        }
    }
}

/// Decoded request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Request type code
    pub typ: u8,
    /// Payload length
    pub len: u32,
}

impl RequestHeader {
    /// Layout this header is encoded with
    pub fn shape(&self) -> HeaderShape {
        HeaderShape::for_len(self.len as usize)
    }

    /// Append the encoded header
    pub fn encode(&self, buf: &mut BytesMut) {
        match self.shape() {
            HeaderShape::Standard => {
                buf.put_u8(self.typ);
                buf.put_u16(self.len as u16);
            }
            HeaderShape::Extended => {
                buf.put_u8(EXT_MAGIC);
                buf.put_u8(self.typ);
                buf.put_u32(self.len);
            }
        }
    }
}

/// Decoded response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Response type code
    pub typ: u8,
    /// Body length
    pub len: u32,
    /// Status code, 200 on success
    pub status: u16,
}

impl ResponseHeader {
    /// Layout this header is encoded with
    pub fn shape(&self) -> HeaderShape {
        HeaderShape::for_len(self.len as usize)
    }

    /// Append the encoded header
    pub fn encode(&self, buf: &mut BytesMut) {
        RequestHeader {
            typ: self.typ,
            len: self.len,
        }
        .encode(buf);
        buf.put_u16(self.status);
    }
}

fn checked_len(len: usize) -> Result<u32, WireError> {
    u32::try_from(len).map_err(|_| WireError::Size(len))
}

/// Encode a request header and payload
pub fn encode_request(typ: u8, payload: &[u8]) -> Result<Bytes, WireError> {
    let header = RequestHeader {
        typ,
        len: checked_len(payload.len())?,
    };
    let mut buf = BytesMut::with_capacity(6 + payload.len());
    header.encode(&mut buf);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Encode a response header and body
pub fn encode_response(typ: u8, status: u16, body: &[u8]) -> Result<Bytes, WireError> {
    let header = ResponseHeader {
        typ,
        len: checked_len(body.len())?,
        status,
    };
    let mut buf = BytesMut::with_capacity(8 + body.len());
    header.encode(&mut buf);
    buf.put_slice(body);
    Ok(buf.freeze())
}

fn eof_as_closed(err: std::io::Error) -> WireError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        WireError::Closed
    } else {
        WireError::Io(err)
    }
}

/// Read the type and length of a request, standard or extended
pub async fn read_request_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<RequestHeader, WireError> {
    let first = reader.read_u8().await.map_err(eof_as_closed)?;

    if first == EXT_MAGIC {
        let typ = reader.read_u8().await.map_err(eof_as_closed)?;
        let len = reader.read_u32().await.map_err(eof_as_closed)?;
        Ok(RequestHeader { typ, len })
    } else {
        let len = reader.read_u16().await.map_err(eof_as_closed)?;
        Ok(RequestHeader {
            typ: first,
            len: len as u32,
        })
    }
}

/// Read a response header, standard or extended
pub async fn read_response_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<ResponseHeader, WireError> {
    let RequestHeader { typ, len } = read_request_header(reader).await?;
    let status = reader.read_u16().await.map_err(eof_as_closed)?;
    Ok(ResponseHeader { typ, len, status })
}

/// Read exactly `len` body bytes.
///
/// With no destination the bytes are drained in [`DRAIN_CHUNK`] pieces so
/// the stream is left with nothing unread.
pub async fn read_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    len: usize,
    dst: Option<&mut BytesMut>,
) -> Result<(), WireError> {
    match dst {
        Some(dst) => {
            let start = dst.len();
            dst.resize(start + len, 0);
            reader
                .read_exact(&mut dst[start..])
                .await
                .map_err(eof_as_closed)?;
        }
        None => {
            let mut scratch = [0u8; DRAIN_CHUNK];
            let mut remaining = len;
            while remaining > 0 {
                let want = remaining.min(DRAIN_CHUNK);
                let n = reader.read(&mut scratch[..want]).await?;
                if n == 0 {
                    return Err(WireError::Closed);
                }
                remaining -= n;
            }
        }
    }
    Ok(())
}

/// One API request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    /// Request type code
    pub typ: u8,
    /// Raw payload
    pub payload: Bytes,
}

impl ApiRequest {
    /// Build a request
    pub fn new(typ: impl Into<u8>, payload: impl Into<Bytes>) -> Self {
        Self {
            typ: typ.into(),
            payload: payload.into(),
        }
    }

    /// Build a request with a JSON payload
    pub fn json<T: Serialize>(typ: impl Into<u8>, value: &T) -> Result<Self, WireError> {
        Ok(Self::new(typ, serde_json::to_vec(value)?))
    }

    /// Typed view of the code
    pub fn msg_type(&self) -> Result<MsgType, WireError> {
        MsgType::try_from(self.typ)
    }

    /// Payload as text (lossy)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Deserialize the payload
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Encode header and payload
    pub fn encode(&self) -> Result<Bytes, WireError> {
        encode_request(self.typ, &self.payload)
    }
}

/// One API response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    /// Response type code (0 for unrouted requests)
    pub typ: u8,
    /// Status code
    pub status: u16,
    /// Raw body
    pub body: Bytes,
}

impl ApiResponse {
    /// Build a response
    pub fn new(typ: impl Into<u8>, status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            typ: typ.into(),
            status,
            body: body.into(),
        }
    }

    /// Build a response with a JSON body
    pub fn json<T: Serialize>(typ: impl Into<u8>, status: u16, value: &T) -> Result<Self, WireError> {
        Ok(Self::new(typ, status, serde_json::to_vec(value)?))
    }

    /// `status == 200`
    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Body as text (lossy)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserialize the body
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Encode header and body
    pub fn encode(&self) -> Result<Bytes, WireError> {
        encode_response(self.typ, self.status, &self.body)
    }
}

/// Read one full request, refusing payloads above `max_payload`
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload: usize,
) -> Result<ApiRequest, WireError> {
    let header = read_request_header(reader).await?;
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

    let mut payload = BytesMut::with_capacity(len);
    read_body(reader, len, Some(&mut payload)).await?;
    debug!(
        "Read {} request ({:?}, {} bytes)",
        describe(header.typ),
        header.shape(),
        len
    );

    Ok(ApiRequest {
        typ: header.typ,
        payload: payload.freeze(),
    })
}

/// Read one full response, refusing bodies above `max_payload`
pub async fn read_response<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload: usize,
) -> Result<ApiResponse, WireError> {
    let header = read_response_header(reader).await?;
    let len = header.len as usize;
    if len > max_payload {
        return Err(WireError::Size(len));
    }

    let mut body = BytesMut::with_capacity(len);
    read_body(reader, len, Some(&mut body)).await?;

    Ok(ApiResponse {
        typ: header.typ,
        status: header.status,
        body: body.freeze(),
    })
}

/// Write one request and flush
pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: &ApiRequest,
) -> Result<(), WireError> {
    let bytes = request.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Write one response and flush
pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &ApiResponse,
) -> Result<(), WireError> {
    let bytes = response.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
