//! Notification channel framing.
//!
//! ```text
//! +---------+-------------+------------------+
//! | type u8 | len u16 BE  | payload len bytes|
//! +---------+-------------+------------------+
//! ```
//!
//! There is no extended variant on this channel. Receivers cap the kept
//! payload at a configurable buffer size; bytes beyond the cap are consumed
//! and dropped so the stream stays aligned, and the frame remembers its
//! declared length so callers can see the truncation.

use crate::msg_type::MsgType;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 3;

/// Largest payload the 16-bit length field can describe
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Default receive cap per frame payload
pub const DEFAULT_FRAME_BUFFER_SIZE: usize = 1024;

/// One notification frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw type code (unknown codes are passed through)
    pub typ: u8,
    /// Payload, possibly truncated to the receiver's cap
    pub payload: Bytes,
    /// Length announced by the sender
    pub declared_len: usize,
}

impl Frame {
    /// Create an outbound frame
    pub fn new(typ: impl Into<u8>, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            typ: typ.into(),
            declared_len: payload.len(),
            payload,
        }
    }

    /// Plain `MSG_SOCKET` frame
    pub fn socket(payload: impl Into<Bytes>) -> Self {
        Self::new(MsgType::Socket, payload)
    }

    /// Typed view of the code
    pub fn msg_type(&self) -> Result<MsgType, crate::WireError> {
        MsgType::try_from(self.typ)
    }

    /// Whether bytes were dropped because the payload exceeded the receive cap
    pub fn is_truncated(&self) -> bool {
        self.declared_len > self.payload.len()
    }

    /// Payload as text (lossy)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Encode to a contiguous buffer
    pub fn encode(&self) -> Result<Bytes, crate::WireError> {
        encode_frame(self.typ, &self.payload)
    }
}

/// Encode header and payload
pub fn encode_frame(typ: u8, payload: &[u8]) -> Result<Bytes, crate::WireError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(crate::WireError::Size(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u8(typ);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Incremental frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_payload: usize,
}

impl FrameDecoder {
    /// Create a decoder with the default receive cap
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_FRAME_BUFFER_SIZE)
    }

    /// Create a decoder keeping at most `max_payload` bytes per frame
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(MAX_FRAME_PAYLOAD),
        }
    }

    /// Receive cap in bytes
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Decode one frame from a buffer, `Ok(None)` when more bytes are needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, crate::WireError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let typ = buf[0];
        let declared_len = u16::from_be_bytes([buf[1], buf[2]]) as usize;

        if buf.len() < FRAME_HEADER_SIZE + declared_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let mut body = buf.split_to(declared_len).freeze();

        if declared_len > self.max_payload {
            warn!(
                "Frame type 0x{:02X} declared {} bytes, keeping {} (capacity exceeded)",
                typ, declared_len, self.max_payload
            );
            body.truncate(self.max_payload);
        }

        Ok(Some(Frame {
            typ,
            payload: body,
            declared_len,
        }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read one complete frame, tolerating arbitrarily fragmented reads.
///
/// `buffer` carries bytes between calls and must belong to a single stream.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    buffer: &mut BytesMut,
) -> Result<Frame, crate::WireError> {
    loop {
        if let Some(frame) = decoder.decode(buffer)? {
            return Ok(frame);
        }

        let bytes_read = reader.read_buf(buffer).await?;
        if bytes_read == 0 {
            return Err(crate::WireError::Closed);
        }

        trace!(
            "Read {} bytes, buffer now has {} bytes",
            bytes_read,
            buffer.len()
        );
    }
}

/// Write one frame and flush
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    typ: u8,
    payload: &[u8],
) -> Result<(), crate::WireError> {
    let bytes = encode_frame(typ, payload)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_encode_layout() {
        let bytes = encode_frame(0x01, b"hi").unwrap();
        assert_eq!(&bytes[..], &[0x01, 0x00, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_encode_rejects_oversized() {
        let payload = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        assert!(matches!(
            encode_frame(0x01, &payload),
            Err(crate::WireError::Size(_))
        ));
        assert!(encode_frame(0x01, &payload[..MAX_FRAME_PAYLOAD]).is_ok());
    }

    #[test]
    fn test_decode_needs_more_data() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&[0x01u8, 0x00][..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0x05, b'a', b'b']);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"cde");
        buf.extend_from_slice(&[0x01]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"abcde");
        // one byte of the next frame stays buffered
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_oversized_payload_is_truncated_and_stream_stays_aligned() {
        let mut decoder = FrameDecoder::with_max_payload(4);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(0xD3, b"0123456789").unwrap());
        buf.extend_from_slice(&encode_frame(0x01, b"ok").unwrap());

        let first = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.typ, 0xD3);
        assert_eq!(&first.payload[..], b"0123");
        assert_eq!(first.declared_len, 10);
        assert!(first.is_truncated());

        let second = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&second.payload[..], b"ok");
        assert!(!second.is_truncated());
    }

    #[tokio::test]
    async fn test_read_frame_fragmented_writes() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let bytes = encode_frame(0x01, b"device-42").unwrap();

        let writer = tokio::spawn(async move {
            for byte in bytes.iter() {
                client.write_all(&[*byte]).await.unwrap();
                client.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            client
        });

        let mut decoder = FrameDecoder::new();
        let mut buffer = BytesMut::new();
        let frame = read_frame(&mut server, &mut decoder, &mut buffer)
            .await
            .unwrap();
        assert_eq!(frame.text(), "device-42");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_read_frame_reports_close() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let mut decoder = FrameDecoder::new();
        let mut buffer = BytesMut::new();
        let err = read_frame(&mut server, &mut decoder, &mut buffer)
            .await
            .unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_write_then_read_two_frames() {
        let (mut client, mut server) = tokio::io::duplex(256);
        write_frame(&mut client, 0x01, b"first").await.unwrap();
        write_frame(&mut client, 0x72, b"{\"op\":\"RESTORE_CMD\"}")
            .await
            .unwrap();

        let mut decoder = FrameDecoder::with_max_payload(1024);
        let mut buffer = BytesMut::new();
        let a = read_frame(&mut server, &mut decoder, &mut buffer).await.unwrap();
        let b = read_frame(&mut server, &mut decoder, &mut buffer).await.unwrap();
        assert_eq!(a.text(), "first");
        assert_eq!(b.msg_type().unwrap(), MsgType::ServerRestoreCmd);
    }
}
