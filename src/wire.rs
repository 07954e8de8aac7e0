//! MongoDB wire-protocol framing.
//!
//! The proxy never parses BSON payloads. Everything it needs lives in the
//! 16-byte little-endian message header: the total message length, the
//! request/response correlation ids, and the opcode, from which two
//! predicates are derived: does the server reply to this op, and may the
//! client follow it up with a `getLastError` on the same upstream.

use bytes::{Buf, BufMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;

/// Wire size of a message header.
pub const HEADER_LEN: usize = 16;

/// MongoDB wire opcodes, plus a catch-all that preserves the raw value so
/// unknown messages still round-trip byte-exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Reply,
    Update,
    Insert,
    Query,
    GetMore,
    Delete,
    KillCursors,
    Other(u32),
}

impl OpCode {
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            1 => OpCode::Reply,
            2001 => OpCode::Update,
            2002 => OpCode::Insert,
            2004 => OpCode::Query,
            2005 => OpCode::GetMore,
            2006 => OpCode::Delete,
            2007 => OpCode::KillCursors,
            other => OpCode::Other(other),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            OpCode::Reply => 1,
            OpCode::Update => 2001,
            OpCode::Insert => 2002,
            OpCode::Query => 2004,
            OpCode::GetMore => 2005,
            OpCode::Delete => 2006,
            OpCode::KillCursors => 2007,
            OpCode::Other(other) => other,
        }
    }

    /// The server sends a reply before this exchange is done.
    pub fn has_response(self) -> bool {
        matches!(self, OpCode::Query | OpCode::GetMore)
    }

    /// The client may follow this op with a `getLastError` that must land
    /// on the same upstream connection.
    pub fn is_mutation(self) -> bool {
        matches!(self, OpCode::Update | OpCode::Insert | OpCode::Delete)
    }
}

/// The 16-byte header preceding every wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Total message length in bytes, header included.
    pub message_length: u32,
    pub request_id: u32,
    pub response_to: u32,
    pub op_code: OpCode,
}

impl MessageHeader {
    /// Length of the body following the header.
    pub fn body_length(&self) -> u64 {
        u64::from(self.message_length) - HEADER_LEN as u64
    }

    pub fn from_bytes(buf: [u8; HEADER_LEN]) -> Result<Self, ProxyError> {
        let mut buf = &buf[..];
        let message_length = buf.get_u32_le();
        let request_id = buf.get_u32_le();
        let response_to = buf.get_u32_le();
        let op_code = OpCode::from_u32(buf.get_u32_le());

        if (message_length as usize) < HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message length {} shorter than header", message_length),
            )
            .into());
        }

        Ok(Self {
            message_length,
            request_id,
            response_to,
            op_code,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        {
            let mut cursor = &mut buf[..];
            cursor.put_u32_le(self.message_length);
            cursor.put_u32_le(self.request_id);
            cursor.put_u32_le(self.response_to);
            cursor.put_u32_le(self.op_code.as_u32());
        }
        buf
    }
}

/// Read exactly one header from `src`.
///
/// A clean end-of-stream (zero bytes read) is a [`ProxyError::NormalClose`];
/// an end-of-stream in the middle of a header is an I/O error, since the
/// peer abandoned a message it had started.
pub async fn read_header<R>(src: &mut R) -> Result<MessageHeader, ProxyError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = src.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Err(ProxyError::NormalClose);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-header",
            )
            .into());
        }
        filled += n;
    }
    MessageHeader::from_bytes(buf)
}

/// Write one header to `dst`, byte-for-byte.
pub async fn write_header<W>(dst: &mut W, header: &MessageHeader) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    dst.write_all(&header.to_bytes()).await?;
    Ok(())
}

/// Copy exactly `n` bytes from `src` to `dst`, or fail.
pub async fn copy_exact<R, W>(src: &mut R, dst: &mut W, n: u64) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut limited = (&mut *src).take(n);
    let copied = tokio::io::copy(&mut limited, dst).await?;
    if copied != n {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short message body: copied {} of {} bytes", copied, n),
        )
        .into());
    }
    Ok(())
}

/// Copy one full message (header plus body) from `src` to `dst`,
/// preserving every byte.
pub async fn copy_message<R, W>(src: &mut R, dst: &mut W) -> Result<MessageHeader, ProxyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let header = read_header(src).await?;
    write_header(dst, &header).await?;
    copy_exact(src, dst, header.body_length()).await?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_header(body_len: u32) -> MessageHeader {
        MessageHeader {
            message_length: HEADER_LEN as u32 + body_len,
            request_id: 7,
            response_to: 0,
            op_code: OpCode::Insert,
        }
    }

    #[test]
    fn test_opcode_round_trip() {
        for raw in [1u32, 2001, 2002, 2004, 2005, 2006, 2007, 2013, 0xdead] {
            assert_eq!(OpCode::from_u32(raw).as_u32(), raw);
        }
    }

    #[test]
    fn test_opcode_predicates() {
        assert!(OpCode::Query.has_response());
        assert!(OpCode::GetMore.has_response());
        assert!(!OpCode::Insert.has_response());
        assert!(!OpCode::Reply.has_response());

        assert!(OpCode::Insert.is_mutation());
        assert!(OpCode::Update.is_mutation());
        assert!(OpCode::Delete.is_mutation());
        assert!(!OpCode::Query.is_mutation());
        assert!(!OpCode::KillCursors.is_mutation());
    }

    #[test]
    fn test_header_codec_little_endian() {
        let header = MessageHeader {
            message_length: 40,
            request_id: 0x01020304,
            response_to: 0x0a0b0c0d,
            op_code: OpCode::GetMore,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &[40, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[8..12], &[0x0d, 0x0c, 0x0b, 0x0a]);
        assert_eq!(&bytes[12..16], &[0xd5, 0x07, 0, 0]); // 2005

        let decoded = MessageHeader::from_bytes(bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_rejects_undersized_length() {
        let header = MessageHeader {
            message_length: 8,
            request_id: 1,
            response_to: 0,
            op_code: OpCode::Query,
        };
        let result = MessageHeader::from_bytes(header.to_bytes());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_read_header_clean_eof_is_normal_close() {
        let mut src: &[u8] = &[];
        let err = read_header(&mut src).await.unwrap_err();
        assert!(err.is_normal_close());
    }

    #[tokio::test]
    async fn test_read_header_partial_eof_is_io_error() {
        let mut src: &[u8] = &[1, 2, 3];
        let err = read_header(&mut src).await.unwrap_err();
        match err {
            ProxyError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_read_write_header_round_trip() {
        let header = insert_header(24);
        let mut wire = Vec::new();
        write_header(&mut wire, &header).await.unwrap();

        let mut src = wire.as_slice();
        let decoded = read_header(&mut src).await.unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.body_length(), 24);
    }

    #[tokio::test]
    async fn test_copy_exact_short_read_fails() {
        let mut src: &[u8] = &[0u8; 10];
        let mut dst = Vec::new();
        let err = copy_exact(&mut src, &mut dst, 24).await.unwrap_err();
        assert!(matches!(err, ProxyError::Io(_)));
    }

    #[tokio::test]
    async fn test_copy_message_is_byte_exact() {
        let header = insert_header(5);
        let mut wire = header.to_bytes().to_vec();
        wire.extend_from_slice(&[9, 8, 7, 6, 5]);

        let mut src = wire.as_slice();
        let mut dst = Vec::new();
        let copied = copy_message(&mut src, &mut dst).await.unwrap();

        assert_eq!(copied, header);
        assert_eq!(dst, wire);
        assert!(src.is_empty());
    }
}
