// src/core/protocol.rs

//! Implements the RESP (REdis Serialization Protocol) frame structure and the
//! corresponding `Encoder` and `Decoder`.
//!
//! The append-only file is a plain concatenation of RESP command arrays, so
//! the persistence layer shares this codec with the (external) wire layer.
//! Only the RESP2 frame kinds the AOF can contain are implemented here.

use crate::core::JasperDBError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// The CRLF (Carriage Return, Line Feed) sequence used to terminate lines in RESP.
const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

// Protocol-level limits to prevent runaway allocations on malformed frames.
const MAX_FRAME_ELEMENTS: usize = 1_024 * 1_024;
const MAX_BULK_STRING_SIZE: usize = 512 * 1024 * 1024; // 512MB max bulk string size.

/// An enum representing a single frame in the RESP protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Null,
    Array(Vec<RespFrame>),
}

impl RespFrame {
    /// A convenience method to encode a frame into a `Vec<u8>`.
    /// Useful for AOF persistence where a complete byte vector is needed.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, JasperDBError> {
        let mut buf = BytesMut::new();
        RespFrameCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }

    /// Builds the array-of-bulk-strings frame for a command.
    pub fn command<I>(args: I) -> RespFrame
    where
        I: IntoIterator<Item = Bytes>,
    {
        RespFrame::Array(args.into_iter().map(RespFrame::BulkString).collect())
    }

    /// Extracts the argument vector of a command frame, or `None` if the
    /// frame is not an array of bulk strings.
    pub fn into_command_args(self) -> Option<Vec<Bytes>> {
        let RespFrame::Array(items) = self else {
            return None;
        };
        let mut args = Vec::with_capacity(items.len());
        for item in items {
            match item {
                RespFrame::BulkString(b) => args.push(b),
                _ => return None,
            }
        }
        Some(args)
    }
}

/// A `tokio_util::codec` implementation for encoding and decoding `RespFrame`s.
#[derive(Debug, Default)]
pub struct RespFrameCodec;

impl Encoder<RespFrame> for RespFrameCodec {
    type Error = JasperDBError;

    /// Encodes a `RespFrame` into a `BytesMut` buffer according to the RESP
    /// specification.
    fn encode(&mut self, item: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RespFrame::SimpleString(s) => {
                dst.extend_from_slice(b"+");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Error(s) => {
                dst.extend_from_slice(b"-");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Integer(i) => {
                dst.extend_from_slice(b":");
                dst.extend_from_slice(i.to_string().as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::BulkString(b) => {
                dst.extend_from_slice(b"$");
                dst.extend_from_slice(b.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                dst.extend_from_slice(&b);
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Null => {
                dst.extend_from_slice(b"$-1\r\n");
            }
            RespFrame::Array(arr) => {
                dst.extend_from_slice(b"*");
                dst.extend_from_slice(arr.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                for frame in arr {
                    // Recursively encode each frame in the array.
                    self.encode(frame, dst)?;
                }
            }
        }
        Ok(())
    }
}

impl Decoder for RespFrameCodec {
    type Item = RespFrame;
    type Error = JasperDBError;

    /// Decodes a `RespFrame` from a `BytesMut` buffer.
    ///
    /// It returns `Ok(None)` if the buffer does not contain a full frame yet,
    /// allowing the caller to wait for more data.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match parse_frame(src) {
            Ok((frame, len)) => {
                // Advance the buffer past the successfully parsed frame.
                src.advance(len);
                Ok(Some(frame))
            }
            // If the data is incomplete, wait for more data.
            Err(JasperDBError::IncompleteData) => Ok(None),
            // For other errors, propagate them up to the caller.
            Err(e) => Err(e),
        }
    }
}

/// The main parsing entry point. It inspects the first byte (the type prefix)
/// and dispatches to the appropriate parsing function.
fn parse_frame(src: &[u8]) -> Result<(RespFrame, usize), JasperDBError> {
    if src.is_empty() {
        return Err(JasperDBError::IncompleteData);
    }
    match src[0] {
        b'+' => parse_simple_string(src),
        b'-' => parse_error(src),
        b':' => parse_integer(src),
        b'$' => parse_bulk_string(src),
        b'*' => parse_array(src),
        _ => Err(JasperDBError::SyntaxError),
    }
}

/// Helper function to find the next CRLF sequence in a buffer.
fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(CRLF_LEN).position(|window| window == CRLF)
}

/// Parses a single line (up to CRLF) from a buffer.
fn parse_line(src: &[u8]) -> Result<(&[u8], usize), JasperDBError> {
    find_crlf(src)
        .map(|pos| (&src[..pos], pos + CRLF_LEN))
        .ok_or(JasperDBError::IncompleteData)
}

/// Parses a Simple String (e.g., `+OK\r\n`).
fn parse_simple_string(src: &[u8]) -> Result<(RespFrame, usize), JasperDBError> {
    let (line, len) = parse_line(&src[1..])?;
    Ok((
        RespFrame::SimpleString(String::from_utf8_lossy(line).to_string()),
        len + 1,
    ))
}

/// Parses an Error (e.g., `-ERR unknown command\r\n`).
fn parse_error(src: &[u8]) -> Result<(RespFrame, usize), JasperDBError> {
    let (line, len) = parse_line(&src[1..])?;
    Ok((
        RespFrame::Error(String::from_utf8_lossy(line).to_string()),
        len + 1,
    ))
}

/// Parses an Integer (e.g., `:1000\r\n`).
fn parse_integer(src: &[u8]) -> Result<(RespFrame, usize), JasperDBError> {
    let (line, len) = parse_line(&src[1..])?;
    let value = std::str::from_utf8(line)
        .map_err(|_| JasperDBError::SyntaxError)?
        .parse::<i64>()
        .map_err(|_| JasperDBError::SyntaxError)?;
    Ok((RespFrame::Integer(value), len + 1))
}

/// Parses a Bulk String (e.g., `$5\r\nhello\r\n`), including the `$-1\r\n`
/// null form.
fn parse_bulk_string(src: &[u8]) -> Result<(RespFrame, usize), JasperDBError> {
    let (line, header_len) = parse_line(&src[1..])?;
    let declared = std::str::from_utf8(line)
        .map_err(|_| JasperDBError::SyntaxError)?
        .parse::<i64>()
        .map_err(|_| JasperDBError::SyntaxError)?;

    if declared == -1 {
        return Ok((RespFrame::Null, header_len + 1));
    }
    if declared < 0 || declared as usize > MAX_BULK_STRING_SIZE {
        return Err(JasperDBError::SyntaxError);
    }

    let payload_len = declared as usize;
    let total = 1 + header_len + payload_len + CRLF_LEN;
    if src.len() < total {
        return Err(JasperDBError::IncompleteData);
    }
    let start = 1 + header_len;
    if &src[start + payload_len..start + payload_len + CRLF_LEN] != CRLF {
        return Err(JasperDBError::SyntaxError);
    }
    Ok((
        RespFrame::BulkString(Bytes::copy_from_slice(&src[start..start + payload_len])),
        total,
    ))
}

/// Parses an Array (e.g., `*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n`).
fn parse_array(src: &[u8]) -> Result<(RespFrame, usize), JasperDBError> {
    let (line, header_len) = parse_line(&src[1..])?;
    let declared = std::str::from_utf8(line)
        .map_err(|_| JasperDBError::SyntaxError)?
        .parse::<i64>()
        .map_err(|_| JasperDBError::SyntaxError)?;

    if declared == -1 {
        return Ok((RespFrame::Null, header_len + 1));
    }
    if declared < 0 || declared as usize > MAX_FRAME_ELEMENTS {
        return Err(JasperDBError::SyntaxError);
    }

    let mut elements = Vec::with_capacity(declared as usize);
    let mut consumed = 1 + header_len;
    for _ in 0..declared {
        let (frame, len) = parse_frame(&src[consumed..])?;
        elements.push(frame);
        consumed += len;
    }
    Ok((RespFrame::Array(elements), consumed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trip() {
        let frame = RespFrame::command([
            Bytes::from_static(b"SET"),
            Bytes::from_static(b"key"),
            Bytes::from_static(b"value"),
        ]);
        let encoded = frame.encode_to_vec().unwrap();
        assert_eq!(encoded, b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n");

        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = RespFrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_frame_waits_for_more_data() {
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$3\r\nfo"[..]);
        assert!(RespFrameCodec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"o\r\n");
        let frame = RespFrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            frame.into_command_args().unwrap(),
            vec![Bytes::from_static(b"GET"), Bytes::from_static(b"foo")]
        );
    }

    #[test]
    fn rejects_unknown_prefix() {
        let mut buf = BytesMut::from(&b"?oops\r\n"[..]);
        assert!(RespFrameCodec.decode(&mut buf).is_err());
    }
}
