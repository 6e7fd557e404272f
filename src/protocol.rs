//! Length-prefixed wire protocol.
//!
//! ## Request Format
//!
//! ```text
//! ┌──────────────┬──────────────┬───────────────┬─────────────┬─────
//! │ total_len(4) │ n_fields(4)  │ field_len(4)  │ field bytes │ ...
//! └──────────────┴──────────────┴───────────────┴─────────────┴─────
//! ```
//!
//! `total_len` counts every byte after itself: `4 + Σ(4 + field_len)`.
//! The first field is the command name, the rest are its arguments.
//!
//! ## Response Format
//!
//! ```text
//! ┌─────────────┬───────────┬─────────────┐
//! │ resp_len(4) │ status(4) │   payload   │
//! └─────────────┴───────────┴─────────────┘
//! ```
//!
//! `resp_len = 4 + len(payload)`.
//!
//! All integers are 32-bit little-endian.

use crate::runtime::ElasticBuffer;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of every length/count prefix on the wire.
pub const LEN_SIZE: usize = 4;

/// Size of a response header (`resp_len` + `status`).
pub const RESPONSE_HEADER_SIZE: usize = 8;

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    /// Unknown command, wrong arity, or key not found on `get`.
    Invalid = 1,
}

impl TryFrom<u32> for Status {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Status::Ok),
            1 => Ok(Status::Invalid),
            other => Err(other),
        }
    }
}

/// Protocol violations. Every variant is fatal for the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame declares {declared} bytes, too short for a field count")]
    FrameTooShort { declared: usize },

    #[error("frame has zero fields")]
    ZeroFields,

    #[error("field {index} is empty")]
    EmptyField { index: usize },

    #[error("field {index} runs past the end of the frame")]
    FieldOverrun { index: usize },

    #[error("frame declares {declared} bytes but its fields span {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

/// Try to decode one command frame from the front of `buffer`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame, and
/// `Ok(Some(fields))` after consuming exactly one frame. Nothing is consumed
/// on error. Callers loop until `Ok(None)` to drain pipelined frames.
pub fn try_decode_command(
    buffer: &mut ElasticBuffer,
) -> Result<Option<Vec<Bytes>>, DecodeError> {
    let (fields, frame_len) = match parse_command(buffer.data())? {
        Some(parsed) => parsed,
        None => return Ok(None),
    };
    buffer.consume(frame_len);
    Ok(Some(fields))
}

/// Parse a command frame from `input`, returning the fields and total bytes
/// occupied (including the leading length).
fn parse_command(input: &[u8]) -> Result<Option<(Vec<Bytes>, usize)>, DecodeError> {
    let Some(total_len) = read_u32(input, 0) else {
        return Ok(None);
    };
    let total_len = total_len as usize;
    let frame_len = LEN_SIZE + total_len;
    if input.len() < frame_len {
        return Ok(None);
    }
    if total_len < LEN_SIZE {
        return Err(DecodeError::FrameTooShort {
            declared: total_len,
        });
    }

    let frame = &input[..frame_len];
    let mut pos = LEN_SIZE;

    let n_fields = read_u32(frame, pos).unwrap_or(0) as usize;
    if n_fields == 0 {
        return Err(DecodeError::ZeroFields);
    }
    pos += LEN_SIZE;

    // A field needs at least five bytes, so this bounds the allocation.
    let mut fields = Vec::with_capacity(n_fields.min(total_len / (LEN_SIZE + 1)));
    for index in 0..n_fields {
        let field_len = read_u32(frame, pos).ok_or(DecodeError::FieldOverrun { index })? as usize;
        if field_len == 0 {
            return Err(DecodeError::EmptyField { index });
        }
        pos += LEN_SIZE;

        let end = pos
            .checked_add(field_len)
            .filter(|&end| end <= frame_len)
            .ok_or(DecodeError::FieldOverrun { index })?;
        fields.push(Bytes::copy_from_slice(&frame[pos..end]));
        pos = end;
    }

    if pos != frame_len {
        return Err(DecodeError::LengthMismatch {
            declared: total_len,
            actual: pos - LEN_SIZE,
        });
    }

    Ok(Some((fields, frame_len)))
}

/// Append a response frame to `buffer`.
pub fn encode_response(buffer: &mut ElasticBuffer, status: Status, payload: &[u8]) {
    let mut header = [0u8; RESPONSE_HEADER_SIZE];
    header[..LEN_SIZE].copy_from_slice(&((LEN_SIZE + payload.len()) as u32).to_le_bytes());
    header[LEN_SIZE..].copy_from_slice(&(status as u32).to_le_bytes());
    buffer.append(&header);
    buffer.append(payload);
}

/// Encode a command frame from its fields.
pub fn encode_command<F: AsRef<[u8]>>(fields: &[F]) -> BytesMut {
    let total_len: usize = LEN_SIZE
        + fields
            .iter()
            .map(|f| LEN_SIZE + f.as_ref().len())
            .sum::<usize>();

    let mut frame = BytesMut::with_capacity(LEN_SIZE + total_len);
    frame.put_u32_le(total_len as u32);
    frame.put_u32_le(fields.len() as u32);
    for field in fields {
        let field = field.as_ref();
        frame.put_u32_le(field.len() as u32);
        frame.put_slice(field);
    }
    frame
}

/// Decode a response header into the payload length and status.
///
/// Returns the unrecognised status code on failure.
pub fn decode_response_header(
    header: &[u8; RESPONSE_HEADER_SIZE],
) -> Result<(usize, Status), u32> {
    let resp_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let status = Status::try_from(u32::from_le_bytes([header[4], header[5], header[6], header[7]]))?;
    Ok((resp_len.saturating_sub(LEN_SIZE), status))
}

fn read_u32(input: &[u8], offset: usize) -> Option<u32> {
    let bytes = input.get(offset..offset + LEN_SIZE)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(bytes: &[u8]) -> ElasticBuffer {
        let mut buf = ElasticBuffer::with_capacity(256);
        buf.append(bytes);
        buf
    }

    fn raw_frame(total_len: u32, n_fields: u32, fields: &[&[u8]]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&total_len.to_le_bytes());
        raw.extend_from_slice(&n_fields.to_le_bytes());
        for field in fields {
            raw.extend_from_slice(&(field.len() as u32).to_le_bytes());
            raw.extend_from_slice(field);
        }
        raw
    }

    #[test]
    fn test_encode_command_layout() {
        let frame = encode_command(&["get", "k"]);
        let expected = raw_frame(4 + (4 + 3) + (4 + 1), 2, &[b"get", b"k"]);
        assert_eq!(&frame[..], &expected[..]);
    }

    #[test]
    fn test_decode_single_frame() {
        let mut buf = buffer_with(&encode_command(&["set", "key", "value"]));
        let fields = try_decode_command(&mut buf).unwrap().unwrap();
        assert_eq!(fields, vec!["set", "key", "value"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_incomplete_length_prefix() {
        let mut buf = buffer_with(&[5, 0, 0]);
        assert_eq!(try_decode_command(&mut buf), Ok(None));
        assert_eq!(buf.size(), 3);
    }

    #[test]
    fn test_incomplete_body() {
        let frame = encode_command(&["get", "somekey"]);
        let mut buf = buffer_with(&frame[..frame.len() - 1]);
        assert_eq!(try_decode_command(&mut buf), Ok(None));
        assert_eq!(buf.size(), frame.len() - 1);
    }

    #[test]
    fn test_byte_at_a_time() {
        let frame = encode_command(&["set", "k", "v"]);
        let mut buf = ElasticBuffer::with_capacity(64);
        for (i, byte) in frame.iter().enumerate() {
            buf.append(&[*byte]);
            let decoded = try_decode_command(&mut buf).unwrap();
            if i + 1 < frame.len() {
                assert!(decoded.is_none());
            } else {
                assert_eq!(decoded.unwrap(), vec!["set", "k", "v"]);
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_pipelined_frames() {
        let mut raw = encode_command(&["set", "a", "1"]).to_vec();
        raw.extend_from_slice(&encode_command(&["get", "a"]));
        let mut buf = buffer_with(&raw);

        assert_eq!(
            try_decode_command(&mut buf).unwrap().unwrap(),
            vec!["set", "a", "1"]
        );
        assert_eq!(try_decode_command(&mut buf).unwrap().unwrap(), vec!["get", "a"]);
        assert_eq!(try_decode_command(&mut buf), Ok(None));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_trailing_partial_frame_is_kept() {
        let mut raw = encode_command(&["del", "a"]).to_vec();
        let next = encode_command(&["get", "b"]);
        raw.extend_from_slice(&next[..6]);
        let mut buf = buffer_with(&raw);

        assert_eq!(try_decode_command(&mut buf).unwrap().unwrap(), vec!["del", "a"]);
        assert_eq!(try_decode_command(&mut buf), Ok(None));
        assert_eq!(buf.data(), &next[..6]);
    }

    #[test]
    fn test_zero_fields_is_violation() {
        let mut buf = buffer_with(&raw_frame(4, 0, &[]));
        assert_eq!(try_decode_command(&mut buf), Err(DecodeError::ZeroFields));
        assert_eq!(buf.size(), 8);
    }

    #[test]
    fn test_empty_field_is_violation() {
        let mut buf = buffer_with(&raw_frame(4 + 7 + 4, 2, &[b"get", b""]));
        assert_eq!(
            try_decode_command(&mut buf),
            Err(DecodeError::EmptyField { index: 1 })
        );
    }

    #[test]
    fn test_field_overrun_is_violation() {
        // Second field claims 50 bytes inside a frame that declares only 12.
        let mut raw = raw_frame(12, 2, &[b"get"]);
        raw.extend_from_slice(&50u32.to_le_bytes());
        raw.extend_from_slice(&[0u8; 60]);
        let mut buf = buffer_with(&raw);
        assert_eq!(
            try_decode_command(&mut buf),
            Err(DecodeError::FieldOverrun { index: 1 })
        );
    }

    #[test]
    fn test_length_mismatch_is_violation() {
        // Payload-only length variant: omits the field-count prefix.
        let mut raw = raw_frame(0, 1, &[b"get"]);
        raw[..4].copy_from_slice(&((4 + 3) as u32).to_le_bytes());
        raw.extend_from_slice(&[0u8; 4]);
        let mut buf = buffer_with(&raw);
        assert_eq!(
            try_decode_command(&mut buf),
            Err(DecodeError::FieldOverrun { index: 0 })
        );

        let mut padded = raw_frame(4 + 7 + 2, 1, &[b"get"]);
        padded.extend_from_slice(&[0, 0]);
        let mut buf = buffer_with(&padded);
        assert_eq!(
            try_decode_command(&mut buf),
            Err(DecodeError::LengthMismatch {
                declared: 13,
                actual: 11
            })
        );
    }

    #[test]
    fn test_frame_too_short() {
        let mut buf = buffer_with(&[2, 0, 0, 0, 1, 0]);
        assert_eq!(
            try_decode_command(&mut buf),
            Err(DecodeError::FrameTooShort { declared: 2 })
        );
    }

    #[test]
    fn test_encode_response() {
        let mut buf = ElasticBuffer::with_capacity(64);
        encode_response(&mut buf, Status::Ok, b"v");
        assert_eq!(buf.data(), &[5, 0, 0, 0, 0, 0, 0, 0, b'v']);

        buf.clear();
        encode_response(&mut buf, Status::Invalid, b"");
        assert_eq!(buf.data(), &[4, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn test_decode_response_header() {
        let mut buf = ElasticBuffer::with_capacity(64);
        encode_response(&mut buf, Status::Ok, b"hello");
        let header: [u8; RESPONSE_HEADER_SIZE] = buf.data()[..8].try_into().unwrap();
        assert_eq!(decode_response_header(&header), Ok((5, Status::Ok)));

        let bogus = [4, 0, 0, 0, 9, 0, 0, 0];
        assert_eq!(decode_response_header(&bogus), Err(9));
    }

    #[test]
    fn test_binary_fields_roundtrip() {
        let fields: Vec<Vec<u8>> = vec![b"set".to_vec(), vec![0, 255, 10, 13], vec![7u8; 70_000]];
        let mut buf = ElasticBuffer::with_capacity(64);
        buf.append(&encode_command(&fields));
        let decoded = try_decode_command(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, fields);
    }
}
