//! # Wire Frame Codec
//!
//! Purpose: Encode and decode the length-prefixed binary frames exchanged
//! with SeriesKV servers.
//!
//! ## Frame Layout
//!
//! ```text
//! +----------------+---------+------------------+
//! | len: 4B (BE)   | code:1B | payload: len-1 B |
//! +----------------+---------+------------------+
//! ```
//!
//! `len` counts the code byte, so an empty payload encodes as `len == 1`.
//!
//! ## Design Principles
//! 1. **Binary-Safe**: Payloads are raw bytes; no text framing assumptions.
//! 2. **Fail Fast**: Malformed responses are rejected before any command
//!    decode hook runs.
//! 3. **Buffer Reuse**: Encoding appends into a caller-visible `BytesMut`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{SkvError, SkvResult};

/// Number of bytes in the frame length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Message code carried by server error frames.
pub const ERROR_RESP_CODE: u8 = 0x00;

/// Encodes one frame for the given message code and payload.
pub fn encode(code: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + 1 + payload.len());
    buf.put_u32((payload.len() + 1) as u32);
    buf.put_u8(code);
    buf.put_slice(payload);
    buf.freeze()
}

/// Decodes the frame length prefix (message length including the code byte).
pub fn decode_length(header: [u8; LENGTH_PREFIX_SIZE]) -> u32 {
    u32::from_be_bytes(header)
}

/// Validates a response body (code byte plus payload) against the expected
/// message code and returns the payload on success.
///
/// Error frames are parsed into [`SkvError::ServerError`]; any other code
/// mismatch fails with [`SkvError::UnexpectedCode`].
pub fn validate_response(data: &[u8], expected_code: u8) -> SkvResult<&[u8]> {
    let code = *data.first().ok_or(SkvError::ZeroLength)?;
    if code == ERROR_RESP_CODE {
        return Err(parse_server_error(&data[1..]));
    }
    if code != expected_code {
        return Err(SkvError::UnexpectedCode {
            expected: expected_code,
            got: code,
        });
    }
    Ok(&data[1..])
}

// Server error payload: 4-byte big-endian error code, then UTF-8 message.
fn parse_server_error(payload: &[u8]) -> SkvError {
    if payload.len() < 4 {
        return SkvError::DecodeFailed(format!(
            "server error payload truncated at {} bytes",
            payload.len()
        ));
    }
    let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    match std::str::from_utf8(&payload[4..]) {
        Ok(message) => SkvError::ServerError {
            code,
            message: message.to_string(),
        },
        Err(err) => SkvError::DecodeFailed(format!("server error message: {err}")),
    }
}

/// Encodes a server error frame. Used by test doubles standing in for a
/// real server.
pub fn encode_server_error(code: u32, message: &str) -> Bytes {
    let mut payload = BytesMut::with_capacity(4 + message.len());
    payload.put_u32(code);
    payload.put_slice(message.as_bytes());
    encode(ERROR_RESP_CODE, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = encode(0x09, b"hello");
        assert_eq!(frame.len(), LENGTH_PREFIX_SIZE + 1 + 5);

        let mut header = [0u8; LENGTH_PREFIX_SIZE];
        header.copy_from_slice(&frame[..LENGTH_PREFIX_SIZE]);
        assert_eq!(decode_length(header), 6);
        assert_eq!(frame[LENGTH_PREFIX_SIZE], 0x09);
        assert_eq!(&frame[LENGTH_PREFIX_SIZE + 1..], b"hello");
    }

    #[test]
    fn empty_payload_encodes_len_one() {
        let frame = encode(0x01, &[]);
        assert_eq!(&frame[..], &[0, 0, 0, 1, 0x01]);
    }

    #[test]
    fn validate_passes_payload_through() {
        let payload = validate_response(&[0x0a, 1, 2, 3], 0x0a).unwrap();
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn validate_rejects_empty_body() {
        assert_eq!(validate_response(&[], 0x0a), Err(SkvError::ZeroLength));
    }

    #[test]
    fn validate_rejects_unexpected_code() {
        assert_eq!(
            validate_response(&[0x0b], 0x0a),
            Err(SkvError::UnexpectedCode {
                expected: 0x0a,
                got: 0x0b
            })
        );
    }

    #[test]
    fn validate_parses_server_error() {
        let frame = encode_server_error(1, "this is an error");
        // Strip the length prefix the way a connection would.
        let body = &frame[LENGTH_PREFIX_SIZE..];
        assert_eq!(
            validate_response(body, 0x0a),
            Err(SkvError::ServerError {
                code: 1,
                message: "this is an error".to_string()
            })
        );
    }

    #[test]
    fn truncated_server_error_is_decode_failure() {
        let err = validate_response(&[ERROR_RESP_CODE, 0, 0], 0x0a).unwrap_err();
        assert!(matches!(err, SkvError::DecodeFailed(_)));
    }
}
