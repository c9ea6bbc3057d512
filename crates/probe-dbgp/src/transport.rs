//! DBGP transport layer — length-prefixed, NUL-delimited message framing.
//!
//! Every message on the wire is `decimal-length NUL payload NUL`. The
//! length prefix is authoritative: the body read is driven by the byte
//! count, so a NUL inside the payload can never desynchronise framing.

use crate::error::DbgpError;

/// Encode a payload into its DBGP wire form.
pub fn encode_message(payload: &str) -> Vec<u8> {
    let prefix = payload.len().to_string();
    let mut buf = Vec::with_capacity(prefix.len() + payload.len() + 2);
    buf.extend_from_slice(prefix.as_bytes());
    buf.push(0);
    buf.extend_from_slice(payload.as_bytes());
    buf.push(0);
    buf
}

/// Decode one DBGP message from a byte buffer.
///
/// Returns the payload and the number of bytes consumed. The buffer must
/// contain the complete frame: length digits, separator NUL, exactly
/// `length` payload bytes and the trailing NUL.
pub fn decode_message(data: &[u8]) -> Result<(String, usize), DbgpError> {
    let sep = data
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| DbgpError::malformed("missing length separator", preview(data)))?;

    let length = parse_length(&data[..sep], data)?;

    let body_start = sep + 1;
    let body_end = body_start + length;
    // Body plus trailing NUL.
    if data.len() < body_end + 1 {
        return Err(DbgpError::malformed(
            format!(
                "incomplete frame: declared {length} payload bytes, have {}",
                data.len().saturating_sub(body_start)
            ),
            preview(data),
        ));
    }
    if data[body_end] != 0 {
        return Err(DbgpError::malformed(
            "payload length does not match declared prefix",
            preview(data),
        ));
    }

    let payload = std::str::from_utf8(&data[body_start..body_end])
        .map_err(|e| DbgpError::malformed(format!("invalid UTF-8 payload: {e}"), preview(data)))?
        .to_string();
    Ok((payload, body_end + 1))
}

/// Parse the decimal length prefix.
fn parse_length(digits: &[u8], frame: &[u8]) -> Result<usize, DbgpError> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(DbgpError::malformed(
            "length prefix is not a decimal number",
            preview(frame),
        ));
    }
    let mut length: usize = 0;
    for &digit in digits {
        length = length
            .checked_mul(10)
            .and_then(|v| v.checked_add(usize::from(digit - b'0')))
            .ok_or_else(|| DbgpError::malformed("length prefix overflow", preview(frame)))?;
    }
    Ok(length)
}

/// A short lossy prefix of the frame, for error reporting.
fn preview(data: &[u8]) -> String {
    String::from_utf8_lossy(&data[..data.len().min(64)]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let payload = r#"<response status="break" transaction_id="4"/>"#;
        let encoded = encode_message(payload);
        let (decoded, consumed) = decode_message(&encoded).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn frame_layout() {
        let encoded = encode_message("hello");
        assert_eq!(encoded, b"5\0hello\0");
    }

    #[test]
    fn empty_payload_round_trip() {
        let encoded = encode_message("");
        assert_eq!(encoded, b"0\0\0");
        let (decoded, consumed) = decode_message(&encoded).unwrap();
        assert_eq!(decoded, "");
        assert_eq!(consumed, 3);
    }

    #[test]
    fn multiple_messages_in_one_buffer() {
        let mut buf = encode_message("<init/>");
        buf.extend_from_slice(&encode_message("<response/>"));

        let (first, consumed) = decode_message(&buf).unwrap();
        assert_eq!(first, "<init/>");
        let (second, rest) = decode_message(&buf[consumed..]).unwrap();
        assert_eq!(second, "<response/>");
        assert_eq!(consumed + rest, buf.len());
    }

    #[test]
    fn missing_separator_rejected() {
        let err = decode_message(b"123").unwrap_err();
        assert!(err.to_string().contains("missing length separator"));
    }

    #[test]
    fn non_decimal_prefix_rejected() {
        let err = decode_message(b"12a\0xxx\0").unwrap_err();
        assert!(err.to_string().contains("not a decimal number"));
    }

    #[test]
    fn short_body_rejected() {
        // Declares 10 bytes but carries 3.
        let err = decode_message(b"10\0abc").unwrap_err();
        assert!(err.to_string().contains("incomplete frame"));
    }

    #[test]
    fn missing_trailing_nul_rejected() {
        // Declared length covers part of the body; the byte where the
        // trailing NUL should sit is payload text instead.
        let err = decode_message(b"3\0abcd\0").unwrap_err();
        assert!(err
            .to_string()
            .contains("payload length does not match declared prefix"));
    }

    #[test]
    fn payload_may_exceed_declared_when_more_frames_follow() {
        // The prefix, not a terminator search, bounds the body: trailing
        // bytes after the frame are simply left unconsumed.
        let mut buf = encode_message("abc");
        buf.extend_from_slice(b"9\0");
        let (payload, consumed) = decode_message(&buf).unwrap();
        assert_eq!(payload, "abc");
        assert_eq!(consumed, 6);
    }

    #[test]
    fn invalid_utf8_rejected() {
        let err = decode_message(b"2\0\xff\xfe\0").unwrap_err();
        assert!(matches!(err, DbgpError::MalformedResponse { .. }));
    }
}
