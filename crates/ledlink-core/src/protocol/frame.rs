//! Line-oriented JSON frame codec for the controller serial protocol.
//!
//! Wire format:
//! ```text
//! {"cm":"led","a":"pwm","drvs":[{"dvr":0,"cs":[1,2]}],"pwm":120}\r\n
//! ```
//! One frame is one line of compact UTF-8 JSON whose top-level value is an
//! object.  Outbound frames are terminated with `\r\n`; inbound frames may end
//! with `\n` or `\r\n`.
//!
//! # Integrity and resynchronisation
//!
//! The controllers do not append a checksum, so a frame is accepted when the
//! line decodes as UTF-8 *and* parses as a JSON object.  A line that fails
//! either check is reported as [`ProtocolError::MalformedFrame`] together with
//! the number of bytes to discard; the next decode starts at the following
//! newline.  Lines that grow past [`MAX_FRAME_LEN`] without a terminator are
//! reported as [`ProtocolError::Oversized`] and discarded the same way.

use serde_json::{Map, Value};
use thiserror::Error;

/// Longest line accepted before the decoder gives up on it.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Terminator appended to every outbound frame.
pub const FRAME_TERMINATOR: &[u8] = b"\r\n";

/// Errors that can occur during frame encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// No complete line is buffered yet.
    #[error("insufficient data: {buffered} bytes buffered without a line terminator")]
    InsufficientData { buffered: usize },

    /// A complete line was buffered but failed the integrity check.
    #[error("malformed frame ({consumed} bytes dropped): {reason}")]
    MalformedFrame { reason: String, consumed: usize },

    /// The buffered line exceeds [`MAX_FRAME_LEN`].
    #[error("frame exceeds {limit} bytes ({consumed} bytes dropped)")]
    Oversized { limit: usize, consumed: usize },

    /// A structurally valid frame carried an unusable payload.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The outbound payload could not be serialised.
    #[error("encode failed: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Number of buffered bytes the caller must drop to resynchronise, if any.
    pub fn resync_len(&self) -> Option<usize> {
        match self {
            ProtocolError::MalformedFrame { consumed, .. }
            | ProtocolError::Oversized { consumed, .. } => Some(*consumed),
            _ => None,
        }
    }
}

/// A single decoded frame: a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    fields: Map<String, Value>,
}

impl Frame {
    /// Wraps an already-built JSON object.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Builds a frame from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedPayload`] if `value` is not an object.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(ProtocolError::MalformedPayload(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// The message type tag (`t`, falling back to `type`), lower-cased.
    ///
    /// Frames without a tag report the empty string, which the controllers
    /// use for plain acknowledgements.
    pub fn message_type(&self) -> String {
        self.fields
            .get("t")
            .or_else(|| self.fields.get("type"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase()
    }

    /// Compact single-line rendering without the terminator.
    pub fn to_line(&self) -> String {
        Value::Object(self.fields.clone()).to_string()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`Frame`] into one `\r\n`-terminated line.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if serialisation fails.
///
/// # Examples
///
/// ```rust
/// use ledlink_core::protocol::frame::{decode_frame, encode_frame, Frame};
/// use serde_json::json;
///
/// let frame = Frame::from_value(json!({"cm": "status"})).unwrap();
/// let bytes = encode_frame(&frame).unwrap();
/// assert_eq!(bytes, b"{\"cm\":\"status\"}\r\n");
/// let (decoded, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(decoded, frame);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(&frame.fields)
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    buf.extend_from_slice(FRAME_TERMINATOR);
    Ok(buf)
}

/// Decodes one [`Frame`] from the beginning of `bytes`.
///
/// Leading blank lines are skipped.  Returns the frame and the number of bytes
/// consumed (including skipped blank lines and the terminator).
///
/// # Errors
///
/// - [`ProtocolError::InsufficientData`] when no complete line is buffered.
/// - [`ProtocolError::MalformedFrame`] / [`ProtocolError::Oversized`] when the
///   next line must be discarded; see [`ProtocolError::resync_len`].
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), ProtocolError> {
    let mut offset = 0;

    loop {
        let rest = &bytes[offset..];
        let Some(newline) = rest.iter().position(|b| *b == b'\n') else {
            if rest.len() > MAX_FRAME_LEN {
                return Err(ProtocolError::Oversized {
                    limit: MAX_FRAME_LEN,
                    consumed: bytes.len(),
                });
            }
            return Err(ProtocolError::InsufficientData {
                buffered: bytes.len(),
            });
        };

        let consumed = offset + newline + 1;
        if newline > MAX_FRAME_LEN {
            return Err(ProtocolError::Oversized {
                limit: MAX_FRAME_LEN,
                consumed,
            });
        }

        let line = trim_line(&rest[..newline]);
        if line.is_empty() {
            offset = consumed;
            continue;
        }

        return match decode_line(line) {
            Ok(frame) => Ok((frame, consumed)),
            Err(reason) => Err(ProtocolError::MalformedFrame { reason, consumed }),
        };
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end]
}

fn decode_line(line: &[u8]) -> Result<Frame, String> {
    let text = std::str::from_utf8(line).map_err(|e| format!("invalid UTF-8: {e}"))?;
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(fields)) => Ok(Frame::new(fields)),
        Ok(_) => Err("top-level JSON value is not an object".to_string()),
        Err(e) => Err(format!("invalid JSON: {e}")),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: Value) -> Frame {
        Frame::from_value(value).expect("object")
    }

    #[test]
    fn test_encode_appends_crlf_and_uses_compact_json() {
        // Arrange
        let f = frame(json!({"cm": "led", "a": "off"}));

        // Act
        let bytes = encode_frame(&f).expect("encode");

        // Assert
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.ends_with("\r\n"));
        assert!(!text.trim_end().contains(' '));
    }

    #[test]
    fn test_decode_accepts_bare_newline_terminator() {
        let (decoded, consumed) = decode_frame(b"{\"t\":\"ok\"}\n").expect("decode");
        assert_eq!(decoded.message_type(), "ok");
        assert_eq!(consumed, 11);
    }

    #[test]
    fn test_decode_without_terminator_reports_insufficient_data() {
        let err = decode_frame(b"{\"t\":\"sta").unwrap_err();
        assert_eq!(err, ProtocolError::InsufficientData { buffered: 9 });
        assert_eq!(err.resync_len(), None);
    }

    #[test]
    fn test_decode_skips_blank_lines_before_frame() {
        // Arrange
        let bytes = b"\r\n   \n{\"t\":\"status\"}\r\n";

        // Act
        let (decoded, consumed) = decode_frame(bytes).expect("decode");

        // Assert
        assert_eq!(decoded.message_type(), "status");
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_decode_corrupt_line_reports_resync_length_then_next_frame_decodes() {
        // Arrange: a line garbled in transit followed by a good one
        let bytes = b"{\"t\":\"ev\x00nt\",,}\r\n{\"t\":\"ok\"}\r\n";

        // Act
        let err = decode_frame(bytes).unwrap_err();
        let skip = err.resync_len().expect("resync length");
        let (decoded, _) = decode_frame(&bytes[skip..]).expect("decode after resync");

        // Assert
        assert!(matches!(err, ProtocolError::MalformedFrame { .. }));
        assert_eq!(decoded.message_type(), "ok");
    }

    #[test]
    fn test_decode_rejects_non_object_json() {
        let err = decode_frame(b"[1,2,3]\n").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedFrame { consumed: 8, .. }));
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        let err = decode_frame(b"{\"t\":\"\xff\"}\n").unwrap_err();
        match err {
            ProtocolError::MalformedFrame { reason, .. } => assert!(reason.contains("UTF-8")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_unterminated_oversized_line_is_dropped_entirely() {
        let bytes = vec![b'x'; MAX_FRAME_LEN + 1];
        let err = decode_frame(&bytes).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Oversized {
                limit: MAX_FRAME_LEN,
                consumed: MAX_FRAME_LEN + 1
            }
        );
    }

    #[test]
    fn test_message_type_falls_back_to_type_key_and_lowercases() {
        assert_eq!(frame(json!({"type": "Success"})).message_type(), "success");
        assert_eq!(frame(json!({"ok": true})).message_type(), "");
    }

    #[test]
    fn test_from_value_rejects_scalars() {
        assert!(matches!(
            Frame::from_value(json!(5)),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }
}
