//! Protocol error types.

use thiserror::Error;

/// Errors raised while decoding the tagged binary format.
///
/// Every length-prefixed read is bounded against the remaining input, so a
/// malformed buffer surfaces as one of these instead of an out-of-bounds read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("empty input")]
    Empty,

    #[error("truncated input at offset {offset}: need {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("unknown type tag {tag:#04x} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },

    #[error("nesting exceeds {0} levels")]
    TooDeep(usize),
}

/// Protocol-level errors that can occur while handling inbound or outbound messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::Truncated {
            offset: 12,
            needed: 40,
            available: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("12"));
        assert!(msg.contains("40"));
        assert!(msg.contains('3'));

        let err = CodecError::UnknownTag {
            tag: b'Q',
            offset: 7,
        };
        assert!(err.to_string().contains("0x51"));

        assert!(CodecError::TooDeep(128).to_string().contains("128"));
        assert_eq!(CodecError::Empty.to_string(), "empty input");
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::Xml("unexpected end".to_string());
        assert!(err.to_string().contains("unexpected end"));

        let err = ProtocolError::MissingField("@id");
        assert!(err.to_string().contains("@id"));

        let err: ProtocolError = CodecError::Empty.into();
        assert!(err.to_string().contains("codec"));

        let err = ProtocolError::InvalidEnvelope("not an object".to_string());
        assert!(err.to_string().contains("not an object"));
    }
}
