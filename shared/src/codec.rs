//! JSON codec for WebSocket text frames
//!
//! WebSocket already preserves message boundaries, so a frame is exactly one
//! JSON document:
//! ```text
//! [ one WebSocket text message ] == [ one type-tagged JSON object ]
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Maximum frame size (64 KiB); lock frames are tiny, anything larger is abuse
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("Empty frame")]
    Empty,

    #[error("Frame is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encode a frame into a JSON text message
pub fn encode<T: Serialize>(frame: &T) -> Result<String, CodecError> {
    let text = serde_json::to_string(frame)?;

    if text.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(text.len()));
    }

    Ok(text)
}

/// Decode a JSON text message into a frame
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(text.len()));
    }

    if text.trim().is_empty() {
        return Err(CodecError::Empty);
    }

    Ok(serde_json::from_str(text)?)
}

/// Decode a binary message carrying UTF-8 JSON
///
/// Some device firmwares send JSON in binary WebSocket messages.
pub fn decode_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(bytes.len()));
    }

    decode(std::str::from_utf8(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeviceFrame, DeviceHello, PingFrame, ServerFrame};

    #[test]
    fn test_encode_decode() {
        let text = encode(&ServerFrame::Ping(PingFrame { timestamp: 10 })).expect("encode failed");
        assert_eq!(text, r#"{"type":"PING","timestamp":10}"#);

        let frame: DeviceFrame = decode(r#"{"type":"HELLO","deviceId":"lock-7"}"#).expect("decode failed");
        assert_eq!(
            frame,
            DeviceFrame::Hello(DeviceHello {
                device_id: "lock-7".into()
            })
        );
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let result = decode::<DeviceFrame>(r#"{"type":"SELF_DESTRUCT"}"#);
        assert!(matches!(result, Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let result = decode::<DeviceFrame>(r#"{"type":"ACK","commandId":"c1"}"#);
        assert!(matches!(result, Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_empty_frame() {
        assert!(matches!(decode::<DeviceFrame>("   "), Err(CodecError::Empty)));
    }

    #[test]
    fn test_frame_too_large() {
        let huge = "x".repeat(MAX_FRAME_SIZE + 1);
        let result = decode::<DeviceFrame>(&huge);
        assert!(matches!(result, Err(CodecError::FrameTooLarge(_))));
    }

    #[test]
    fn test_binary_frames() {
        let frame: DeviceFrame = decode_bytes(br#"{"type":"PONG"}"#).expect("decode failed");
        assert_eq!(frame, DeviceFrame::Pong);

        let result = decode_bytes::<DeviceFrame>(&[0xff, 0xfe]);
        assert!(matches!(result, Err(CodecError::InvalidUtf8(_))));
    }
}
