//! JSON frame codec.
//!
//! One frame per WebSocket message. Decoding is strict about the `type` tag
//! and lenient about missing optional fields; anything that does not decode
//! into a [`Frame`] is a protocol error that callers log and discard.
//!
//! # Example
//!
//! ```
//! use relaywire::protocol::{Frame, FrameCodec};
//!
//! let frame = FrameCodec::decode(r#"{"type":"heartbeat","timestamp":17}"#).unwrap();
//! assert_eq!(frame, Frame::Heartbeat { timestamp: 17 });
//!
//! let text = FrameCodec::encode(&frame).unwrap();
//! assert!(text.contains(r#""type":"heartbeat""#));
//! ```

use crate::error::{RelaywireError, Result};

use super::Frame;

/// Encoder/decoder for control-channel frames.
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame as a single-line JSON object.
    #[inline]
    pub fn encode(frame: &Frame) -> Result<String> {
        Ok(serde_json::to_string(frame)?)
    }

    /// Decode a text message into a frame.
    ///
    /// # Errors
    ///
    /// Returns [`RelaywireError::Protocol`] for undecodable JSON or an
    /// unrecognized `type`.
    pub fn decode(text: &str) -> Result<Frame> {
        serde_json::from_str(text)
            .map_err(|e| RelaywireError::Protocol(format!("malformed frame: {e}")))
    }

    /// Decode a binary message carrying UTF-8 JSON.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Frame> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| RelaywireError::Protocol(format!("frame is not UTF-8: {e}")))?;
        Self::decode(text)
    }
}
