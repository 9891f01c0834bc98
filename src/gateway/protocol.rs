//! Gateway wire protocol
//!
//! JSON frames over the persistent socket. The set is closed: an unknown
//! `type` tag or an extra field is a protocol violation, not something to
//! skip over.

use serde::{Deserialize, Serialize};

/// Frames the browser sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ClientFrame {
    /// Keystroke bytes, forwarded verbatim.
    Input { data: String },
    /// New viewport dimensions; re-sent on every layout change and once
    /// right after `connected`.
    Resize { rows: u16, cols: u16 },
}

/// Frames the relay sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ServerFrame {
    /// Human-readable banner sent once the channel is bound.
    Connected { message: String },
    /// Shell bytes to render, in production order.
    Output { data: String },
    /// Fatal, session-ending.
    Error { message: String },
}

#[derive(Debug, thiserror::Error)]
#[error("malformed frame: {0}")]
pub struct FrameError(String);

pub fn decode_client_frame(text: &str) -> Result<ClientFrame, FrameError> {
    serde_json::from_str(text).map_err(|e| FrameError(e.to_string()))
}

pub fn decode_server_frame(text: &str) -> Result<ServerFrame, FrameError> {
    serde_json::from_str(text).map_err(|e| FrameError(e.to_string()))
}

impl ServerFrame {
    pub fn encode(&self) -> String {
        // Infallible for these shapes; the fallback never fires in practice.
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","message":"frame encoding failed"}"#.to_string())
    }
}

impl ClientFrame {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
