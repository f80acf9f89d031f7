//! Wire message shapes and classification.
//!
//! Frames are classified by shape rather than by an explicit tag:
//!
//! - `{"type": "stream-init", ...}` / `{"type": "stream-init-ack", ...}`
//! - has `method`, no `result` → request
//! - has `result`, no `method` → response
//!
//! Anything else is [`WireMessage::Unknown`]; the read loop logs and skips it.

use oroute_types::{Request, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// `type` tag of the stream-init handshake.
pub const STREAM_INIT: &str = "stream-init";
/// `type` tag of the stream-init acknowledgement.
pub const STREAM_INIT_ACK: &str = "stream-init-ack";

/// Role of a long-lived stream pushed by the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamRole {
    Reader,
    Writer,
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamRole::Reader => write!(f, "reader"),
            StreamRole::Writer => write!(f, "writer"),
        }
    }
}

impl StreamRole {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "reader" => Some(StreamRole::Reader),
            "writer" => Some(StreamRole::Writer),
            _ => None,
        }
    }
}

/// Stream-init handshake: designates the carrying stream as the
/// connection's reader or writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInit {
    #[serde(rename = "type")]
    pub kind: String,
    /// Raw role; unknown roles are answered with an error ack.
    pub role: String,
    pub connection_id: String,
}

impl StreamInit {
    pub fn new(role: StreamRole, connection_id: impl Into<String>) -> Self {
        Self {
            kind: STREAM_INIT.to_string(),
            role: role.to_string(),
            connection_id: connection_id.into(),
        }
    }

    /// The parsed role, if recognised.
    pub fn role(&self) -> Option<StreamRole> {
        StreamRole::parse(&self.role)
    }
}

/// Outcome reported by a stream-init acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Error,
}

/// Reply to a [`StreamInit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInitAck {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: AckStatus,
    pub stream_id: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl StreamInitAck {
    pub fn success(stream_id: impl Into<String>, role: StreamRole) -> Self {
        Self {
            kind: STREAM_INIT_ACK.to_string(),
            status: AckStatus::Success,
            stream_id: stream_id.into(),
            role: role.to_string(),
            error: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn error(
        stream_id: impl Into<String>,
        role: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            kind: STREAM_INIT_ACK.to_string(),
            status: AckStatus::Error,
            stream_id: stream_id.into(),
            role: role.into(),
            error: Some(error.into()),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone)]
pub enum WireMessage {
    Request(Request),
    Response(Response),
    StreamInit(StreamInit),
    StreamInitAck(StreamInitAck),
    /// Valid JSON of an unrecognised shape.
    Unknown(Value),
}

impl WireMessage {
    /// Classify a decoded JSON payload by shape.
    pub fn classify(value: Value) -> Self {
        let kind = value.get("type").and_then(Value::as_str);
        if kind == Some(STREAM_INIT) {
            return serde_json::from_value(value.clone())
                .map(WireMessage::StreamInit)
                .unwrap_or(WireMessage::Unknown(value));
        }
        if kind == Some(STREAM_INIT_ACK) {
            return serde_json::from_value(value.clone())
                .map(WireMessage::StreamInitAck)
                .unwrap_or(WireMessage::Unknown(value));
        }

        let has_method = value.get("method").is_some();
        let has_result = value.get("result").is_some();
        match (has_method, has_result) {
            (true, false) => serde_json::from_value(value.clone())
                .map(WireMessage::Request)
                .unwrap_or(WireMessage::Unknown(value)),
            (false, true) => serde_json::from_value(value.clone())
                .map(WireMessage::Response)
                .unwrap_or(WireMessage::Unknown(value)),
            _ => WireMessage::Unknown(value),
        }
    }
}
