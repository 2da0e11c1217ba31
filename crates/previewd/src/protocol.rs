use crate::analyzer::Selector;
use crate::transport::InputEvent;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Frames larger than this are rejected with a `ProtocolError`.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Device coordinates accepted on stream commands; either an explicit
/// udid or a device-type/runtime pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_id: Option<String>,
}

/// One command line on stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    AddStream {
        request_id: String,
        stream_id: String,
        file: PathBuf,
        #[serde(flatten)]
        device: DeviceFields,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<Selector>,
    },
    RemoveStream {
        request_id: String,
        stream_id: String,
    },
    ReplaceAllStreams {
        request_id: String,
        stream_id: String,
        file: PathBuf,
        #[serde(flatten)]
        device: DeviceFields,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<Selector>,
    },
    SendInput {
        stream_id: String,
        event: InputEvent,
    },
    NextPreview {
        stream_id: String,
    },
    ChangeDevice {
        request_id: String,
        stream_id: String,
        #[serde(flatten)]
        device: DeviceFields,
    },
}

/// Lifecycle phase surfaced on `StreamStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusPhase {
    Building,
    Booting,
    Launching,
    Running,
    Rebuilding,
    CompileError,
}

/// One event line on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    StreamStarted {
        stream_id: String,
        device: String,
        preview_title: String,
    },
    Frame {
        stream_id: String,
        frame: FramePayload,
    },
    StreamStatus {
        stream_id: String,
        phase: StatusPhase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diagnostic: Option<String>,
    },
    StreamStopped {
        stream_id: String,
        reason: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diagnostic: Option<String>,
    },
    ProtocolError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message: String,
    },
}

/// Base64 frame payload; bytes are opaque to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramePayload {
    pub data: String,
}

impl Event {
    pub fn stream_id(&self) -> Option<&str> {
        match self {
            Event::StreamStarted { stream_id, .. }
            | Event::Frame { stream_id, .. }
            | Event::StreamStatus { stream_id, .. }
            | Event::StreamStopped { stream_id, .. } => Some(stream_id),
            Event::ProtocolError { .. } => None,
        }
    }

    pub fn is_frame(&self) -> bool {
        matches!(self, Event::Frame { .. })
    }
}

/// Decodes one stdin line. Failures come back as the `ProtocolError`
/// event to emit, echoing the `request_id` when one is recoverable.
pub fn parse_command(line: &str) -> std::result::Result<Command, Event> {
    if line.len() > MAX_LINE_LEN {
        return Err(Event::ProtocolError {
            request_id: None,
            message: format!("line exceeds {} bytes", MAX_LINE_LEN),
        });
    }
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            return Err(Event::ProtocolError {
                request_id: None,
                message: format!("invalid JSON: {}", e),
            })
        }
    };
    let request_id = value
        .get("request_id")
        .and_then(|v| v.as_str())
        .map(String::from);
    serde_json::from_value(value).map_err(|e| Event::ProtocolError {
        request_id,
        message: format!("invalid command: {}", e),
    })
}

/// Encodes one event as a single JSON line (without the trailing newline;
/// the writer owns framing).
pub fn encode_event(event: &Event) -> String {
    serde_json::to_string(event).expect("events serialize infallibly")
}
