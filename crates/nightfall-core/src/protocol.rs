use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

pub const TYPE_TELEMETRY: &str = "telemetry";
pub const TYPE_STATUS: &str = "status";
pub const TYPE_HAZARD_ALERT: &str = "hazard_alert";
pub const TYPE_PING: &str = "ping";
pub const TYPE_ACK: &str = "ack";
pub const TYPE_UI_CMD: &str = "ui_cmd";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("frame is not a json object")]
    NotAnObject,
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("frame encode failed: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Telemetry,
    Status,
    HazardAlert,
    Ping,
    Ack,
    Other(String),
}

impl FrameKind {
    pub fn from_type(value: &str) -> Self {
        match value {
            TYPE_TELEMETRY => FrameKind::Telemetry,
            TYPE_STATUS => FrameKind::Status,
            TYPE_HAZARD_ALERT => FrameKind::HazardAlert,
            TYPE_PING => FrameKind::Ping,
            TYPE_ACK => FrameKind::Ack,
            other => FrameKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FrameKind::Telemetry => TYPE_TELEMETRY,
            FrameKind::Status => TYPE_STATUS,
            FrameKind::HazardAlert => TYPE_HAZARD_ALERT,
            FrameKind::Ping => TYPE_PING,
            FrameKind::Ack => TYPE_ACK,
            FrameKind::Other(value) => value.as_str(),
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device frame that passed structural checks. The `type` and `ts` keys are
/// lifted out; everything else stays in `body` for the consumer of that kind.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub kind: FrameKind,
    pub ts: Option<f64>,
    pub body: Map<String, Value>,
}

impl InboundFrame {
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        serde_json::from_value(Value::Object(self.body.clone()))
            .map_err(|err| FrameError::Decode(err.to_string()))
    }
}

pub fn decode_inbound(text: &str, max_frame_bytes: usize) -> Result<InboundFrame, FrameError> {
    if text.len() > max_frame_bytes {
        return Err(FrameError::Oversized {
            size: text.len(),
            max: max_frame_bytes,
        });
    }
    let value: Value =
        serde_json::from_str(text).map_err(|err| FrameError::Decode(err.to_string()))?;
    let Value::Object(mut body) = value else {
        return Err(FrameError::NotAnObject);
    };
    let kind = match body.remove("type") {
        Some(Value::String(value)) => FrameKind::from_type(&value),
        _ => return Err(FrameError::MissingType),
    };
    let ts = body.remove("ts").and_then(|value| value.as_f64());
    Ok(InboundFrame { kind, ts, body })
}

/// `status` frames announce board roles coming up or degrading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StatusReport {
    pub role: String,
    pub status: String,
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HazardAlert {
    pub hazard: String,
    pub msg: String,
    pub critical: bool,
}

/// Outbound record `{type, ...payload}`. Payload keys are laid over the
/// envelope, so a same-named payload key replaces it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CommandRecord(Map<String, Value>);

impl CommandRecord {
    pub fn new(command_type: &str, payload: Map<String, Value>) -> Self {
        let mut fields = Map::new();
        fields.insert("type".to_string(), Value::String(command_type.to_string()));
        fields.extend(payload);
        Self(fields)
    }

    /// `{type: "ui_cmd", cmd, ...payload}`.
    pub fn ui_cmd(cmd: &str, payload: Map<String, Value>) -> Self {
        let mut fields = Map::new();
        fields.insert("cmd".to_string(), Value::String(cmd.to_string()));
        fields.extend(payload);
        Self::new(TYPE_UI_CMD, fields)
    }

    pub fn command_type(&self) -> &str {
        self.0.get("type").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn cmd(&self) -> Option<&str> {
        self.0.get("cmd").and_then(Value::as_str)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }
}

pub fn encode_record(record: &CommandRecord, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded =
        serde_json::to_string(record).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::Oversized {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}
