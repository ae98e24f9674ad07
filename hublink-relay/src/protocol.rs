//! JSON message protocol spoken on the relay socket.
//!
//! Inbound frames are JSON objects. An optional `type` field selects how the
//! relay records the message before fanning it out:
//!
//! ```text
//! type               recorded as
//! ─────────────────  ──────────────────────────────────────────────
//! "operation"        new pending Operation (+ info log)
//! "operation_status" status update of an existing Operation (+ log)
//! "log"              DeviceLog
//! anything else      nothing (broadcast only)
//! ```
//!
//! Every inbound object is forwarded to the other room members with
//! `instanceId` and `timestamp` merged in. Unknown fields pass through.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use hublink_store::{LogLevel, Operation, OperationStatus};
use serde::Serialize;
use serde_json::{Map, Value};

/// Pre-serialized outbound text frame, shared between all recipients.
pub type Frame = Arc<str>;

/// Operation type used when an `operation` message names none.
pub const DEFAULT_OPERATION_TYPE: &str = "command";

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Invalid JSON: expected an object")]
    NotAnObject,
    #[error("Invalid JSON: payload is not UTF-8")]
    NotUtf8,
}

/// Classification of an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Request for a device action.
    Operation {
        operation_type: String,
        action: String,
        payload: Option<Value>,
    },
    /// Outcome report for an earlier operation.
    OperationStatus {
        operation_id: String,
        status: OperationStatus,
        /// Only kept for `failed`.
        error: Option<String>,
    },
    Log {
        level: LogLevel,
        message: String,
        metadata: Option<Value>,
    },
    /// Anything else, including objects without `type`.
    Generic,
}

/// A parsed inbound object together with its classification.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub raw: Map<String, Value>,
    pub kind: InboundMessage,
}

impl Inbound {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        match serde_json::from_str::<Value>(text)? {
            Value::Object(raw) => {
                let kind = InboundMessage::classify(&raw);
                Ok(Self { raw, kind })
            }
            _ => Err(ProtocolError::NotAnObject),
        }
    }

    /// Parse a binary frame carrying UTF-8 JSON.
    pub fn parse_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::NotUtf8)?;
        Self::parse(text)
    }

    /// The raw message as a JSON value (what interactions record).
    pub fn raw_value(&self) -> Value {
        Value::Object(self.raw.clone())
    }
}

impl InboundMessage {
    /// Classify by the `type` discriminator. Never fails: messages missing a
    /// required companion field fall back to [`InboundMessage::Generic`].
    pub fn classify(raw: &Map<String, Value>) -> Self {
        match raw.get("type").and_then(Value::as_str) {
            Some("operation") => Self::Operation {
                operation_type: string_field(raw, "operationType")
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| DEFAULT_OPERATION_TYPE.to_string()),
                action: string_field(raw, "action").unwrap_or_default(),
                payload: value_field(raw, "payload"),
            },
            Some("operation_status") => {
                let operation_id = string_field(raw, "operationId");
                let status = raw
                    .get("status")
                    .and_then(Value::as_str)
                    .and_then(OperationStatus::parse);
                match (operation_id, status) {
                    (Some(operation_id), Some(status)) => Self::OperationStatus {
                        operation_id,
                        status,
                        error: string_field(raw, "error")
                            .filter(|_| status == OperationStatus::Failed),
                    },
                    _ => Self::Generic,
                }
            }
            Some("log") => Self::Log {
                level: raw
                    .get("level")
                    .and_then(Value::as_str)
                    .and_then(LogLevel::parse)
                    .unwrap_or(LogLevel::Info),
                message: string_field(raw, "message").unwrap_or_default(),
                metadata: value_field(raw, "metadata"),
            },
            _ => Self::Generic,
        }
    }
}

/// Strings as-is, other scalars stringified, null/absent as `None`.
fn string_field(raw: &Map<String, Value>, key: &str) -> Option<String> {
    match raw.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn value_field(raw: &Map<String, Value>, key: &str) -> Option<Value> {
    raw.get(key).filter(|v| !v.is_null()).cloned()
}

/// RFC 3339 with millisecond precision and a `Z` suffix.
pub fn iso_timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Build the outbound envelope: inbound fields plus `instanceId` and
/// `timestamp`. The relay's values win over same-named inbound fields.
pub fn enrich(raw: &Map<String, Value>, instance_id: &str, now: DateTime<Utc>) -> Map<String, Value> {
    let mut envelope = raw.clone();
    envelope.insert("instanceId".to_string(), Value::String(instance_id.to_string()));
    envelope.insert("timestamp".to_string(), Value::String(iso_timestamp(now)));
    envelope
}

/// Encode an envelope as a shareable frame.
pub fn encode_envelope(envelope: &Map<String, Value>) -> Result<Frame, ProtocolError> {
    Ok(Arc::from(serde_json::to_string(envelope)?))
}

/// Messages the server sends to a single connection.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    ConnectionAck {
        #[serde(rename = "deviceId")]
        device_id: String,
        timestamp: String,
        message: String,
    },
    /// Backlog hint sent on join.
    LastOperation { data: Operation, timestamp: String },
}

impl Notice {
    pub fn connection_ack(device_id: &str, now: DateTime<Utc>) -> Self {
        Self::ConnectionAck {
            device_id: device_id.to_string(),
            timestamp: iso_timestamp(now),
            message: format!("Connected to device {device_id}"),
        }
    }

    pub fn last_operation(op: Operation, now: DateTime<Utc>) -> Self {
        Self::LastOperation {
            data: op,
            timestamp: iso_timestamp(now),
        }
    }

    pub fn encode(&self) -> Result<Frame, ProtocolError> {
        Ok(Arc::from(serde_json::to_string(self)?))
    }
}

/// `{"error": "..."}` reply to a sender.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorNotice {
    pub error: String,
}

impl ErrorNotice {
    pub fn invalid_json() -> Self {
        Self {
            error: "Invalid JSON".to_string(),
        }
    }

    pub fn encode(&self) -> Result<Frame, ProtocolError> {
        Ok(Arc::from(serde_json::to_string(self)?))
    }
}

/// Extract the room id from a connection query string.
///
/// `deviceId` takes precedence over `instanceId`; empty values count as
/// missing.
pub fn room_id_from_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    let mut instance_id = None;
    let mut device_id = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if value.is_empty() {
            continue;
        }
        match key.as_ref() {
            "deviceId" => device_id = Some(value.into_owned()),
            "instanceId" => instance_id = Some(value.into_owned()),
            _ => {}
        }
    }
    device_id.or(instance_id)
}
