//! Client/server envelope schema and JSON codec.
//!
//! Every message crossing the WS boundary is a flat envelope:
//! `{"type": ..., "session_id": ..., "request_id": ..., "payload": {...}}`.
//! Unknown top-level fields are preserved on parse but ignored by the
//! gateway.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const KEY_TYPE: &str = "type";
pub const KEY_SESSION_ID: &str = "session_id";
pub const KEY_REQUEST_ID: &str = "request_id";
pub const KEY_PAYLOAD: &str = "payload";

pub const UNKNOWN_SESSION_ID: &str = "unknown";
pub const UNKNOWN_REQUEST_ID: &str = "unknown";

/// A parsed client-or-server envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub msg_type: String,
    pub session_id: String,
    pub request_id: String,
    pub payload: Value,
}

/// Why an incoming text frame failed to parse into an [`Envelope`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvalidMessage {
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("message must be a JSON object")]
    NotAnObject,
    #[error("message missing non-empty 'type'")]
    MissingType,
    #[error("message missing non-empty 'session_id'")]
    MissingSessionId,
    #[error("message missing non-empty 'request_id'")]
    MissingRequestId,
    #[error("message 'payload' must be an object")]
    InvalidPayload,
}

/// Parse a raw text frame into an [`Envelope`].
///
/// Non-object root, non-string/empty `type`/`session_id`/`request_id`, and
/// non-object `payload` are all rejected. A `null` payload is coerced to
/// `{}`; a missing payload key is likewise treated as `{}`.
pub fn parse(text: &str) -> Result<Envelope, InvalidMessage> {
    let value: Value = serde_json::from_str(text).map_err(|e| InvalidMessage::Json(e.to_string()))?;
    let obj = value.as_object().ok_or(InvalidMessage::NotAnObject)?;

    let msg_type = obj
        .get(KEY_TYPE)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(InvalidMessage::MissingType)?
        .to_string();

    let session_id = obj
        .get(KEY_SESSION_ID)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(InvalidMessage::MissingSessionId)?
        .to_string();

    let request_id = obj
        .get(KEY_REQUEST_ID)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(InvalidMessage::MissingRequestId)?
        .to_string();

    let payload = match obj.get(KEY_PAYLOAD) {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(_) => return Err(InvalidMessage::InvalidPayload),
    };

    Ok(Envelope {
        msg_type,
        session_id,
        request_id,
        payload,
    })
}

/// Serialize a server-originated envelope to a JSON text frame.
pub fn serialize(msg_type: &str, session_id: &str, request_id: &str, payload: Value) -> String {
    #[derive(Serialize)]
    struct Wire<'a> {
        #[serde(rename = "type")]
        msg_type: &'a str,
        session_id: &'a str,
        request_id: &'a str,
        payload: Value,
    }
    serde_json::to_string(&Wire {
        msg_type,
        session_id,
        request_id,
        payload,
    })
    .expect("envelope serialization cannot fail")
}

/// Typed payload for `input_audio_buffer.commit`.
#[derive(Debug, Clone, Deserialize)]
pub struct CommitPayload {
    #[serde(default)]
    pub r#final: bool,
}

/// Typed payload for `input_audio_buffer.append`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppendPayload {
    pub audio: String,
}

/// Typed payload for `session.update`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SessionUpdatePayload {
    pub model: Option<String>,
}

/// Typed payload for `cancel`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CancelPayload {
    pub reason: Option<String>,
}
