//! Wire envelope
//!
//! Every frame on the channel is a JSON object. Three shapes carry meaning:
//! ```text
//! {"type": "ping"}                      peer heartbeat probe, answer with pong
//! {"type": "pong"}                      heartbeat acknowledgment
//! {"event": "update", "data": {...}}    application update
//! ```
//! Anything else that parses is still traffic but is otherwise ignored.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fields that may hold an update's unique key, in precedence order
pub const KEY_FIELDS: [&str; 3] = ["unique_reference", "id", "event_id"];

/// Heartbeat frames, serialized as `{"type": "ping"}` / `{"type": "pong"}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HeartbeatFrame {
    Ping,
    Pong,
}

/// An application update that carries a unique key
#[derive(Debug, Clone, PartialEq)]
pub struct FeedUpdate {
    pub key: String,
    pub data: Value,
}

/// Classified inbound payload
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Peer heartbeat probe
    Ping,
    /// Heartbeat acknowledgment
    Pong,
    /// Keyed application update
    Update(FeedUpdate),
    /// Update whose data has none of the [`KEY_FIELDS`]
    UnkeyedUpdate(Value),
    /// Well-formed object with no known discriminator
    Other(Value),
}

/// Outbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Heartbeat(HeartbeatFrame),
    /// Caller-supplied application message, sent as-is
    Message(Value),
}

impl Inbound {
    /// Classify a decoded JSON object by its discriminator
    pub fn classify(object: Map<String, Value>) -> Self {
        match object.get("type").and_then(Value::as_str) {
            Some("pong") => return Inbound::Pong,
            Some("ping") => return Inbound::Ping,
            _ => {}
        }

        let is_update = object.get("event").and_then(Value::as_str) == Some("update");
        match object.get("data") {
            Some(Value::Object(data)) if is_update => match unique_key(data) {
                Some(key) => Inbound::Update(FeedUpdate {
                    key,
                    data: Value::Object(data.clone()),
                }),
                None => Inbound::UnkeyedUpdate(Value::Object(object)),
            },
            _ => Inbound::Other(Value::Object(object)),
        }
    }
}

/// Find the first usable key among [`KEY_FIELDS`].
///
/// A field is usable when its value is truthy: anything but `null`, `false`,
/// zero and the empty string. Falsy values fall through to the next field.
pub fn unique_key(data: &Map<String, Value>) -> Option<String> {
    KEY_FIELDS
        .iter()
        .filter_map(|field| data.get(*field))
        .find(|value| is_truthy(value))
        .map(key_string)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Render a key value the way the feed's producers stringify it, so that
/// `7` and `7.0` name the same record.
fn key_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e21 => {
                format!("{}", f as i128)
            }
            _ => n.to_string(),
        },
        Value::Array(items) => items
            .iter()
            .map(key_string)
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}
