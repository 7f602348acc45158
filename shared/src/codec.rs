//! JSON text codec for channel frames
//!
//! Each WebSocket text frame holds exactly one JSON object, so there is no
//! framing layer here; decoding is parse-then-classify.

use serde_json::Value;
use thiserror::Error;

use crate::envelope::{Inbound, Outbound};

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload is not a JSON object (got {0})")]
    NotAnObject(&'static str),
}

/// Encode an outbound frame as JSON text
pub fn encode(message: &Outbound) -> Result<String, CodecError> {
    let text = match message {
        Outbound::Heartbeat(frame) => serde_json::to_string(frame)?,
        Outbound::Message(value) => serde_json::to_string(value)?,
    };
    Ok(text)
}

/// Decode and classify one inbound text frame
pub fn decode(text: &str) -> Result<Inbound, CodecError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(object) => Ok(Inbound::classify(object)),
        other => Err(CodecError::NotAnObject(kind_of(&other))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
