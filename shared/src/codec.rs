//! JSON codec for push-channel messages
//!
//! Inbound messages are JSON objects whose required `action_type` selects
//! the payload shape:
//! ```text
//! {"action_type": "job",   "name": ..., "command": ..., ...}
//! {"action_type": "queue", "name": ..., "jobs": "a,b", ...}
//! ```
//! Outbound messages are `{"response": <string>}`.

use serde_json::Value;
use thiserror::Error;

use crate::{PushMessage, PushResponse};

/// Maximum inbound message size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Message too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),

    #[error("Message is not a JSON object")]
    NotAnObject,

    #[error("Message has no action_type")]
    MissingActionType,

    #[error("Unknown action type: {0}")]
    UnknownActionType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode an inbound push message
pub fn decode(text: &str) -> Result<PushMessage, CodecError> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(text.len()));
    }

    let value: Value = serde_json::from_str(text)?;
    let object = value.as_object().ok_or(CodecError::NotAnObject)?;

    let action = object
        .get("action_type")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingActionType)?
        .to_string();

    match action.as_str() {
        "job" => Ok(PushMessage::Job(serde_json::from_value(value)?)),
        "queue" => Ok(PushMessage::Queue(serde_json::from_value(value)?)),
        _ => Err(CodecError::UnknownActionType(action)),
    }
}

/// Encode an outbound response message
pub fn encode_response(output: &str) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&PushResponse {
        response: output.to_string(),
    })?)
}
