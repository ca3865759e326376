use crate::LABEL;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Errors raised while turning a data-channel payload into a typed message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unexpected message label `{0}`")]
    ForeignLabel(String),
    #[error("invalid data for `{message_type}`: {source}")]
    InvalidData {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The envelope wrapping every message on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Unique per outbound message. Server-pushed events usually omit it.
    #[serde(default)]
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl ControlMessage {
    /// Wraps a `{type, data}` pair with a freshly generated id and the RTVI label.
    pub fn new(message_type: impl Into<String>, data: Value) -> Self {
        let data = if data.is_null() { empty_object() } else { data };
        Self {
            id: Uuid::new_v4().to_string(),
            label: LABEL.to_string(),
            message_type: message_type.into(),
            data,
        }
    }

    /// Parses a text payload into an envelope, rejecting envelopes that belong
    /// to another protocol sharing the channel.
    pub fn parse(payload: &str) -> Result<Self, DecodeError> {
        let message: ControlMessage = serde_json::from_str(payload)?;
        if message.label != LABEL {
            return Err(DecodeError::ForeignLabel(message.label));
        }
        Ok(message)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
