//! Messages received from the remote voice agent.

use crate::envelope::{ControlMessage, DecodeError};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Data of a `bot-ready` acknowledgment.
#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub struct BotReady {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub about: Option<Value>,
}

/// Data of a `user-transcription` event.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct UserTranscription {
    pub text: String,
    /// Interim results arrive with `final: false` and are never displayed.
    #[serde(rename = "final", default)]
    pub is_final: bool,
}

/// Data of the assistant text events (`bot-transcription`, `bot-tts-text`).
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TextPayload {
    pub text: String,
}

/// Data of an `error` event reported by the remote pipeline.
#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ErrorPayload {
    #[serde(rename = "error", default)]
    pub message: String,
    #[serde(default)]
    pub fatal: bool,
}

/// Every inbound message the client recognises.
///
/// Anything else decodes to [`InboundMessage::Unknown`] so that protocol
/// additions on the server never break an older client.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    BotReady(BotReady),
    UserStartedSpeaking,
    UserStoppedSpeaking,
    BotStartedSpeaking,
    BotStoppedSpeaking,
    UserTranscription(UserTranscription),
    /// A streamed fragment of the assistant reply.
    BotTranscription(TextPayload),
    /// The text handed to speech synthesis, published as-is.
    BotTtsText(TextPayload),
    Error(ErrorPayload),
    Unknown { message_type: String },
}

impl InboundMessage {
    /// Decodes a raw data-channel payload.
    pub fn decode(payload: &str) -> Result<Self, DecodeError> {
        Self::from_envelope(ControlMessage::parse(payload)?)
    }

    /// Interprets an already parsed envelope by its `type`.
    pub fn from_envelope(envelope: ControlMessage) -> Result<Self, DecodeError> {
        let ControlMessage {
            message_type, data, ..
        } = envelope;

        let message = match message_type.as_str() {
            "bot-ready" => Self::BotReady(data_as(&message_type, data)?),
            "user-started-speaking" => Self::UserStartedSpeaking,
            "user-stopped-speaking" => Self::UserStoppedSpeaking,
            "bot-started-speaking" => Self::BotStartedSpeaking,
            "bot-stopped-speaking" => Self::BotStoppedSpeaking,
            "user-transcription" => Self::UserTranscription(data_as(&message_type, data)?),
            "bot-transcription" => Self::BotTranscription(data_as(&message_type, data)?),
            "bot-tts-text" => Self::BotTtsText(data_as(&message_type, data)?),
            "error" => Self::Error(data_as(&message_type, data)?),
            _ => Self::Unknown {
                message_type: message_type.clone(),
            },
        };
        Ok(message)
    }

    /// The wire `type` this message was decoded from.
    pub fn message_type(&self) -> &str {
        match self {
            Self::BotReady(_) => "bot-ready",
            Self::UserStartedSpeaking => "user-started-speaking",
            Self::UserStoppedSpeaking => "user-stopped-speaking",
            Self::BotStartedSpeaking => "bot-started-speaking",
            Self::BotStoppedSpeaking => "bot-stopped-speaking",
            Self::UserTranscription(_) => "user-transcription",
            Self::BotTranscription(_) => "bot-transcription",
            Self::BotTtsText(_) => "bot-tts-text",
            Self::Error(_) => "error",
            Self::Unknown { message_type } => message_type,
        }
    }
}

fn data_as<T: DeserializeOwned>(message_type: &str, data: Value) -> Result<T, DecodeError> {
    serde_json::from_value(data).map_err(|source| DecodeError::InvalidData {
        message_type: message_type.to_string(),
        source,
    })
}
