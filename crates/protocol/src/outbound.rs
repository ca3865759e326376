//! Messages sent by the client.

use crate::PROTOCOL_VERSION;
use crate::envelope::ControlMessage;
use serde::Serialize;
use serde_json::Value;

/// Identity of the client library, announced in the handshake.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ClientAbout {
    pub library: String,
    pub library_version: String,
    pub platform: String,
}

impl ClientAbout {
    /// Describes `library` at `library_version` running on the current OS.
    pub fn new(library: impl Into<String>, library_version: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            library_version: library_version.into(),
            platform: std::env::consts::OS.to_string(),
        }
    }
}

/// Data of the `client-ready` handshake.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ClientReady {
    pub version: String,
    pub about: ClientAbout,
}

impl ClientReady {
    pub fn new(about: ClientAbout) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            about,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Must be the first message sent once the channel opens.
    ClientReady(ClientReady),
    /// Any other `{type, data}` pair.
    Custom { message_type: String, data: Value },
}

impl OutboundMessage {
    pub fn message_type(&self) -> &str {
        match self {
            Self::ClientReady(_) => "client-ready",
            Self::Custom { message_type, .. } => message_type,
        }
    }

    /// Wraps the message into a full envelope with a fresh id.
    pub fn into_envelope(self) -> Result<ControlMessage, serde_json::Error> {
        match self {
            Self::ClientReady(ready) => Ok(ControlMessage::new(
                "client-ready",
                serde_json::to_value(ready)?,
            )),
            Self::Custom { message_type, data } => Ok(ControlMessage::new(message_type, data)),
        }
    }
}
