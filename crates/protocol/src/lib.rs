//! RTVI Control-Channel Protocol
//!
//! This crate defines the JSON messages exchanged with the remote voice agent
//! over the peer connection's data channel. Every message travels inside the
//! same envelope:
//!
//! ```json
//! { "id": "…", "label": "rtvi-ai", "type": "bot-ready", "data": { } }
//! ```
//!
//! - `envelope`: the raw [`ControlMessage`] wrapper shared by both directions.
//! - `inbound`: the closed set of messages the client understands, decoded
//!   into [`InboundMessage`] with an explicit `Unknown` arm.
//! - `outbound`: messages the client sends, starting with the `client-ready`
//!   handshake.

mod envelope;
mod inbound;
mod outbound;

pub use envelope::{ControlMessage, DecodeError};
pub use inbound::{BotReady, ErrorPayload, InboundMessage, TextPayload, UserTranscription};
pub use outbound::{ClientAbout, ClientReady, OutboundMessage};

/// The fixed label carried by every RTVI envelope.
pub const LABEL: &str = "rtvi-ai";

/// The protocol version announced in the `client-ready` handshake.
pub const PROTOCOL_VERSION: &str = "1.0.0";
