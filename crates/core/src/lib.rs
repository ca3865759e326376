pub mod config;
pub mod connection;
pub mod control;
pub mod conversation;
pub mod display;
pub mod error;
pub mod presence;
pub mod signaling;
pub mod timer;
pub mod transcript;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{ClientConfig, ConfigError};
pub use connection::{IceGathering, SessionInfo, VoiceClient, wait_for_ice_gathering};
pub use display::{TranscriptDisplay, TranscriptPolicy, TranscriptView};
pub use error::{ConnectError, MediaError, NegotiationError, SignalingError, TransportError};
pub use presence::{PresenceState, PresenceTracker};
pub use signaling::{HttpSignalingGateway, SignalingAnswer, SignalingGateway};
pub use transcript::{Speaker, TranscriptAssembler, Utterance};
pub use transport::{
    AudioFrame, ChannelState, ControlChannel, LocalAudio, MediaDevices, PeerConfig,
    PeerConnection, PeerLink, PeerState, PeerTransport, PlaybackHandle, RemoteAudio, SdpKind,
    SessionDescription, TransportEvent,
};
