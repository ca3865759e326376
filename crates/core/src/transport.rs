//! Peer Transport Abstraction
//!
//! The voice client never talks to a WebRTC stack directly. A [`PeerTransport`]
//! opens a [`PeerLink`]: the connection handle used for offer/answer, the
//! control channel handle, and one ordered stream of [`TransportEvent`]s that
//! carries every callback the stack produces. Dropping the event receiver is
//! enough to make sure no callback can reach a session that has been torn down.

use crate::error::{MediaError, TransportError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => write!(f, "offer"),
            SdpKind::Answer => write!(f, "answer"),
        }
    }
}

/// A local or remote session description.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpKind,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: SdpKind::Offer,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: SdpKind::Answer,
        }
    }
}

/// Aggregate connection state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Settings the transport needs to build a peer connection.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub ice_servers: Vec<String>,
    pub channel_label: String,
}

/// A block of mono PCM samples in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Captured microphone audio. Dropping it releases the capture device.
pub struct LocalAudio {
    frames: mpsc::Receiver<AudioFrame>,
    _capture: Box<dyn Send>,
}

impl LocalAudio {
    /// `capture` is whatever keeps the device open; it is dropped with the stream.
    pub fn new(frames: mpsc::Receiver<AudioFrame>, capture: impl Send + 'static) -> Self {
        Self {
            frames,
            _capture: Box::new(capture),
        }
    }

    pub async fn next_frame(&mut self) -> Option<AudioFrame> {
        self.frames.recv().await
    }
}

impl fmt::Debug for LocalAudio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalAudio").finish_non_exhaustive()
    }
}

/// Decoded audio arriving from the remote peer.
pub struct RemoteAudio {
    frames: mpsc::Receiver<AudioFrame>,
}

impl RemoteAudio {
    pub fn new(frames: mpsc::Receiver<AudioFrame>) -> Self {
        Self { frames }
    }

    pub async fn next_frame(&mut self) -> Option<AudioFrame> {
        self.frames.recv().await
    }
}

impl fmt::Debug for RemoteAudio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAudio").finish_non_exhaustive()
    }
}

/// Keeps remote audio playing until dropped.
pub struct PlaybackHandle {
    _output: Box<dyn Send>,
}

impl PlaybackHandle {
    pub fn new(output: impl Send + 'static) -> Self {
        Self {
            _output: Box::new(output),
        }
    }
}

/// Everything the transport reports, in the order it happened.
#[derive(Debug)]
pub enum TransportEvent {
    ConnectionState(PeerState),
    ChannelOpen,
    ChannelMessage(String),
    ChannelClosed,
    RemoteAudio(RemoteAudio),
}

/// The ordered, reliable control channel carried by the peer connection.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    fn state(&self) -> ChannelState;

    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Creates an offer and applies it as the local description, which starts
    /// ICE candidate gathering.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Resolves once candidate gathering is complete. May never resolve.
    async fn ice_gathering_complete(&self);

    /// The current local description, including the candidates gathered so far.
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn set_remote_description(
        &self,
        answer: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Closes the connection and detaches every callback.
    async fn close(&self);
}

/// The handles produced by [`PeerTransport::open`].
pub struct PeerLink {
    pub connection: Box<dyn PeerConnection>,
    pub channel: Arc<dyn ControlChannel>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Builds peer connections that send `microphone` as their outbound track.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn open(
        &self,
        config: &PeerConfig,
        microphone: LocalAudio,
    ) -> Result<PeerLink, TransportError>;
}

/// Audio devices on this machine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire_microphone(&self) -> Result<LocalAudio, MediaError>;

    /// Opens the output device and plays `remote` until the handle is dropped.
    async fn start_playback(&self, remote: RemoteAudio) -> Result<PlaybackHandle, MediaError>;
}
