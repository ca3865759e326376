//! Control Channel Protocol
//!
//! Turns the raw data channel into typed message exchange: the `client-ready`
//! handshake on open, best-effort outbound sends, and inbound decoding that
//! never lets a bad payload escape as an error.

use crate::transport::{ChannelState, ControlChannel};
use parley_protocol::{ClientAbout, ClientReady, InboundMessage, OutboundMessage};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ControlProtocol {
    channel: Arc<dyn ControlChannel>,
    about: ClientAbout,
    handshake_sent: bool,
}

impl ControlProtocol {
    pub fn new(channel: Arc<dyn ControlChannel>, about: ClientAbout) -> Self {
        Self {
            channel,
            about,
            handshake_sent: false,
        }
    }

    pub fn handshake_sent(&self) -> bool {
        self.handshake_sent
    }

    /// Sends the `client-ready` handshake. Only the first call does anything.
    pub async fn on_open(&mut self) -> bool {
        if self.handshake_sent {
            debug!("Control channel reported open again; handshake already sent");
            return false;
        }
        let ready = OutboundMessage::ClientReady(ClientReady::new(self.about.clone()));
        self.handshake_sent = self.transmit(ready).await;
        if self.handshake_sent {
            info!("Sent client-ready handshake");
        }
        self.handshake_sent
    }

    /// Sends a message if the channel is open and the handshake went out first.
    ///
    /// Nothing is queued or retried; the return value only says whether the
    /// message was handed to the channel.
    pub async fn send(&self, message: OutboundMessage) -> bool {
        if !self.handshake_sent {
            debug!(
                message_type = message.message_type(),
                "Dropping outbound message sent before the handshake"
            );
            return false;
        }
        self.transmit(message).await
    }

    async fn transmit(&self, message: OutboundMessage) -> bool {
        let message_type = message.message_type().to_string();
        if self.channel.state() != ChannelState::Open {
            debug!(%message_type, "Dropping outbound message; control channel is not open");
            return false;
        }
        let payload = match message.into_envelope().and_then(|envelope| envelope.to_json()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%message_type, error = %e, "Failed to encode outbound message");
                return false;
            }
        };
        match self.channel.send_text(payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!(%message_type, error = %e, "Failed to send outbound message");
                false
            }
        }
    }

    /// Decodes an inbound payload. Undecodable payloads are logged and dropped.
    pub fn receive(&self, payload: &str) -> Option<InboundMessage> {
        match InboundMessage::decode(payload) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(error = %e, "Discarding undecodable control message");
                None
            }
        }
    }

    pub async fn close(&self) {
        if self.channel.state() != ChannelState::Closed {
            self.channel.close().await;
        }
    }
}
