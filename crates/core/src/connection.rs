//! Connection Manager
//!
//! [`VoiceClient`] owns the lifecycle of the single voice session: it acquires
//! the microphone, negotiates the peer connection through the signaling
//! gateway, and then hands the live handles to a session task. That task is the
//! only place transport events are handled, one at a time and in order, until
//! the user disconnects or the transport drops.

use crate::config::ClientConfig;
use crate::control::ControlProtocol;
use crate::conversation::Conversation;
use crate::display::{TranscriptDisplay, TranscriptView};
use crate::error::{ConnectError, NegotiationError};
use crate::presence::{Phase, PresenceState, PresenceTracker, SpeechSignal};
use crate::signaling::SignalingGateway;
use crate::timer::sleep_until;
use crate::transport::{
    ChannelState, ControlChannel, MediaDevices, PeerConfig, PeerConnection, PeerLink, PeerState,
    PeerTransport, TransportEvent,
};
use parley_protocol::{ClientAbout, OutboundMessage};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};
use uuid::Uuid;

/// Identifies the session created by a successful `connect()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: Uuid,
    /// The server's identifier for the peer connection, when it sends one.
    pub pc_id: Option<String>,
}

/// Outcome of the ICE gathering race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGathering {
    Complete,
    TimedOut,
}

/// Waits for candidate gathering, giving up after `limit`.
///
/// Whichever side finishes first drops the other, so the wait never outlives
/// the timeout even if gathering never completes.
pub async fn wait_for_ice_gathering(
    connection: &dyn PeerConnection,
    limit: Duration,
) -> IceGathering {
    match tokio::time::timeout(limit, connection.ice_gathering_complete()).await {
        Ok(()) => IceGathering::Complete,
        Err(_) => IceGathering::TimedOut,
    }
}

enum SessionCommand {
    Send(OutboundMessage),
    Disconnect,
}

struct ActiveSession {
    info: SessionInfo,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

/// The voice-session client.
pub struct VoiceClient {
    config: ClientConfig,
    transport: Arc<dyn PeerTransport>,
    signaling: Arc<dyn SignalingGateway>,
    media: Arc<dyn MediaDevices>,
    about: ClientAbout,
    presence: Arc<PresenceTracker>,
    display: Arc<TranscriptDisplay>,
    active: Option<ActiveSession>,
}

impl VoiceClient {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn PeerTransport>,
        signaling: Arc<dyn SignalingGateway>,
        media: Arc<dyn MediaDevices>,
    ) -> Self {
        let display = Arc::new(TranscriptDisplay::new(config.transcript_policy));
        Self {
            config,
            transport,
            signaling,
            media,
            about: ClientAbout::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            presence: Arc::new(PresenceTracker::new()),
            display,
            active: None,
        }
    }

    pub fn presence(&self) -> watch::Receiver<PresenceState> {
        self.presence.subscribe()
    }

    pub fn presence_state(&self) -> PresenceState {
        self.presence.current()
    }

    pub fn transcript(&self) -> watch::Receiver<TranscriptView> {
        self.display.subscribe()
    }

    /// The current session, unless it has already ended.
    pub fn session(&self) -> Option<&SessionInfo> {
        self.active
            .as_ref()
            .filter(|session| !session.task.is_finished())
            .map(|session| &session.info)
    }

    pub fn is_active(&self) -> bool {
        self.session().is_some()
    }

    /// Starts a new voice session.
    ///
    /// Returns once the answer has been applied; the presence state moves to
    /// `Idle` when the transport reports the connection as established.
    #[instrument(skip_all)]
    pub async fn connect(&mut self) -> Result<SessionInfo, ConnectError> {
        if self.is_active() {
            warn!("Rejecting connect: a session is already active");
            return Err(ConnectError::AlreadyActive);
        }
        // A session that ended on its own still needs its task reaped.
        if let Some(stale) = self.active.take() {
            let _ = stale.task.await;
        }

        self.presence.set_phase(Phase::Connecting);
        info!("Connecting voice session");
        let mut attempt = AttemptGuard {
            presence: self.presence.clone(),
            armed: true,
        };

        match self.establish().await {
            Ok(session) => {
                attempt.armed = false;
                let info = session.info.clone();
                let (commands_tx, commands_rx) = mpsc::unbounded_channel();
                let span = info_span!("voice_session", session_id = %info.session_id);
                let task = tokio::spawn(session.run(commands_rx).instrument(span));
                self.active = Some(ActiveSession {
                    info: info.clone(),
                    commands: commands_tx,
                    task,
                });
                Ok(info)
            }
            Err(e) => {
                error!(error = %e, "Connect attempt failed");
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<Session, ConnectError> {
        let microphone = self.media.acquire_microphone().await?;
        debug!("Microphone acquired");

        let peer_config = PeerConfig {
            ice_servers: self.config.ice_servers.clone(),
            channel_label: self.config.channel_label.clone(),
        };
        let PeerLink {
            connection,
            channel,
            events,
        } = self
            .transport
            .open(&peer_config, microphone)
            .await
            .map_err(NegotiationError::from)?;

        let connection: Arc<dyn PeerConnection> = Arc::from(connection);
        let mut link = LinkGuard {
            channel: channel.clone(),
            connection: connection.clone(),
            armed: true,
        };
        let control = ControlProtocol::new(channel, self.about.clone());
        let pc_id = match self.negotiate(connection.as_ref()).await {
            Ok(pc_id) => pc_id,
            Err(e) => {
                control.close().await;
                connection.close().await;
                link.armed = false;
                return Err(e.into());
            }
        };
        link.armed = false;

        let info = SessionInfo {
            session_id: Uuid::new_v4(),
            pc_id,
        };
        info!(session_id = %info.session_id, pc_id = ?info.pc_id, "Remote answer applied");

        Ok(Session {
            info,
            connection,
            control,
            events,
            conversation: Conversation::new(
                self.presence.clone(),
                self.display.clone(),
                self.config.transcript_debounce,
                self.config.display_clear_delay,
            ),
            presence: self.presence.clone(),
            display: self.display.clone(),
            media: self.media.clone(),
            playback: None,
        })
    }

    async fn negotiate(
        &self,
        connection: &dyn PeerConnection,
    ) -> Result<Option<String>, NegotiationError> {
        connection.create_offer().await?;

        match wait_for_ice_gathering(connection, self.config.ice_gathering_timeout).await {
            IceGathering::Complete => debug!("ICE gathering complete"),
            IceGathering::TimedOut => warn!(
                timeout_ms = self.config.ice_gathering_timeout.as_millis() as u64,
                "ICE gathering timed out; sending the candidates gathered so far"
            ),
        }

        let offer = connection
            .local_description()
            .await
            .ok_or(NegotiationError::MissingLocalDescription)?;
        let answer = self.signaling.exchange(offer, None).await?;
        connection.set_remote_description(answer.description).await?;
        Ok(answer.pc_id)
    }

    /// Ends the current session. Does nothing when there is none.
    #[instrument(skip_all)]
    pub async fn disconnect(&mut self) {
        match self.active.take() {
            Some(session) => {
                let _ = session.commands.send(SessionCommand::Disconnect);
                if let Err(e) = session.task.await {
                    error!(error = %e, "Voice session task failed");
                }
            }
            None => debug!("Disconnect requested with no active session"),
        }
        // The session task already did this unless it died; repeating is a no-op.
        self.presence.signal(SpeechSignal::Reset);
        self.presence.set_phase(Phase::Disconnected);
    }

    /// Sends a `{type, data}` message over the control channel.
    ///
    /// Delivery is best effort: the message is dropped when no session is
    /// active or the channel is not open.
    pub fn send(&self, message_type: impl Into<String>, data: Value) {
        let message = OutboundMessage::Custom {
            message_type: message_type.into(),
            data,
        };
        match &self.active {
            Some(session) => {
                let _ = session.commands.send(SessionCommand::Send(message));
            }
            None => debug!(
                message_type = message.message_type(),
                "Dropping outbound message; no active session"
            ),
        }
    }
}

/// Puts presence back to `Disconnected` when a connect attempt fails or is
/// dropped before it completes.
struct AttemptGuard {
    presence: Arc<PresenceTracker>,
    armed: bool,
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if self.armed {
            self.presence.signal(SpeechSignal::Reset);
            self.presence.set_phase(Phase::Disconnected);
        }
    }
}

/// Closes a half-built link when `connect` is dropped during negotiation.
struct LinkGuard {
    channel: Arc<dyn ControlChannel>,
    connection: Arc<dyn PeerConnection>,
    armed: bool,
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let channel = self.channel.clone();
        let connection = self.connection.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!("Connect abandoned during negotiation; closing the link");
                runtime.spawn(async move {
                    if channel.state() != ChannelState::Closed {
                        channel.close().await;
                    }
                    connection.close().await;
                });
            }
            Err(_) => warn!("Connect abandoned outside the runtime; link not closed"),
        }
    }
}

#[derive(Debug)]
enum Teardown {
    Requested,
    Transport(PeerState),
    EventsEnded,
}

/// The live handles of one voice session, owned by its task.
struct Session {
    info: SessionInfo,
    connection: Arc<dyn PeerConnection>,
    control: ControlProtocol,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    conversation: Conversation,
    presence: Arc<PresenceTracker>,
    display: Arc<TranscriptDisplay>,
    media: Arc<dyn MediaDevices>,
    /// Opens the output device, then holds the playback handle until aborted.
    playback: Option<JoinHandle<()>>,
}

impl Session {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        info!("Voice session started");
        let reason = loop {
            let deadline = self.conversation.next_deadline();
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(SessionCommand::Send(message)) => {
                        self.control.send(message).await;
                    }
                    Some(SessionCommand::Disconnect) | None => break Teardown::Requested,
                },
                event = self.events.recv() => match event {
                    Some(event) => {
                        if let Some(reason) = self.handle_event(event).await {
                            break reason;
                        }
                    }
                    None => break Teardown::EventsEnded,
                },
                _ = sleep_until(deadline) => self.conversation.on_timer(),
            }
        };
        self.teardown(reason).await;
    }

    async fn handle_event(&mut self, event: TransportEvent) -> Option<Teardown> {
        match event {
            TransportEvent::ConnectionState(state) => match state {
                PeerState::Connected => {
                    info!("Peer connection established");
                    self.presence.set_phase(Phase::Connected);
                }
                PeerState::Disconnected | PeerState::Failed | PeerState::Closed => {
                    warn!(?state, "Peer connection lost");
                    return Some(Teardown::Transport(state));
                }
                PeerState::New | PeerState::Connecting => debug!(?state, "Peer connection state"),
            },
            TransportEvent::ChannelOpen => {
                self.control.on_open().await;
            }
            TransportEvent::ChannelMessage(payload) => {
                if let Some(message) = self.control.receive(&payload) {
                    self.conversation.apply(message);
                }
            }
            TransportEvent::ChannelClosed => info!("Control channel closed"),
            TransportEvent::RemoteAudio(remote) => {
                let media = self.media.clone();
                let playback = tokio::spawn(
                    async move {
                        match media.start_playback(remote).await {
                            Ok(_handle) => {
                                info!("Playing remote audio");
                                std::future::pending::<()>().await;
                            }
                            Err(e) => warn!(error = %e, "Could not play remote audio"),
                        }
                    }
                    .in_current_span(),
                );
                if let Some(previous) = self.playback.replace(playback) {
                    previous.abort();
                }
            }
        }
        None
    }

    async fn teardown(mut self, reason: Teardown) {
        self.conversation.shutdown();
        // Late callbacks now fail to send instead of reaching this session.
        self.events.close();
        self.control.close().await;
        self.connection.close().await;
        if let Some(playback) = self.playback.take() {
            // Aborting drops the handle, which releases the output device.
            playback.abort();
            let _ = playback.await;
        }

        self.display.clear_current();
        self.presence.signal(SpeechSignal::Reset);
        self.presence.set_phase(Phase::Disconnected);
        info!(?reason, "Voice session ended");
    }
}
