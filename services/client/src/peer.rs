//! Peer transport backed by webrtc-rs.
//!
//! One peer connection carries a PCMU audio track in each direction and the
//! ordered control data channel. Every callback is translated into a
//! [`TransportEvent`] on a single queue so the session sees them in order.

use crate::audio::RateConverter;
use crate::g711::{self, PCMU_FRAME_SAMPLES, PCMU_SAMPLE_RATE};
use async_trait::async_trait;
use bytes::Bytes;
use parley_core::{
    AudioFrame, ChannelState, ControlChannel, LocalAudio, PeerConfig, PeerConnection, PeerLink,
    PeerState, PeerTransport, RemoteAudio, SessionDescription, TransportError, TransportEvent,
};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

const REMOTE_AUDIO_QUEUE_FRAMES: usize = 64;
const PACKET_DURATION: Duration = Duration::from_millis(20);

#[derive(Default)]
struct TaskList {
    handles: Vec<JoinHandle<()>>,
    closed: bool,
}

/// Background tasks of one peer connection, aborted together when it closes.
///
/// Tasks spawned after [`TaskSet::abort_all`] are aborted straight away, so a
/// late `on_track` callback cannot outlive the connection.
#[derive(Clone, Default)]
struct TaskSet(Arc<StdMutex<TaskList>>);

impl TaskSet {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut tasks = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.closed {
            handle.abort();
            return;
        }
        tasks.handles.retain(|task| !task.is_finished());
        tasks.handles.push(handle);
    }

    fn abort_all(&self) -> usize {
        let handles = {
            let mut tasks = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.closed = true;
            std::mem::take(&mut tasks.handles)
        };
        for handle in &handles {
            handle.abort();
        }
        handles.len()
    }
}

fn peer_error(e: webrtc::Error) -> TransportError {
    TransportError::Peer(e.to_string())
}

fn description_error(e: webrtc::Error) -> TransportError {
    TransportError::Description(e.to_string())
}

pub fn map_peer_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    }
}

pub fn map_channel_state(state: RTCDataChannelState) -> ChannelState {
    match state {
        RTCDataChannelState::Open => ChannelState::Open,
        RTCDataChannelState::Closing => ChannelState::Closing,
        RTCDataChannelState::Closed => ChannelState::Closed,
        _ => ChannelState::Connecting,
    }
}

fn pcmu_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_PCMU.to_owned(),
        clock_rate: PCMU_SAMPLE_RATE,
        channels: 1,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// Only PCMU is offered; the voice server expects 8 kHz µ-law.
fn build_api() -> Result<API, webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: pcmu_capability(),
            payload_type: 0,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Opens webrtc-rs peer connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcTransport;

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn open(
        &self,
        config: &PeerConfig,
        microphone: LocalAudio,
    ) -> Result<PeerLink, TransportError> {
        let api = build_api().map_err(peer_error)?;
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(peer_error)?);

        match wire(&pc, config, microphone).await {
            Ok(link) => Ok(link),
            Err(e) => {
                if let Err(close_err) = pc.close().await {
                    debug!(error = %close_err, "Failed to close half-built peer connection");
                }
                Err(e)
            }
        }
    }
}

async fn wire(
    pc: &Arc<RTCPeerConnection>,
    config: &PeerConfig,
    microphone: LocalAudio,
) -> Result<PeerLink, TransportError> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let track = Arc::new(TrackLocalStaticSample::new(
        pcmu_capability(),
        "audio".to_owned(),
        "parley".to_owned(),
    ));
    let sender = pc
        .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(peer_error)?;

    let dc = pc
        .create_data_channel(
            &config.channel_label,
            Some(RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            }),
        )
        .await
        .map_err(|e| TransportError::Channel(e.to_string()))?;

    let tasks = TaskSet::default();
    attach_channel_handlers(&dc, events_tx.clone());
    attach_peer_handlers(pc, events_tx, tasks.clone());

    tasks.spawn(drain_rtcp(sender));
    tasks.spawn(send_microphone(track, microphone));

    Ok(PeerLink {
        connection: Box::new(WebRtcConnection {
            pc: Arc::clone(pc),
            channel: Arc::clone(&dc),
            gathering: Mutex::new(None),
            tasks,
        }),
        channel: Arc::new(WebRtcChannel { dc }),
        events: events_rx,
    })
}

fn attach_peer_handlers(
    pc: &RTCPeerConnection,
    events: mpsc::UnboundedSender<TransportEvent>,
    tasks: TaskSet,
) {
    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        debug!(?state, "Peer connection state changed");
        let _ = state_events.send(TransportEvent::ConnectionState(map_peer_state(state)));
        Box::pin(async {})
    }));

    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
            if track.kind() == RTPCodecType::Audio {
                info!(codec = %track.codec().capability.mime_type, "Remote audio track received");
                let (frames_tx, frames_rx) = mpsc::channel(REMOTE_AUDIO_QUEUE_FRAMES);
                if events
                    .send(TransportEvent::RemoteAudio(RemoteAudio::new(frames_rx)))
                    .is_ok()
                {
                    tasks.spawn(receive_audio(track, frames_tx));
                }
            }
            Box::pin(async {})
        },
    ));
}

fn attach_channel_handlers(dc: &RTCDataChannel, events: mpsc::UnboundedSender<TransportEvent>) {
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        let _ = open_events.send(TransportEvent::ChannelOpen);
        Box::pin(async {})
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        if message.is_string {
            match String::from_utf8(message.data.to_vec()) {
                Ok(text) => {
                    let _ = message_events.send(TransportEvent::ChannelMessage(text));
                }
                Err(e) => warn!(error = %e, "Dropping non UTF-8 control message"),
            }
        } else {
            debug!(len = message.data.len(), "Ignoring binary control message");
        }
        Box::pin(async {})
    }));

    dc.on_close(Box::new(move || {
        let _ = events.send(TransportEvent::ChannelClosed);
        Box::pin(async {})
    }));
}

/// Reads incoming RTCP so the interceptors keep running.
async fn drain_rtcp(sender: Arc<RTCRtpSender>) {
    let mut buf = vec![0u8; 1500];
    while sender.read(&mut buf).await.is_ok() {}
}

/// Resamples microphone audio to 8 kHz and writes it as 20 ms PCMU samples.
async fn send_microphone(track: Arc<TrackLocalStaticSample>, mut microphone: LocalAudio) {
    let mut converter = RateConverter::new(PCMU_SAMPLE_RATE);
    let mut pending: Vec<f32> = Vec::new();

    while let Some(frame) = microphone.next_frame().await {
        match converter.convert(&frame.samples, frame.sample_rate) {
            Ok(samples) => pending.extend(samples),
            Err(e) => {
                warn!(error = %e, "Failed to resample microphone audio");
                break;
            }
        }
        while pending.len() >= PCMU_FRAME_SAMPLES {
            let packet: Vec<f32> = pending.drain(..PCMU_FRAME_SAMPLES).collect();
            let sample = Sample {
                data: Bytes::from(g711::encode(&packet)),
                duration: PACKET_DURATION,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                warn!(error = %e, "Failed to write microphone audio");
                return;
            }
        }
    }
    debug!("Microphone stream ended");
}

async fn receive_audio(track: Arc<TrackRemote>, frames: mpsc::Sender<AudioFrame>) {
    let sample_rate = track.codec().capability.clock_rate;
    while let Ok((packet, _)) = track.read_rtp().await {
        if packet.payload.is_empty() {
            continue;
        }
        let frame = AudioFrame {
            samples: g711::decode(&packet.payload),
            sample_rate,
        };
        if frames.send(frame).await.is_err() {
            break;
        }
    }
    debug!("Remote audio track ended");
}

struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl ControlChannel for WebRtcChannel {
    fn state(&self) -> ChannelState {
        map_channel_state(self.dc.ready_state())
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Channel(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!(error = %e, "Failed to close data channel");
        }
    }
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
    gathering: Mutex<Option<mpsc::Receiver<()>>>,
    tasks: TaskSet,
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(description_error)?;
        // Must be taken before the local description starts gathering.
        let gathering = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(description_error)?;
        *self.gathering.lock().await = Some(gathering);
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn ice_gathering_complete(&self) {
        let receiver = self.gathering.lock().await.take();
        if let Some(mut receiver) = receiver {
            let _ = receiver.recv().await;
        }
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .map(|description| SessionDescription::offer(description.sdp))
    }

    async fn set_remote_description(
        &self,
        answer: SessionDescription,
    ) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(answer.sdp).map_err(description_error)?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(description_error)
    }

    async fn close(&self) {
        self.pc.on_peer_connection_state_change(Box::new(|_: RTCPeerConnectionState| {
            Box::pin(async {})
        }));
        self.pc.on_track(Box::new(
            |_: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                Box::pin(async {})
            },
        ));
        self.channel.on_open(Box::new(|| Box::pin(async {})));
        self.channel.on_message(Box::new(|_: DataChannelMessage| Box::pin(async {})));
        self.channel.on_close(Box::new(|| Box::pin(async {})));

        let aborted = self.tasks.abort_all();
        debug!(aborted, "Stopped peer connection tasks");
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "Failed to close peer connection");
        }
    }
}
