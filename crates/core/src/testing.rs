//! In-memory transport used by the unit tests.

use crate::error::{MediaError, TransportError};
use crate::transport::{
    ChannelState, ControlChannel, LocalAudio, MediaDevices, PeerConfig, PeerConnection, PeerLink,
    PeerState, PeerTransport, PlaybackHandle, RemoteAudio, SessionDescription, TransportEvent,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub struct FakeChannel {
    state: Mutex<ChannelState>,
    sent: Mutex<Vec<String>>,
    log: Option<Arc<Mutex<Vec<String>>>>,
}

impl FakeChannel {
    pub fn new(state: ChannelState) -> Self {
        Self {
            state: Mutex::new(state),
            sent: Mutex::new(Vec::new()),
            log: None,
        }
    }

    pub fn open() -> Self {
        Self::new(ChannelState::Open)
    }

    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn sent_json(&self) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }
}

#[async_trait]
impl ControlChannel for FakeChannel {
    fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn close(&self) {
        self.set_state(ChannelState::Closed);
        if let Some(log) = &self.log {
            log.lock().unwrap().push("channel.close".into());
        }
    }
}

/// How the fake connection behaves during ICE gathering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gathering {
    Completes,
    Never,
}

struct FakeConnection {
    gathering: Gathering,
    fail_remote: bool,
    local: Mutex<Option<SessionDescription>>,
    log: Arc<Mutex<Vec<String>>>,
    remote: Arc<Mutex<Option<SessionDescription>>>,
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = SessionDescription::offer("v=0 fake-offer");
        *self.local.lock().unwrap() = Some(offer.clone());
        self.log.lock().unwrap().push("connection.offer".into());
        Ok(offer)
    }

    async fn ice_gathering_complete(&self) {
        match self.gathering {
            Gathering::Completes => {
                let mut local = self.local.lock().unwrap();
                if let Some(description) = local.as_mut() {
                    description.sdp.push_str(" a=candidate:all");
                }
            }
            Gathering::Never => std::future::pending().await,
        }
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().unwrap().clone()
    }

    async fn set_remote_description(
        &self,
        answer: SessionDescription,
    ) -> Result<(), TransportError> {
        if self.fail_remote {
            return Err(TransportError::Description("rejected answer".into()));
        }
        *self.remote.lock().unwrap() = Some(answer);
        Ok(())
    }

    async fn close(&self) {
        self.log.lock().unwrap().push("connection.close".into());
    }
}

/// A transport whose remote side is driven by the test.
pub struct FakeTransport {
    pub gathering: Gathering,
    pub fail_remote: bool,
    inner: Arc<Mutex<FakeRemote>>,
}

#[derive(Default)]
struct FakeRemote {
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    channel: Option<Arc<FakeChannel>>,
    opened: usize,
    log: Arc<Mutex<Vec<String>>>,
    remote_description: Arc<Mutex<Option<SessionDescription>>>,
    last_config: Option<PeerConfig>,
}

impl FakeTransport {
    pub fn new(gathering: Gathering) -> Self {
        Self {
            gathering,
            fail_remote: false,
            inner: Arc::new(Mutex::new(FakeRemote::default())),
        }
    }

    pub fn handle(&self) -> FakeHandle {
        FakeHandle {
            inner: self.inner.clone(),
        }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn open(
        &self,
        config: &PeerConfig,
        _microphone: LocalAudio,
    ) -> Result<PeerLink, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        let log = inner.log.clone();
        let channel = Arc::new(FakeChannel {
            state: Mutex::new(ChannelState::Connecting),
            sent: Mutex::new(Vec::new()),
            log: Some(log.clone()),
        });
        inner.events = Some(tx);
        inner.channel = Some(channel.clone());
        inner.opened += 1;
        inner.last_config = Some(config.clone());

        Ok(PeerLink {
            connection: Box::new(FakeConnection {
                gathering: self.gathering,
                fail_remote: self.fail_remote,
                local: Mutex::new(None),
                log,
                remote: inner.remote_description.clone(),
            }),
            channel,
            events: rx,
        })
    }
}

/// Test-side view of the fake transport.
#[derive(Clone)]
pub struct FakeHandle {
    inner: Arc<Mutex<FakeRemote>>,
}

impl FakeHandle {
    /// Delivers an event; returns false once the session dropped its receiver.
    pub fn emit(&self, event: TransportEvent) -> bool {
        match &self.inner.lock().unwrap().events {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn connect(&self) -> bool {
        self.emit(TransportEvent::ConnectionState(PeerState::Connected))
    }

    pub fn open_channel(&self) -> bool {
        self.channel().set_state(ChannelState::Open);
        self.emit(TransportEvent::ChannelOpen)
    }

    /// Delivers a server-pushed event, which carries no `id`.
    pub fn message(&self, message_type: &str, data: Value) -> bool {
        let payload = serde_json::json!({
            "label": "rtvi-ai",
            "type": message_type,
            "data": data,
        });
        self.emit(TransportEvent::ChannelMessage(payload.to_string()))
    }

    pub fn channel(&self) -> Arc<FakeChannel> {
        self.inner
            .lock()
            .unwrap()
            .channel
            .clone()
            .expect("transport was never opened")
    }

    pub fn opened(&self) -> usize {
        self.inner.lock().unwrap().opened
    }

    pub fn log(&self) -> Vec<String> {
        self.inner.lock().unwrap().log.lock().unwrap().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.inner
            .lock()
            .unwrap()
            .remote_description
            .lock()
            .unwrap()
            .clone()
    }

    pub fn last_config(&self) -> Option<PeerConfig> {
        self.inner.lock().unwrap().last_config.clone()
    }
}

/// Audio devices whose output takes `open_delay` to start.
pub struct SlowDevices {
    open_delay: Duration,
    opened: AtomicUsize,
    released: Arc<AtomicBool>,
}

struct ReleaseFlag(Arc<AtomicBool>);

impl Drop for ReleaseFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl SlowDevices {
    pub fn new(open_delay: Duration) -> Self {
        Self {
            open_delay,
            opened: AtomicUsize::new(0),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Playback handles handed out so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for SlowDevices {
    async fn acquire_microphone(&self) -> Result<LocalAudio, MediaError> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(LocalAudio::new(rx, ()))
    }

    async fn start_playback(&self, _remote: RemoteAudio) -> Result<PlaybackHandle, MediaError> {
        tokio::time::sleep(self.open_delay).await;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(PlaybackHandle::new(ReleaseFlag(self.released.clone())))
    }
}
