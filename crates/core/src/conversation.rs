//! Dispatch of inbound control messages.
//!
//! Each recognised message is a pure state update on the presence flags, the
//! transcript assembler and the displayed transcript. No handler performs I/O.
//!
//! The assistant's words arrive from two sources. `bot-tts-text` carries the
//! small fragments spoken by the TTS engine and goes through the assembler.
//! `bot-transcription` carries whole sentences and is published as final
//! straight away. Once a reply has a sentence, it owns the reply's transcript
//! entry and later TTS fragments for that reply are dropped.

use crate::display::TranscriptDisplay;
use crate::presence::{PresenceTracker, SpeechSignal};
use crate::timer::Deadline;
use crate::transcript::{Speaker, TranscriptAssembler, Utterance};
use parley_protocol::InboundMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct Conversation {
    presence: Arc<PresenceTracker>,
    display: Arc<TranscriptDisplay>,
    assembler: TranscriptAssembler,
    clear_timer: Deadline,
    clear_delay: Duration,
    /// Id of the last assistant utterance published for the current reply.
    reply_id: Option<String>,
    /// Sentences received so far for the current reply.
    reply_transcript: Option<String>,
}

impl Conversation {
    pub fn new(
        presence: Arc<PresenceTracker>,
        display: Arc<TranscriptDisplay>,
        debounce: Duration,
        clear_delay: Duration,
    ) -> Self {
        Self {
            presence,
            display,
            assembler: TranscriptAssembler::new(debounce),
            clear_timer: Deadline::default(),
            clear_delay,
            reply_id: None,
            reply_transcript: None,
        }
    }

    pub fn apply(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::BotReady(ready) => {
                info!(version = ?ready.version, "Remote agent is ready");
            }
            InboundMessage::UserStartedSpeaking => {
                self.presence.signal(SpeechSignal::UserStarted);
                self.clear_timer.cancel();
                self.display.clear_current();
                self.end_reply();
            }
            InboundMessage::UserStoppedSpeaking => {
                self.presence.signal(SpeechSignal::UserStopped);
            }
            InboundMessage::BotStartedSpeaking => {
                self.presence.signal(SpeechSignal::BotStarted);
                self.clear_timer.cancel();
                self.display.clear_current();
                self.assembler.reset();
                self.end_reply();
            }
            InboundMessage::BotStoppedSpeaking => {
                self.presence.signal(SpeechSignal::BotStopped);
                if let Some(utterance) = self.assembler.finalize() {
                    self.show_assistant(utterance);
                }
                self.clear_timer.arm(self.clear_delay);
            }
            InboundMessage::UserTranscription(transcription) => {
                let text = transcription.text.trim();
                if transcription.is_final && !text.is_empty() {
                    self.display.show(Utterance::finalized(Speaker::User, text));
                }
            }
            InboundMessage::BotTtsText(payload) => {
                if self.reply_transcript.is_some() {
                    debug!("Dropping TTS fragment for a transcribed reply");
                } else if let Some(interim) = self.assembler.push(&payload.text) {
                    self.show_assistant(interim);
                }
            }
            InboundMessage::BotTranscription(payload) => {
                let text = payload.text.trim();
                if !text.is_empty() {
                    self.assembler.reset();
                    let full = match self.reply_transcript.take() {
                        Some(previous) => format!("{previous} {text}"),
                        None => text.to_string(),
                    };
                    let mut utterance = Utterance::finalized(Speaker::Assistant, full.as_str());
                    if let Some(id) = &self.reply_id {
                        utterance.id = id.clone();
                    }
                    self.reply_transcript = Some(full);
                    self.show_assistant(utterance);
                }
            }
            InboundMessage::Error(error) => {
                warn!(
                    fatal = error.fatal,
                    message = %error.message,
                    "Remote agent reported an error"
                );
            }
            InboundMessage::Unknown { message_type } => {
                debug!(%message_type, "Ignoring unknown control message type");
            }
        }
    }

    /// The earliest pending timer, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.assembler.deadline(), self.clear_timer.at()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Runs whichever timers have expired.
    pub fn on_timer(&mut self) {
        if let Some(utterance) = self.assembler.poll_debounce() {
            self.show_assistant(utterance);
        }
        if self.clear_timer.take_expired() {
            self.display.clear_current();
        }
    }

    /// Cancels every timer and drops unfinalized text.
    pub fn shutdown(&mut self) {
        self.assembler.reset();
        self.clear_timer.cancel();
        self.end_reply();
    }

    fn show_assistant(&mut self, utterance: Utterance) {
        self.reply_id = Some(utterance.id.clone());
        self.display.show(utterance);
    }

    fn end_reply(&mut self) {
        self.reply_id = None;
        self.reply_transcript = None;
    }
}
