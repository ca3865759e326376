//! Transcript Assembly
//!
//! A streamed assistant reply arrives as many small text fragments. The
//! [`TranscriptAssembler`] joins them into one growing utterance, publishes it
//! as interim after every fragment, and finalizes it once the stream goes quiet
//! for the debounce duration or the assistant stops speaking.

use crate::timer::Deadline;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

/// A piece of text shown in the transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Utterance {
    pub id: String,
    pub text: String,
    pub speaker: Speaker,
    /// Final utterances are complete and never change again.
    #[serde(rename = "final")]
    pub is_final: bool,
}

impl Utterance {
    /// A complete utterance with a fresh id.
    pub fn finalized(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            speaker,
            is_final: true,
        }
    }
}

/// Accumulates assistant text fragments into a single utterance.
#[derive(Debug)]
pub struct TranscriptAssembler {
    buffer: String,
    utterance_id: Option<String>,
    debounce: Duration,
    timer: Deadline,
}

impl TranscriptAssembler {
    pub fn new(debounce: Duration) -> Self {
        Self {
            buffer: String::new(),
            utterance_id: None,
            debounce,
            timer: Deadline::default(),
        }
    }

    /// Appends a fragment and returns the interim utterance to display.
    ///
    /// Blank fragments are ignored and leave the debounce timer untouched.
    pub fn push(&mut self, fragment: &str) -> Option<Utterance> {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return None;
        }
        if !self.buffer.is_empty() {
            self.buffer.push(' ');
        }
        self.buffer.push_str(fragment);

        let id = self
            .utterance_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        self.timer.arm(self.debounce);

        Some(Utterance {
            id,
            text: self.buffer.clone(),
            speaker: Speaker::Assistant,
            is_final: false,
        })
    }

    /// Commits the accumulated text, cancelling the debounce timer first.
    ///
    /// Returns `None` when there is nothing to commit, so calling it twice in
    /// a row publishes at most once.
    pub fn finalize(&mut self) -> Option<Utterance> {
        self.timer.cancel();
        let text = std::mem::take(&mut self.buffer);
        let id = self.utterance_id.take();

        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        debug!(chars = text.len(), "Finalizing assistant utterance");
        Some(Utterance {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            text: text.to_string(),
            speaker: Speaker::Assistant,
            is_final: true,
        })
    }

    /// Finalizes if the debounce timer has elapsed.
    pub fn poll_debounce(&mut self) -> Option<Utterance> {
        if self.timer.take_expired() {
            self.finalize()
        } else {
            None
        }
    }

    /// Discards any unfinalized text and cancels the timer.
    pub fn reset(&mut self) {
        self.timer.cancel();
        self.buffer.clear();
        self.utterance_id = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timer.at()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
