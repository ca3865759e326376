//! Terminal rendering of presence and transcript changes.

use parley_core::{PresenceState, Speaker, TranscriptPolicy, TranscriptView, Utterance};

pub struct Renderer {
    policy: TranscriptPolicy,
    presence: Option<PresenceState>,
    /// `(id, text, final)` of the last utterance printed as current.
    last_current: Option<(String, String, bool)>,
    history_printed: usize,
}

fn speaker_label(speaker: Speaker) -> &'static str {
    match speaker {
        Speaker::User => "you",
        Speaker::Assistant => "assistant",
    }
}

fn utterance_line(utterance: &Utterance) -> String {
    let marker = if utterance.is_final { "" } else { " …" };
    format!(
        "{:>9}: {}{}",
        speaker_label(utterance.speaker),
        utterance.text,
        marker
    )
}

impl Renderer {
    pub fn new(policy: TranscriptPolicy) -> Self {
        Self {
            policy,
            presence: None,
            last_current: None,
            history_printed: 0,
        }
    }

    /// A status line when the presence state changed since the last call.
    pub fn presence(&mut self, state: PresenceState) -> Option<String> {
        if self.presence == Some(state) {
            return None;
        }
        self.presence = Some(state);
        Some(format!("[{state}]"))
    }

    /// Lines for whatever changed in `view` since the last call.
    pub fn transcript(&mut self, view: &TranscriptView) -> Vec<String> {
        match self.policy {
            TranscriptPolicy::Current => self.current_lines(view),
            TranscriptPolicy::History => self.history_lines(view),
        }
    }

    fn current_lines(&mut self, view: &TranscriptView) -> Vec<String> {
        let Some(current) = &view.current else {
            return Vec::new();
        };
        let key = (current.id.clone(), current.text.clone(), current.is_final);
        if self.last_current.as_ref() == Some(&key) {
            return Vec::new();
        }
        self.last_current = Some(key);
        vec![utterance_line(current)]
    }

    fn history_lines(&mut self, view: &TranscriptView) -> Vec<String> {
        // A corrected final replaces the last entry in place; reprint it.
        let start = if view.history.len() == self.history_printed {
            self.history_printed.saturating_sub(1)
        } else {
            self.history_printed.min(view.history.len())
        };
        let lines: Vec<String> = view.history[start..]
            .iter()
            .filter(|u| {
                let key = (u.id.clone(), u.text.clone(), u.is_final);
                self.last_current.as_ref() != Some(&key)
            })
            .map(utterance_line)
            .collect();
        if let Some(last) = view.history.last() {
            self.last_current = Some((last.id.clone(), last.text.clone(), last.is_final));
        }
        self.history_printed = view.history.len();
        lines
    }
}
