//! The outward transcript view.
//!
//! Both presentation policies share the same assembler output: `Current`
//! shows only the latest utterance, `History` additionally keeps every
//! finalized utterance in order.

use crate::transcript::Utterance;
use serde::Serialize;
use std::str::FromStr;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TranscriptPolicy {
    #[default]
    Current,
    History,
}

impl FromStr for TranscriptPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "current" | "single" => Ok(Self::Current),
            "history" | "multi" => Ok(Self::History),
            other => Err(other.to_string()),
        }
    }
}

/// What a renderer needs to draw the transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TranscriptView {
    pub current: Option<Utterance>,
    pub history: Vec<Utterance>,
}

/// Applies the presentation policy and publishes the resulting view.
pub struct TranscriptDisplay {
    policy: TranscriptPolicy,
    tx: watch::Sender<TranscriptView>,
}

impl TranscriptDisplay {
    pub fn new(policy: TranscriptPolicy) -> Self {
        let (tx, _) = watch::channel(TranscriptView::default());
        Self { policy, tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<TranscriptView> {
        self.tx.subscribe()
    }

    pub fn view(&self) -> TranscriptView {
        self.tx.borrow().clone()
    }

    /// Makes `utterance` the current one; finalized utterances also enter the
    /// history under the `History` policy.
    pub fn show(&self, utterance: Utterance) {
        let policy = self.policy;
        self.tx.send_modify(|view| {
            if policy == TranscriptPolicy::History && utterance.is_final {
                match view.history.last_mut() {
                    Some(last) if last.id == utterance.id => *last = utterance.clone(),
                    _ => view.history.push(utterance.clone()),
                }
            }
            view.current = Some(utterance);
        });
    }

    pub fn clear_current(&self) {
        self.tx.send_if_modified(|view| view.current.take().is_some());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::{Speaker, Utterance};

    fn interim(id: &str, text: &str) -> Utterance {
        Utterance {
            id: id.to_string(),
            text: text.to_string(),
            speaker: Speaker::Assistant,
            is_final: false,
        }
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("current".parse::<TranscriptPolicy>(), Ok(TranscriptPolicy::Current));
        assert_eq!("History".parse::<TranscriptPolicy>(), Ok(TranscriptPolicy::History));
        assert!("all".parse::<TranscriptPolicy>().is_err());
    }

    #[test]
    fn test_current_policy_discards_older_utterances() {
        let display = TranscriptDisplay::new(TranscriptPolicy::Current);
        display.show(Utterance::finalized(Speaker::User, "first"));
        display.show(Utterance::finalized(Speaker::Assistant, "second"));

        let view = display.view();
        assert_eq!(view.current.unwrap().text, "second");
        assert!(view.history.is_empty());
    }

    #[test]
    fn test_history_policy_keeps_final_utterances_in_order() {
        let display = TranscriptDisplay::new(TranscriptPolicy::History);
        display.show(Utterance::finalized(Speaker::User, "question"));
        display.show(interim("a1", "partial"));
        let mut answer = interim("a1", "partial answer");
        answer.is_final = true;
        display.show(answer);

        let view = display.view();
        let texts: Vec<_> = view.history.iter().map(|u| u.text.as_str()).collect();
        assert_eq!(texts, vec!["question", "partial answer"]);
        assert!(view.current.unwrap().is_final);
    }

    #[test]
    fn test_clear_current_notifies_only_when_something_was_shown() {
        let display = TranscriptDisplay::new(TranscriptPolicy::History);
        let mut rx = display.subscribe();

        display.clear_current();
        assert!(!rx.has_changed().unwrap());

        display.show(Utterance::finalized(Speaker::User, "hello"));
        rx.borrow_and_update();
        display.clear_current();
        assert!(rx.has_changed().unwrap());

        let view = rx.borrow_and_update().clone();
        assert!(view.current.is_none());
        assert_eq!(view.history.len(), 1);
    }
}
