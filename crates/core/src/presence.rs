//! Presence State Machine
//!
//! Derives the single UI-facing state of the client from the session phase and
//! the two speech flags maintained by the control protocol. The derivation is a
//! pure function; [`PresenceTracker`] only stores its inputs and publishes the
//! result whenever it changes.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle phase of the session. Only the connection manager changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// The discrete state shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceState {
    #[default]
    Disconnected,
    Connecting,
    Idle,
    Listening,
    Speaking,
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceState::Disconnected => write!(f, "disconnected"),
            PresenceState::Connecting => write!(f, "connecting"),
            PresenceState::Idle => write!(f, "idle"),
            PresenceState::Listening => write!(f, "listening"),
            PresenceState::Speaking => write!(f, "speaking"),
        }
    }
}

/// Speech-boundary signals that move the listening/speaking flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechSignal {
    UserStarted,
    UserStopped,
    BotStarted,
    BotStopped,
    /// Drops both flags, used on teardown.
    Reset,
}

/// Raw inputs of the derivation.
///
/// `is_listening` and `is_speaking` are never both true: entering one state
/// always clears the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PresenceInputs {
    phase: Phase,
    is_listening: bool,
    is_speaking: bool,
}

impl PresenceInputs {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_listening(&self) -> bool {
        self.is_listening
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking
    }

    pub fn apply(&mut self, signal: SpeechSignal) {
        match signal {
            SpeechSignal::UserStarted => {
                self.is_listening = true;
                self.is_speaking = false;
            }
            SpeechSignal::UserStopped => self.is_listening = false,
            SpeechSignal::BotStarted => {
                self.is_speaking = true;
                self.is_listening = false;
            }
            SpeechSignal::BotStopped => self.is_speaking = false,
            SpeechSignal::Reset => {
                self.is_listening = false;
                self.is_speaking = false;
            }
        }
    }

    pub fn derive(&self) -> PresenceState {
        derive(self.phase, self.is_listening, self.is_speaking)
    }
}

/// First match wins: Connecting > Speaking > Listening > Idle > Disconnected.
///
/// Connecting dominates so that flags left over from an earlier session can
/// never leak into a new connect attempt.
pub fn derive(phase: Phase, is_listening: bool, is_speaking: bool) -> PresenceState {
    if phase == Phase::Connecting {
        PresenceState::Connecting
    } else if is_speaking {
        PresenceState::Speaking
    } else if is_listening {
        PresenceState::Listening
    } else if phase == Phase::Connected {
        PresenceState::Idle
    } else {
        PresenceState::Disconnected
    }
}

/// Holds the presence inputs and broadcasts the derived state on change.
pub struct PresenceTracker {
    inputs: Mutex<PresenceInputs>,
    tx: watch::Sender<PresenceState>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(PresenceState::Disconnected);
        Self {
            inputs: Mutex::new(PresenceInputs::default()),
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PresenceState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> PresenceState {
        *self.tx.borrow()
    }

    pub fn inputs(&self) -> PresenceInputs {
        *self.inputs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_phase(&self, phase: Phase) -> PresenceState {
        self.update(|inputs| inputs.phase = phase)
    }

    pub(crate) fn signal(&self, signal: SpeechSignal) -> PresenceState {
        self.update(|inputs| inputs.apply(signal))
    }

    fn update(&self, change: impl FnOnce(&mut PresenceInputs)) -> PresenceState {
        let mut inputs = self.inputs.lock().unwrap_or_else(PoisonError::into_inner);
        change(&mut inputs);
        let next = inputs.derive();
        self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = %current, to = %next, "Presence changed");
            *current = next;
            true
        });
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGNALS: [SpeechSignal; 5] = [
        SpeechSignal::UserStarted,
        SpeechSignal::UserStopped,
        SpeechSignal::BotStarted,
        SpeechSignal::BotStopped,
        SpeechSignal::Reset,
    ];

    #[test]
    fn test_precedence() {
        // Connecting dominates even stale speech flags.
        assert_eq!(derive(Phase::Connecting, true, false), PresenceState::Connecting);
        assert_eq!(derive(Phase::Connecting, false, true), PresenceState::Connecting);
        assert_eq!(derive(Phase::Connected, false, true), PresenceState::Speaking);
        assert_eq!(derive(Phase::Connected, true, false), PresenceState::Listening);
        assert_eq!(derive(Phase::Connected, false, false), PresenceState::Idle);
        assert_eq!(derive(Phase::Disconnected, false, false), PresenceState::Disconnected);
    }

    #[test]
    fn test_flags_never_both_true() {
        // Every sequence of up to five signals keeps the flags exclusive.
        fn walk(inputs: PresenceInputs, depth: usize) {
            assert!(!(inputs.is_listening() && inputs.is_speaking()));
            if depth == 0 {
                return;
            }
            for signal in SIGNALS {
                let mut next = inputs;
                next.apply(signal);
                walk(next, depth - 1);
            }
        }
        walk(PresenceInputs::default(), 5);
    }

    #[test]
    fn test_entering_one_state_clears_the_other() {
        let mut inputs = PresenceInputs::default();
        inputs.apply(SpeechSignal::UserStarted);
        assert!(inputs.is_listening());

        inputs.apply(SpeechSignal::BotStarted);
        assert!(inputs.is_speaking());
        assert!(!inputs.is_listening());

        inputs.apply(SpeechSignal::UserStarted);
        assert!(inputs.is_listening());
        assert!(!inputs.is_speaking());
    }

    #[test]
    fn test_tracker_publishes_only_changes() {
        let tracker = PresenceTracker::new();
        let mut rx = tracker.subscribe();
        assert_eq!(*rx.borrow_and_update(), PresenceState::Disconnected);

        tracker.set_phase(Phase::Connecting);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), PresenceState::Connecting);

        // Speech while connecting does not change the visible state.
        tracker.signal(SpeechSignal::UserStarted);
        assert!(!rx.has_changed().unwrap());

        tracker.set_phase(Phase::Connected);
        assert_eq!(*rx.borrow_and_update(), PresenceState::Listening);

        tracker.signal(SpeechSignal::BotStarted);
        assert_eq!(tracker.current(), PresenceState::Speaking);

        tracker.signal(SpeechSignal::Reset);
        tracker.set_phase(Phase::Disconnected);
        assert_eq!(tracker.current(), PresenceState::Disconnected);
        assert_eq!(tracker.inputs(), PresenceInputs::default());
    }

    #[test]
    fn test_display() {
        assert_eq!(PresenceState::Idle.to_string(), "idle");
        assert_eq!(PresenceState::Speaking.to_string(), "speaking");
    }
}
