//! Turn taking: push-to-talk (manual) or server voice activity detection.

use crate::error::TurnError;
use oracle_realtime::types::TurnDetection;
use std::{fmt, str::FromStr, time::Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnMode {
    Manual,
    #[default]
    Automatic,
}

impl TurnMode {
    /// The `turn_detection` value announcing this mode to the server.
    pub fn turn_detection(self) -> Option<TurnDetection> {
        match self {
            TurnMode::Manual => None,
            TurnMode::Automatic => Some(TurnDetection::server_vad()),
        }
    }
}

impl fmt::Display for TurnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnMode::Manual => write!(f, "manual"),
            TurnMode::Automatic => write!(f, "vad"),
        }
    }
}

impl FromStr for TurnMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "manual" | "none" | "ptt" => Ok(TurnMode::Manual),
            "vad" | "server_vad" | "auto" | "automatic" => Ok(TurnMode::Automatic),
            other => Err(format!("unknown turn mode '{other}'")),
        }
    }
}

/// What capture has to do after a mode switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureCommand {
    /// Stream continuously (if not already recording).
    Record,
    /// Stop streaming (if recording).
    Pause,
}

/// Outcome of a push-to-talk toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushToTalk {
    Started,
    Stopped { elapsed_secs: u64 },
}

/// Current turn mode and the push-to-talk recording, if one is active.
#[derive(Debug, Default)]
pub struct TurnModeStateMachine {
    mode: TurnMode,
    talking_since: Option<Instant>,
}

impl TurnModeStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> TurnMode {
        self.mode
    }

    pub fn is_talking(&self) -> bool {
        self.talking_since.is_some()
    }

    /// Whole seconds since push-to-talk started, if it is active.
    pub fn recording_secs(&self) -> Option<u64> {
        self.talking_since.map(|since| since.elapsed().as_secs())
    }

    /// Switches mode and returns the capture change it implies, or `None`
    /// when the mode did not change.
    pub fn switch_to(&mut self, mode: TurnMode) -> Option<CaptureCommand> {
        if self.mode == mode {
            return None;
        }
        self.mode = mode;
        self.talking_since = None;
        Some(match mode {
            TurnMode::Automatic => CaptureCommand::Record,
            TurnMode::Manual => CaptureCommand::Pause,
        })
    }

    /// Starts or stops push-to-talk. Only valid in manual mode on a
    /// connected session.
    pub fn toggle(&mut self, connected: bool) -> Result<PushToTalk, TurnError> {
        if !connected {
            return Err(TurnError::NotConnected);
        }
        if self.mode == TurnMode::Automatic {
            return Err(TurnError::AutomaticMode);
        }
        match self.talking_since.take() {
            None => {
                self.talking_since = Some(Instant::now());
                Ok(PushToTalk::Started)
            }
            Some(since) => Ok(PushToTalk::Stopped {
                elapsed_secs: since.elapsed().as_secs(),
            }),
        }
    }

    /// Abandons an active push-to-talk without changing mode.
    pub fn cancel_talking(&mut self) {
        self.talking_since = None;
    }

    /// Back to automatic with nothing in progress.
    pub fn reset(&mut self) {
        self.mode = TurnMode::Automatic;
        self.talking_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_switch_commands() {
        let mut turn = TurnModeStateMachine::new();
        assert_eq!(turn.mode(), TurnMode::Automatic);
        assert_eq!(turn.switch_to(TurnMode::Automatic), None);
        assert_eq!(turn.switch_to(TurnMode::Manual), Some(CaptureCommand::Pause));
        assert_eq!(turn.switch_to(TurnMode::Automatic), Some(CaptureCommand::Record));
    }

    #[test]
    fn test_toggle_rejected_when_disconnected_or_automatic() {
        let mut turn = TurnModeStateMachine::new();
        assert_eq!(turn.toggle(true), Err(TurnError::AutomaticMode));
        turn.switch_to(TurnMode::Manual);
        assert_eq!(turn.toggle(false), Err(TurnError::NotConnected));
        assert!(!turn.is_talking());
    }

    #[test]
    fn test_toggle_starts_and_stops() {
        let mut turn = TurnModeStateMachine::new();
        turn.switch_to(TurnMode::Manual);
        assert_eq!(turn.toggle(true), Ok(PushToTalk::Started));
        assert_eq!(turn.recording_secs(), Some(0));
        assert_eq!(turn.toggle(true), Ok(PushToTalk::Stopped { elapsed_secs: 0 }));
        assert_eq!(turn.recording_secs(), None);
    }

    #[test]
    fn test_leaving_manual_drops_push_to_talk() {
        let mut turn = TurnModeStateMachine::new();
        turn.switch_to(TurnMode::Manual);
        turn.toggle(true).unwrap();
        turn.switch_to(TurnMode::Automatic);
        assert!(!turn.is_talking());
        turn.switch_to(TurnMode::Manual);
        turn.reset();
        assert_eq!(turn.mode(), TurnMode::Automatic);
    }

    #[test]
    fn test_parse_and_wire_value() {
        assert_eq!("manual".parse::<TurnMode>(), Ok(TurnMode::Manual));
        assert_eq!("server_vad".parse::<TurnMode>(), Ok(TurnMode::Automatic));
        assert!("sometimes".parse::<TurnMode>().is_err());
        assert_eq!(TurnMode::Manual.turn_detection(), None);
        assert!(TurnMode::Automatic.turn_detection().is_some());
    }
}
