//! Transcript capture loop.
//!
//! `CaptureLoop` is the listening state machine for one session. It never
//! touches a device itself: the controller calls `CaptureDevice::start`/`stop`
//! and feeds recognizer events back in through the `on_*` transitions.

use log::{debug, warn};
use shared::{CaptureErrorKind, CaptureState};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("capture device is still busy with a previous session")]
    Busy,
    #[error("microphone permission was not granted")]
    NotAllowed,
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
}

/// The speech-to-text resource as seen by the controller.
pub trait CaptureDevice: Send {
    fn start(&mut self) -> Result<(), CaptureError>;
    fn stop(&mut self);
    /// The recognizer has reported the end of its session (normally or by error).
    fn acknowledge_end(&mut self) {}
    /// The recognizer failed on its own. The next `start` may report it.
    fn report_failure(&mut self, _failure: CaptureError) {}
    /// The user asked to try the microphone again after a refusal.
    fn allow(&mut self) {}
}

/// Recognizer event delivered to the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Cumulative best guess for the current utterance; replaces the previous one.
    Interim(String),
    End,
    Error(CaptureErrorKind),
}

/// What the controller should do after an end-of-utterance or error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Utterance {
    Transcript(String),
    Silent,
    PermissionDenied,
    Ignored,
}

#[derive(Debug, Default)]
pub struct CaptureLoop {
    state: CaptureState,
    raw_text: String,
    speech_detected: bool,
}

impl CaptureLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn transcript(&self) -> &str {
        &self.raw_text
    }

    pub fn can_start(&self) -> bool {
        matches!(self.state, CaptureState::Idle | CaptureState::AwaitingUser)
    }

    pub fn begin_listening(&mut self) -> bool {
        if !self.can_start() {
            return false;
        }
        self.raw_text.clear();
        self.speech_detected = false;
        self.state = CaptureState::Listening;
        true
    }

    pub fn on_interim(&mut self, text: &str) -> bool {
        if self.state != CaptureState::Listening {
            debug!("interim result outside listening ignored");
            return false;
        }
        self.raw_text.clear();
        self.raw_text.push_str(text);
        if !text.trim().is_empty() {
            self.speech_detected = true;
        }
        true
    }

    pub fn on_end(&mut self) -> Utterance {
        if self.state != CaptureState::Listening {
            return Utterance::Ignored;
        }
        let transcript = self.raw_text.trim();
        if transcript.chars().count() > 1 {
            let transcript = transcript.to_string();
            self.state = CaptureState::Processing;
            Utterance::Transcript(transcript)
        } else {
            self.state = CaptureState::Idle;
            Utterance::Silent
        }
    }

    pub fn on_error(&mut self, kind: &CaptureErrorKind) -> Utterance {
        if self.state != CaptureState::Listening {
            return Utterance::Ignored;
        }
        // Once something was heard, recognizers tend to report spurious
        // permission or no-speech errors while tearing down. The turn still counts.
        if self.speech_detected {
            debug!("capture error {:?} after speech, ending utterance", kind);
            return self.on_end();
        }
        match kind {
            CaptureErrorKind::NotAllowed => {
                self.deny_permission();
                Utterance::PermissionDenied
            }
            CaptureErrorKind::NoSpeech | CaptureErrorKind::Aborted => {
                self.state = CaptureState::Idle;
                Utterance::Silent
            }
            CaptureErrorKind::Network | CaptureErrorKind::Other(_) => {
                warn!("capture failed before any speech: {:?}", kind);
                self.state = CaptureState::Idle;
                Utterance::Silent
            }
        }
    }

    pub fn deny_permission(&mut self) {
        self.raw_text.clear();
        self.speech_detected = false;
        self.state = CaptureState::PermissionDenied;
    }

    /// The extraction result for the current utterance has been applied.
    pub fn processed(&mut self) {
        if self.state == CaptureState::Processing {
            self.state = CaptureState::AwaitingUser;
        }
    }

    pub fn retry_permission(&mut self) -> bool {
        if self.state != CaptureState::PermissionDenied {
            return false;
        }
        self.state = CaptureState::Idle;
        true
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Capture device whose recognizer lives in a client process.
///
/// Events arrive over the socket, so the daemon cannot see when the remote
/// recognizer has really stopped. After `stop()` the device stays busy until an
/// end event is acknowledged or `settle` has passed.
///
/// A refusal reported by the recognizer sticks until `allow`; other reported
/// failures are returned by the next `start` only.
pub struct RemoteCapture {
    active: bool,
    stop_requested_at: Option<Instant>,
    settle: Duration,
    failure: Option<CaptureError>,
}

impl RemoteCapture {
    pub fn new(settle: Duration) -> Self {
        Self {
            active: false,
            stop_requested_at: None,
            settle,
            failure: None,
        }
    }
}

impl CaptureDevice for RemoteCapture {
    fn start(&mut self) -> Result<(), CaptureError> {
        match self.failure.take() {
            Some(CaptureError::NotAllowed) => {
                self.failure = Some(CaptureError::NotAllowed);
                return Err(CaptureError::NotAllowed);
            }
            Some(failure) => return Err(failure),
            None => {}
        }
        if let Some(requested) = self.stop_requested_at {
            if requested.elapsed() < self.settle {
                return Err(CaptureError::Busy);
            }
            self.stop_requested_at = None;
        }
        self.active = true;
        Ok(())
    }

    fn stop(&mut self) {
        if self.active {
            self.active = false;
            self.stop_requested_at = Some(Instant::now());
        }
    }

    fn acknowledge_end(&mut self) {
        self.active = false;
        self.stop_requested_at = None;
    }

    fn report_failure(&mut self, failure: CaptureError) {
        debug!("remote recognizer failed: {}", failure);
        self.active = false;
        self.failure = Some(failure);
    }

    fn allow(&mut self) {
        if self.failure == Some(CaptureError::NotAllowed) {
            self.failure = None;
        }
    }
}
