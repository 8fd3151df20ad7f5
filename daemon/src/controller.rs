//! Voice session controller.
//!
//! One task owns the whole session: capture loop, pending sale, till and the
//! capture/speech devices. Everything reaches it as a `Command` on a single
//! queue, including the continuations it schedules for itself (extraction
//! results, speech completion, start retries), so no two mutations interleave.
//!
//! Extraction runs in a spawned task tagged with the session epoch. Closing the
//! session bumps the epoch, and a result for an older epoch is dropped unread.

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use shared::{
    Bill, CaptureErrorKind, CaptureState, Config, ExtractionResult, Intent, Product,
    SessionSnapshot,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::capture::{CaptureDevice, CaptureError, CaptureEvent, CaptureLoop, Utterance};
use crate::extraction::Extractor;
use crate::session::{PendingSale, TurnOutcome};
use crate::speech::Synthesizer;
use crate::till::Till;

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub role: String,
    pub start_retry_delay: Duration,
    pub greeting: String,
    pub follow_up: String,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            role: config.extraction.role.clone(),
            start_retry_delay: Duration::from_millis(config.capture.start_retry_delay_ms),
            greeting: config.speech.greeting.clone(),
            follow_up: config.speech.follow_up.clone(),
        }
    }
}

enum Command {
    OpenSession,
    CloseSession,
    StartListening,
    StopListening,
    Capture(CaptureEvent),
    RetryPermission,
    Finalize { reply: oneshot::Sender<Option<Bill>> },
    Status { reply: oneshot::Sender<SessionSnapshot> },
    Bills { reply: oneshot::Sender<Vec<Bill>> },
    VoidBill { id: String, reply: oneshot::Sender<Option<Bill>> },
    Catalog { reply: oneshot::Sender<Vec<Product>> },
    Shutdown,
    ExtractionDone { epoch: u64, result: ExtractionResult },
    SpeechFinished { token: u64 },
    RetryStart { epoch: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterSpeech {
    StartListening,
    Finalize,
}

#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ControllerHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| anyhow!("session controller has stopped"))
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply))?;
        rx.await.map_err(|_| anyhow!("session controller has stopped"))
    }

    pub fn open_session(&self) -> Result<()> {
        self.send(Command::OpenSession)
    }

    pub fn close_session(&self) -> Result<()> {
        self.send(Command::CloseSession)
    }

    pub fn start_listening(&self) -> Result<()> {
        self.send(Command::StartListening)
    }

    pub fn stop_listening(&self) -> Result<()> {
        self.send(Command::StopListening)
    }

    pub fn capture_event(&self, event: CaptureEvent) -> Result<()> {
        self.send(Command::Capture(event))
    }

    pub fn retry_permission(&self) -> Result<()> {
        self.send(Command::RetryPermission)
    }

    pub async fn finalize(&self) -> Result<Option<Bill>> {
        self.request(|reply| Command::Finalize { reply }).await
    }

    pub async fn status(&self) -> Result<SessionSnapshot> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn bills(&self) -> Result<Vec<Bill>> {
        self.request(|reply| Command::Bills { reply }).await
    }

    pub async fn void_bill(&self, id: String) -> Result<Option<Bill>> {
        self.request(|reply| Command::VoidBill { id, reply }).await
    }

    pub async fn catalog(&self) -> Result<Vec<Product>> {
        self.request(|reply| Command::Catalog { reply }).await
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }
}

pub fn spawn(
    settings: ControllerSettings,
    till: Till,
    capture: Box<dyn CaptureDevice>,
    synth: Box<dyn Synthesizer>,
    extractor: Arc<dyn Extractor>,
) -> ControllerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let controller = SessionController {
        settings,
        till,
        capture,
        synth,
        extractor,
        capture_loop: CaptureLoop::new(),
        pending: PendingSale::new(),
        session_id: None,
        epoch: 0,
        retry_pending: false,
        speech_token: 0,
        after_speech: None,
        assistant_message: None,
        tx: tx.clone(),
    };
    tokio::spawn(controller.run(rx));
    ControllerHandle { tx }
}

struct SessionController {
    settings: ControllerSettings,
    till: Till,
    capture: Box<dyn CaptureDevice>,
    synth: Box<dyn Synthesizer>,
    extractor: Arc<dyn Extractor>,
    capture_loop: CaptureLoop,
    pending: PendingSale,
    session_id: Option<Uuid>,
    epoch: u64,
    retry_pending: bool,
    speech_token: u64,
    after_speech: Option<(u64, AfterSpeech)>,
    assistant_message: Option<String>,
    tx: mpsc::UnboundedSender<Command>,
}

impl SessionController {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        info!("Session controller started");
        while let Some(command) = rx.recv().await {
            if !self.handle(command) {
                break;
            }
        }
        self.close_session();
        info!("Session controller stopped");
    }

    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::OpenSession => self.open_session(),
            Command::CloseSession => self.close_session(),
            Command::StartListening => self.start_listening(),
            Command::StopListening => self.stop_listening(),
            Command::Capture(event) => self.on_capture(event),
            Command::RetryPermission => {
                if self.capture_loop.retry_permission() {
                    info!("Retrying microphone access");
                    self.capture.allow();
                    self.start_listening();
                }
            }
            Command::Finalize { reply } => {
                let bill = match self.capture_loop.state() {
                    CaptureState::Listening | CaptureState::Processing => {
                        debug!("finalize ignored while a turn is in progress");
                        None
                    }
                    _ => self.finalize_pending(),
                };
                let _ = reply.send(bill);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Bills { reply } => {
                let _ = reply.send(self.till.ledger().bills());
            }
            Command::VoidBill { id, reply } => {
                let _ = reply.send(self.till.void(&id));
            }
            Command::Catalog { reply } => {
                let _ = reply.send(self.till.catalog().products().to_vec());
            }
            Command::Shutdown => return false,
            Command::ExtractionDone { epoch, result } => self.on_extraction(epoch, result),
            Command::SpeechFinished { token } => self.on_speech_finished(token),
            Command::RetryStart { epoch } => self.retry_start(epoch),
        }
        true
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id,
            state: self.capture_loop.state(),
            transcript: self.capture_loop.transcript().to_string(),
            pending: self.pending.items().to_vec(),
            last_intent: self.pending.last_intent(),
            assistant_message: self.assistant_message.clone(),
            busy: self.capture_loop.state() == CaptureState::Processing,
        }
    }

    fn open_session(&mut self) {
        self.close_session();
        let session_id = Uuid::new_v4();
        self.session_id = Some(session_id);
        info!("Opened voice session {}", session_id);

        let greeting = self.settings.greeting.clone();
        self.speak_then(&greeting, AfterSpeech::StartListening);
    }

    /// Leaves nothing behind: capture stopped, speech silenced, pending items dropped.
    fn close_session(&mut self) {
        if self.capture_loop.state() == CaptureState::Listening {
            self.capture.stop();
            // Whatever the old recognizer still reports belongs to a closed session.
            self.capture.acknowledge_end();
        }
        self.synth.cancel_all();
        self.after_speech = None;
        self.retry_pending = false;
        self.capture_loop.reset();
        self.pending.clear();
        self.assistant_message = None;
        self.epoch += 1;
        if let Some(session_id) = self.session_id.take() {
            info!("Closed voice session {}", session_id);
        }
    }

    fn start_listening(&mut self) {
        if self.retry_pending || !self.capture_loop.can_start() {
            debug!(
                "start ignored in {:?} (retry pending: {})",
                self.capture_loop.state(),
                self.retry_pending
            );
            return;
        }
        if self.session_id.is_none() {
            self.session_id = Some(Uuid::new_v4());
        }

        // The assistant must not hear itself.
        self.synth.cancel_all();
        self.after_speech = None;

        match self.capture.start() {
            Ok(()) => {
                self.capture_loop.begin_listening();
                debug!("listening");
            }
            Err(CaptureError::NotAllowed) => {
                warn!("Microphone permission denied");
                self.capture_loop.deny_permission();
            }
            Err(e) => {
                warn!("Capture start failed ({}), retrying once", e);
                self.retry_pending = true;
                let tx = self.tx.clone();
                let epoch = self.epoch;
                let delay = self.settings.start_retry_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Command::RetryStart { epoch });
                });
            }
        }
    }

    fn retry_start(&mut self, epoch: u64) {
        if epoch != self.epoch || !self.retry_pending {
            return;
        }
        self.retry_pending = false;
        if !self.capture_loop.can_start() {
            return;
        }

        self.synth.cancel_all();
        self.after_speech = None;

        match self.capture.start() {
            Ok(()) => {
                self.capture_loop.begin_listening();
                debug!("listening after retry");
            }
            Err(e) => {
                warn!("Capture start failed again ({})", e);
                self.capture_loop.deny_permission();
            }
        }
    }

    fn stop_listening(&mut self) {
        if self.capture_loop.state() != CaptureState::Listening {
            return;
        }
        // The recognizer answers with an end event, which closes the utterance.
        self.capture.stop();
    }

    fn on_capture(&mut self, event: CaptureEvent) {
        let utterance = match event {
            CaptureEvent::Interim(text) => {
                self.capture_loop.on_interim(&text);
                return;
            }
            CaptureEvent::End => {
                self.capture.acknowledge_end();
                self.capture_loop.on_end()
            }
            CaptureEvent::Error(kind) => {
                self.capture.acknowledge_end();
                let utterance = self.capture_loop.on_error(&kind);
                if let Some(failure) = device_failure(&kind, &utterance) {
                    self.capture.report_failure(failure);
                }
                utterance
            }
        };

        match utterance {
            Utterance::Transcript(transcript) => self.dispatch_extraction(transcript),
            Utterance::Silent => debug!("nothing heard"),
            Utterance::PermissionDenied => warn!("Microphone permission denied"),
            Utterance::Ignored => debug!("capture event outside listening ignored"),
        }
    }

    fn dispatch_extraction(&mut self, transcript: String) {
        info!("Heard: {}", transcript);
        let extractor = self.extractor.clone();
        let role = self.settings.role.clone();
        let tx = self.tx.clone();
        let epoch = self.epoch;

        tokio::spawn(async move {
            let result = extractor.extract(&transcript, &role).await;
            let _ = tx.send(Command::ExtractionDone { epoch, result });
        });
    }

    fn on_extraction(&mut self, epoch: u64, result: ExtractionResult) {
        if epoch != self.epoch || self.capture_loop.state() != CaptureState::Processing {
            debug!("discarding extraction result from a closed session");
            return;
        }

        debug!(
            "extraction: {:?} with {} items",
            result.intent,
            result.items.len()
        );
        self.assistant_message = Some(result.message.clone());

        match self.pending.apply(&result) {
            TurnOutcome::Finalize => {
                // Stays in Processing until the closing words are spoken.
                self.speak_then(&result.message, AfterSpeech::Finalize);
            }
            TurnOutcome::Continue => {
                debug!("{} items pending", self.pending.len());
                self.capture_loop.processed();
                let reply = if result.intent == Intent::Error {
                    result.message
                } else {
                    follow_up(&result.message, &self.settings.follow_up)
                };
                self.synth.speak(&reply, None);
            }
        }
    }

    fn speak_then(&mut self, text: &str, after: AfterSpeech) {
        self.speech_token += 1;
        let token = self.speech_token;
        self.after_speech = Some((token, after));

        let tx = self.tx.clone();
        self.synth.speak(
            text,
            Some(Box::new(move || {
                let _ = tx.send(Command::SpeechFinished { token });
            })),
        );
    }

    fn on_speech_finished(&mut self, token: u64) {
        let after = match self.after_speech {
            Some((expected, after)) if expected == token => after,
            _ => return,
        };
        self.after_speech = None;

        match after {
            AfterSpeech::StartListening => self.start_listening(),
            AfterSpeech::Finalize => {
                if self.finalize_pending().is_none() {
                    self.capture_loop.processed();
                }
            }
        }
    }

    /// Reading and clearing the pending list happen in this one call, so no
    /// turn can slip in between.
    fn finalize_pending(&mut self) -> Option<Bill> {
        if self.pending.is_empty() {
            debug!("nothing pending to finalize");
            return None;
        }
        let (items, payment_mode) = self.pending.take();
        let bill = self.till.finalize(&items, payment_mode);
        self.close_session();
        bill
    }
}

/// What a recognizer error says about the device, once the loop has judged it.
fn device_failure(kind: &CaptureErrorKind, utterance: &Utterance) -> Option<CaptureError> {
    match (utterance, kind) {
        (Utterance::PermissionDenied, _) => Some(CaptureError::NotAllowed),
        (Utterance::Silent, CaptureErrorKind::Network) => {
            Some(CaptureError::Unavailable("recognizer lost its network".to_string()))
        }
        (Utterance::Silent, CaptureErrorKind::Other(reason)) => {
            Some(CaptureError::Unavailable(reason.clone()))
        }
        _ => None,
    }
}

fn follow_up(message: &str, follow_up: &str) -> String {
    let message = message.trim().trim_end_matches('.');
    match (message.is_empty(), follow_up.trim().is_empty()) {
        (true, _) => follow_up.trim().to_string(),
        (false, true) => message.to_string(),
        (false, false) => format!("{}. {}", message, follow_up.trim()),
    }
}
