use log::{debug, info, warn};
use shared::SpeechConfig;
use tokio::process::Command;
use tokio::sync::oneshot;

/// Invoked once the utterance has been spoken. Never called for cancelled speech.
pub type SpeechDone = Box<dyn FnOnce() + Send + 'static>;

/// The text-to-speech resource as seen by the controller.
pub trait Synthesizer: Send {
    fn speak(&mut self, text: &str, on_complete: Option<SpeechDone>);
    fn cancel_all(&mut self);
}

/// Placeholder in the configured arguments replaced by the session language.
pub const LANGUAGE_PLACEHOLDER: &str = "{language}";

/// Speaks through an external program such as `espeak-ng`, passing the text as
/// the last argument. Without a program the text is only logged.
pub struct CommandSynthesizer {
    command: Option<String>,
    args: Vec<String>,
    running: Vec<oneshot::Sender<()>>,
}

impl CommandSynthesizer {
    pub fn new(config: &SpeechConfig, language: &str) -> Self {
        Self {
            command: config.command.clone().filter(|cmd| !cmd.trim().is_empty()),
            args: config
                .args
                .iter()
                .map(|arg| arg.replace(LANGUAGE_PLACEHOLDER, language))
                .collect(),
            running: Vec::new(),
        }
    }

    fn command_args(&self, text: &str) -> Vec<String> {
        let mut args = self.args.clone();
        args.push(text.to_string());
        args
    }

    pub fn in_flight(&self) -> usize {
        self.running.iter().filter(|cancel| !cancel.is_closed()).count()
    }
}

impl Synthesizer for CommandSynthesizer {
    fn speak(&mut self, text: &str, on_complete: Option<SpeechDone>) {
        self.running.retain(|cancel| !cancel.is_closed());

        let Some(program) = self.command.as_deref() else {
            info!("Assistant: {}", text);
            if let Some(done) = on_complete {
                done();
            }
            return;
        };

        let mut child = match Command::new(program)
            .args(self.command_args(text))
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn {}: {}", program, e);
                info!("Assistant: {}", text);
                if let Some(done) = on_complete {
                    done();
                }
                return;
            }
        };

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.running.push(cancel_tx);
        let program = program.to_string();

        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) if !status.success() => warn!("{} exited with {}", program, status),
                        Err(e) => warn!("Failed waiting for {}: {}", program, e),
                        Ok(_) => {}
                    }
                    // A broken voice must not stall the session.
                    if let Some(done) = on_complete {
                        done();
                    }
                }
                _ = cancel_rx => {
                    debug!("speech cancelled");
                    let _ = child.kill().await;
                }
            }
        });
    }

    fn cancel_all(&mut self) {
        let running = self.in_flight();
        if running > 0 {
            debug!("cancelling {} utterances", running);
        }
        for cancel in self.running.drain(..) {
            let _ = cancel.send(());
        }
    }
}
