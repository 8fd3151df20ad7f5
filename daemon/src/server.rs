use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use shared::{protocol, ClientMessage, DaemonMessage};
use std::path::Path;
use tokio::net::{UnixListener, UnixStream};

use crate::daemon::Daemon;

/// Accepts clients on `socket_path` until a client asks for shutdown.
pub async fn serve(socket_path: &Path, daemon: Daemon) -> Result<()> {
    if socket_path.exists() {
        warn!("Removing stale socket {}", socket_path.display());
        std::fs::remove_file(socket_path)
            .with_context(|| format!("failed to remove {}", socket_path.display()))?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;
    info!("Listening on {}", socket_path.display());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let daemon = daemon.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, daemon).await {
                                warn!("Client connection failed: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            }
            _ = daemon.shutdown_requested() => break,
        }
    }

    if let Err(e) = std::fs::remove_file(socket_path) {
        debug!("socket already gone: {}", e);
    }
    info!("Server stopped");
    Ok(())
}

async fn handle_connection(mut stream: UnixStream, daemon: Daemon) -> Result<()> {
    debug!("client connected");
    loop {
        let message: ClientMessage = match protocol::receive_message(&mut stream).await {
            Ok(message) => message,
            Err(e) => {
                // A closed connection is the normal way for a client to leave.
                debug!("client disconnected: {}", e);
                return Ok(());
            }
        };

        let stop = matches!(message, ClientMessage::Shutdown);
        let reply: DaemonMessage = daemon.handle_message(message).await;
        protocol::send_message(&mut stream, &reply).await?;
        if stop {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::RemoteCapture;
    use crate::controller::{self, ControllerSettings};
    use crate::extraction::Extractor;
    use crate::speech::CommandSynthesizer;
    use crate::till::{Catalog, Till};
    use async_trait::async_trait;
    use shared::{CaptureState, ExtractionResult, SpeechConfig};
    use std::sync::Arc;
    use std::time::Duration;

    struct Unreachable;

    #[async_trait]
    impl Extractor for Unreachable {
        async fn extract(&self, _transcript: &str, _role: &str) -> ExtractionResult {
            ExtractionResult::fallback()
        }
    }

    fn daemon() -> Daemon {
        let handle = controller::spawn(
            ControllerSettings {
                role: "RETAILER".to_string(),
                start_retry_delay: Duration::from_millis(10),
                greeting: "Namaste".to_string(),
                follow_up: "Aur kuch?".to_string(),
            },
            Till::new(Catalog::default(), "pcs"),
            Box::new(RemoteCapture::new(Duration::from_millis(50))),
            Box::new(CommandSynthesizer::new(&SpeechConfig::default(), "en-IN")),
            Arc::new(Unreachable),
        );
        Daemon::new(handle)
    }

    async fn connect(path: &Path) -> UnixStream {
        for _ in 0..100 {
            if let Ok(stream) = UnixStream::connect(path).await {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("daemon never came up");
    }

    #[tokio::test]
    async fn serves_requests_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kirana.sock");
        std::fs::write(&path, b"stale").unwrap();

        let server = tokio::spawn({
            let path = path.clone();
            async move { serve(&path, daemon()).await }
        });

        let mut stream = connect(&path).await;
        protocol::send_message(&mut stream, &ClientMessage::OpenSession).await.unwrap();
        let reply: DaemonMessage = protocol::receive_message(&mut stream).await.unwrap();
        assert!(matches!(reply, DaemonMessage::Ack));

        let mut state = CaptureState::Idle;
        for _ in 0..100 {
            protocol::send_message(&mut stream, &ClientMessage::GetStatus).await.unwrap();
            match protocol::receive_message(&mut stream).await.unwrap() {
                DaemonMessage::Status(snapshot) => {
                    assert!(snapshot.session_id.is_some());
                    state = snapshot.state;
                }
                other => panic!("unexpected reply {:?}", other),
            }
            if state == CaptureState::Listening {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, CaptureState::Listening);

        let mut other = connect(&path).await;
        protocol::send_message(&mut other, &ClientMessage::Shutdown).await.unwrap();
        let reply: DaemonMessage = protocol::receive_message(&mut other).await.unwrap();
        assert!(matches!(reply, DaemonMessage::Ack));

        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!path.exists());
    }
}
