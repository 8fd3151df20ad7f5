use log::{debug, error, info};
use shared::{ClientMessage, DaemonMessage};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::capture::CaptureEvent;
use crate::controller::ControllerHandle;

/// Front door of the daemon: turns client requests into controller commands.
#[derive(Clone)]
pub struct Daemon {
    controller: ControllerHandle,
    shutdown: Arc<Notify>,
}

impl Daemon {
    pub fn new(controller: ControllerHandle) -> Self {
        Self {
            controller,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Resolves once a client has asked the daemon to exit.
    pub async fn shutdown_requested(&self) {
        self.shutdown.notified().await
    }

    pub async fn handle_message(&self, message: ClientMessage) -> DaemonMessage {
        debug!("Handling client message: {:?}", message);

        let controller = &self.controller;
        let reply = match message {
            ClientMessage::OpenSession => controller.open_session().map(|_| DaemonMessage::Ack),
            ClientMessage::CloseSession => controller.close_session().map(|_| DaemonMessage::Ack),
            ClientMessage::StartListening => {
                controller.start_listening().map(|_| DaemonMessage::Ack)
            }
            ClientMessage::StopListening => controller.stop_listening().map(|_| DaemonMessage::Ack),
            ClientMessage::Interim(text) => controller
                .capture_event(CaptureEvent::Interim(text))
                .map(|_| DaemonMessage::Ack),
            ClientMessage::EndOfSpeech => controller
                .capture_event(CaptureEvent::End)
                .map(|_| DaemonMessage::Ack),
            ClientMessage::CaptureError(kind) => controller
                .capture_event(CaptureEvent::Error(kind))
                .map(|_| DaemonMessage::Ack),
            ClientMessage::RetryPermission => {
                controller.retry_permission().map(|_| DaemonMessage::Ack)
            }
            ClientMessage::Finalize => controller.finalize().await.map(DaemonMessage::Finalized),
            ClientMessage::GetStatus => controller.status().await.map(DaemonMessage::Status),
            ClientMessage::ListBills => controller.bills().await.map(DaemonMessage::Bills),
            ClientMessage::VoidBill(id) => controller.void_bill(id).await.map(DaemonMessage::Voided),
            ClientMessage::ListCatalog => controller.catalog().await.map(DaemonMessage::Catalog),
            ClientMessage::Shutdown => {
                info!("Received shutdown command");
                let stopped = controller.shutdown();
                self.shutdown.notify_one();
                stopped.map(|_| DaemonMessage::Ack)
            }
        };

        reply.unwrap_or_else(|e| {
            error!("Failed to handle client message: {}", e);
            DaemonMessage::Error(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureDevice, CaptureError};
    use crate::controller::{self, ControllerSettings};
    use crate::extraction::Extractor;
    use crate::speech::{SpeechDone, Synthesizer};
    use crate::till::{Catalog, Till};
    use async_trait::async_trait;
    use shared::{CaptureState, ExtractionResult, Intent, LineItem, Product};
    use std::time::Duration;

    struct AlwaysOn;

    impl CaptureDevice for AlwaysOn {
        fn start(&mut self) -> Result<(), CaptureError> {
            Ok(())
        }

        fn stop(&mut self) {}
    }

    struct Silent;

    impl Synthesizer for Silent {
        fn speak(&mut self, _text: &str, on_complete: Option<SpeechDone>) {
            if let Some(done) = on_complete {
                done();
            }
        }

        fn cancel_all(&mut self) {}
    }

    struct OneSalt;

    #[async_trait]
    impl Extractor for OneSalt {
        async fn extract(&self, _transcript: &str, _role: &str) -> ExtractionResult {
            ExtractionResult {
                message: "Ek namak".to_string(),
                intent: Intent::RecordSale,
                items: vec![LineItem::new("Salt", 1.0, "pkt")],
                payment_mode: None,
            }
        }
    }

    fn daemon() -> Daemon {
        let salt = Product {
            sku: "SPC-SAL-TAT-1".to_string(),
            name: "Tata Salt 1kg".to_string(),
            category: "Spices".to_string(),
            stock: 5,
            price: 28.0,
            unit: "pcs".to_string(),
        };
        let handle = controller::spawn(
            ControllerSettings {
                role: "RETAILER".to_string(),
                start_retry_delay: Duration::from_millis(10),
                greeting: "Namaste".to_string(),
                follow_up: "Aur kuch?".to_string(),
            },
            Till::new(Catalog::new(vec![salt]), "pcs"),
            Box::new(AlwaysOn),
            Box::new(Silent),
            Arc::new(OneSalt),
        );
        Daemon::new(handle)
    }

    async fn state(daemon: &Daemon) -> CaptureState {
        match daemon.handle_message(ClientMessage::GetStatus).await {
            DaemonMessage::Status(snapshot) => snapshot.state,
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn spoken_turn_then_finalize() {
        let daemon = daemon();
        for message in [
            ClientMessage::StartListening,
            ClientMessage::Interim("ek namak".to_string()),
            ClientMessage::EndOfSpeech,
        ] {
            assert!(matches!(daemon.handle_message(message).await, DaemonMessage::Ack));
        }

        for _ in 0..200 {
            if state(&daemon).await == CaptureState::AwaitingUser {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let bill = match daemon.handle_message(ClientMessage::Finalize).await {
            DaemonMessage::Finalized(Some(bill)) => bill,
            other => panic!("unexpected reply {:?}", other),
        };
        assert_eq!(bill.total, 28.0);

        match daemon.handle_message(ClientMessage::ListCatalog).await {
            DaemonMessage::Catalog(products) => assert_eq!(products[0].stock, 4),
            other => panic!("unexpected reply {:?}", other),
        }
        match daemon.handle_message(ClientMessage::VoidBill(bill.id)).await {
            DaemonMessage::Voided(Some(_)) => {}
            other => panic!("unexpected reply {:?}", other),
        }
        match daemon.handle_message(ClientMessage::ListBills).await {
            DaemonMessage::Bills(bills) => assert!(bills.is_empty()),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn requests_after_shutdown_report_an_error() {
        let daemon = daemon();
        assert!(matches!(
            daemon.handle_message(ClientMessage::Shutdown).await,
            DaemonMessage::Ack
        ));
        tokio::time::timeout(Duration::from_secs(1), daemon.shutdown_requested())
            .await
            .unwrap();

        // The controller task drops its queue once it has stopped.
        let mut reply = daemon.handle_message(ClientMessage::GetStatus).await;
        for _ in 0..50 {
            if matches!(reply, DaemonMessage::Error(_)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            reply = daemon.handle_message(ClientMessage::GetStatus).await;
        }
        assert!(matches!(reply, DaemonMessage::Error(_)));
    }
}
