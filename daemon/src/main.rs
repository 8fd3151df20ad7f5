use anyhow::Result;
use log::{info, warn};
use shared::Config;
use std::sync::Arc;
use std::time::Duration;

mod capture;
mod controller;
mod daemon;
mod extraction;
mod reconcile;
mod server;
mod session;
mod speech;
mod till;

use capture::RemoteCapture;
use controller::ControllerSettings;
use daemon::Daemon;
use extraction::GeminiExtractor;
use speech::CommandSynthesizer;
use till::{Catalog, Till};

/// How long a stopped remote recognizer may take to report its end.
const CAPTURE_SETTLE: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    info!("Starting kirana voice daemon");

    let config = Config::load()?;

    let catalog = match &config.till.catalog_path {
        Some(path) => Catalog::load(path)?,
        None => {
            warn!("No catalog configured, every item will be billed as unknown");
            Catalog::default()
        }
    };

    let extractor = GeminiExtractor::new(&config.extraction, &config.till.default_unit)?;

    let controller = controller::spawn(
        ControllerSettings::from_config(&config),
        Till::new(catalog, &config.till.default_unit),
        Box::new(RemoteCapture::new(CAPTURE_SETTLE)),
        Box::new(CommandSynthesizer::new(&config.speech, &config.capture.language)),
        Arc::new(extractor),
    );

    server::serve(&config.ipc.socket_path, Daemon::new(controller)).await
}
