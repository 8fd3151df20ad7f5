use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::debug;
use shared::{
    protocol, Bill, CaptureErrorKind, CaptureState, ClientMessage, Config, DaemonMessage,
    SessionSnapshot,
};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(name = "kirana-client")]
#[command(about = "Drive the kirana voice billing daemon")]
struct Args {
    /// Socket of the running daemon (defaults to the configured one)
    #[arg(long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open a new sale session; the daemon greets and starts listening
    Open,
    /// Start listening for the next utterance
    Listen,
    /// Stop listening
    Stop,
    /// Deliver a whole utterance as if it had been spoken
    Say {
        text: String,
        /// Wait for the assistant's answer and print it
        #[arg(short, long)]
        wait: bool,
    },
    /// Send an interim recognizer result
    Interim { text: String },
    /// Report the end of the current utterance
    End,
    /// Report that microphone access was refused
    Deny,
    /// Retry after microphone access was refused
    Retry,
    /// Commit the pending sale as a bill
    Finalize,
    /// Discard the session without billing
    Close,
    Status,
    Bills,
    /// Remove a bill from the ledger
    Void { id: String },
    /// List the catalog with stock levels
    Stock,
    Shutdown,
}

struct Connection {
    stream: UnixStream,
    timeout: Duration,
}

impl Connection {
    async fn open(path: &Path, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .with_context(|| format!("timed out connecting to {}", path.display()))?
            .with_context(|| {
                format!("daemon not reachable at {}, is it running?", path.display())
            })?;
        Ok(Self { stream, timeout })
    }

    async fn request(&mut self, message: ClientMessage) -> Result<DaemonMessage> {
        debug!("sending {:?}", message);
        protocol::send_message(&mut self.stream, &message).await?;
        let reply: DaemonMessage =
            tokio::time::timeout(self.timeout, protocol::receive_message(&mut self.stream))
                .await
                .context("timed out waiting for the daemon")??;
        match reply {
            DaemonMessage::Error(e) => bail!("Daemon error: {}", e),
            reply => Ok(reply),
        }
    }

    async fn send(&mut self, message: ClientMessage) -> Result<()> {
        match self.request(message).await? {
            DaemonMessage::Ack => Ok(()),
            other => bail!("Unexpected response from daemon: {:?}", other),
        }
    }

    async fn status(&mut self) -> Result<SessionSnapshot> {
        match self.request(ClientMessage::GetStatus).await? {
            DaemonMessage::Status(snapshot) => Ok(snapshot),
            other => bail!("Unexpected response from daemon: {:?}", other),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = Config::load()?;
    let socket = args.socket.unwrap_or(config.ipc.socket_path);
    let timeout = Duration::from_secs(config.ipc.timeout_seconds.max(1));
    let mut conn = Connection::open(&socket, timeout).await?;

    match args.command {
        Command::Open => conn.send(ClientMessage::OpenSession).await?,
        Command::Listen => conn.send(ClientMessage::StartListening).await?,
        Command::Stop => conn.send(ClientMessage::StopListening).await?,
        Command::Say { text, wait } => {
            conn.send(ClientMessage::StartListening).await?;
            conn.send(ClientMessage::Interim(text)).await?;
            conn.send(ClientMessage::EndOfSpeech).await?;
            if wait {
                let snapshot = wait_for_answer(&mut conn, timeout).await?;
                print_status(&snapshot);
            }
        }
        Command::Interim { text } => conn.send(ClientMessage::Interim(text)).await?,
        Command::End => conn.send(ClientMessage::EndOfSpeech).await?,
        Command::Deny => {
            conn.send(ClientMessage::CaptureError(CaptureErrorKind::NotAllowed))
                .await?
        }
        Command::Retry => conn.send(ClientMessage::RetryPermission).await?,
        Command::Finalize => match conn.request(ClientMessage::Finalize).await? {
            DaemonMessage::Finalized(Some(bill)) => print_bill(&bill),
            DaemonMessage::Finalized(None) => println!("Nothing to bill"),
            other => bail!("Unexpected response from daemon: {:?}", other),
        },
        Command::Close => conn.send(ClientMessage::CloseSession).await?,
        Command::Status => {
            let snapshot = conn.status().await?;
            print_status(&snapshot);
        }
        Command::Bills => match conn.request(ClientMessage::ListBills).await? {
            DaemonMessage::Bills(bills) if bills.is_empty() => println!("No bills"),
            DaemonMessage::Bills(bills) => bills.iter().for_each(print_bill),
            other => bail!("Unexpected response from daemon: {:?}", other),
        },
        Command::Void { id } => match conn.request(ClientMessage::VoidBill(id.clone())).await? {
            DaemonMessage::Voided(Some(bill)) => println!("Voided {}", bill.id),
            DaemonMessage::Voided(None) => println!("No bill {}", id),
            other => bail!("Unexpected response from daemon: {:?}", other),
        },
        Command::Stock => match conn.request(ClientMessage::ListCatalog).await? {
            DaemonMessage::Catalog(products) => {
                for product in products {
                    println!(
                        "{:<18} {:<32} {:>6} {:<5} {:>9.2}",
                        product.sku, product.name, product.stock, product.unit, product.price
                    );
                }
            }
            other => bail!("Unexpected response from daemon: {:?}", other),
        },
        Command::Shutdown => conn.send(ClientMessage::Shutdown).await?,
    }

    Ok(())
}

/// Polls until the utterance has been processed.
async fn wait_for_answer(conn: &mut Connection, timeout: Duration) -> Result<SessionSnapshot> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let snapshot = conn.status().await?;
        if !matches!(
            snapshot.state,
            CaptureState::Listening | CaptureState::Processing
        ) {
            return Ok(snapshot);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("no answer within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn print_status(snapshot: &SessionSnapshot) {
    match snapshot.session_id {
        Some(id) => println!("Session:   {}", id),
        None => println!("Session:   none"),
    }
    println!("State:     {:?}", snapshot.state);
    if !snapshot.transcript.is_empty() {
        println!("Heard:     {}", snapshot.transcript);
    }
    if let Some(message) = &snapshot.assistant_message {
        println!("Assistant: {}", message);
    }
    println!("Intent:    {:?}", snapshot.last_intent);
    for item in &snapshot.pending {
        match item.estimated_price {
            Some(price) => println!(
                "  - {} x{} {} (~{:.2})",
                item.product_name, item.quantity, item.unit, price
            ),
            None => println!("  - {} x{} {}", item.product_name, item.quantity, item.unit),
        }
    }
}

fn print_bill(bill: &Bill) {
    let seconds = bill
        .date
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    println!(
        "{}  {:?}/{:?}  at {}",
        bill.id, bill.payment_mode, bill.status, seconds
    );
    for item in &bill.items {
        println!(
            "  {:<18} {:<32} {:>7} {:<5} {:>9.2}",
            item.sku,
            item.name,
            item.quantity,
            item.unit,
            item.line_total()
        );
    }
    println!("  Total {:.2}", bill.total);
}
