use serde::{Deserialize, Serialize};
use crate::types::{Bill, Product, SessionSnapshot};

/// Capture failures as reported by the recognizer front-end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CaptureErrorKind {
    NotAllowed,
    NoSpeech,
    Aborted,
    Network,
    Other(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    OpenSession,
    CloseSession,
    StartListening,
    StopListening,
    Interim(String),
    EndOfSpeech,
    CaptureError(CaptureErrorKind),
    RetryPermission,
    Finalize,
    GetStatus,
    ListBills,
    VoidBill(String),
    ListCatalog,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonMessage {
    Ack,
    Status(SessionSnapshot),
    Finalized(Option<Bill>),
    Bills(Vec<Bill>),
    Voided(Option<Bill>),
    Catalog(Vec<Product>),
    Error(String),
}

pub mod protocol {
    use super::*;
    use anyhow::{bail, Result};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    /// Largest message body accepted in either direction.
    pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

    pub async fn send_message<S, T>(stream: &mut S, message: &T) -> Result<()>
    where
        S: AsyncWrite + Unpin,
        T: Serialize,
    {
        let serialized = rmp_serde::to_vec(message)?;
        if serialized.len() > MAX_FRAME_LEN {
            bail!(
                "message of {} bytes exceeds the {} byte frame limit",
                serialized.len(),
                MAX_FRAME_LEN
            );
        }
        let len = serialized.len() as u32;

        stream.write_all(&len.to_le_bytes()).await?;
        stream.write_all(&serialized).await?;
        stream.flush().await?;

        Ok(())
    }

    pub async fn receive_message<S, T>(stream: &mut S) -> Result<T>
    where
        S: AsyncRead + Unpin,
        T: for<'de> Deserialize<'de>,
    {
        let mut len_bytes = [0u8; 4];
        stream.read_exact(&mut len_bytes).await?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            bail!("peer announced a {} byte frame, limit is {}", len, MAX_FRAME_LEN);
        }

        let mut buffer = vec![0u8; len];
        stream.read_exact(&mut buffer).await?;

        let message = rmp_serde::from_slice(&buffer)?;
        Ok(message)
    }
}
