use std::fmt::Display;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The engine core never touches the disk itself: the host runs a storage
/// actor and the torrent talks to it over these channels. Hashing is
/// colocated with the writer, so a completed piece goes out as one
/// `WriteVerified` and comes back as exactly one of `Written`,
/// `HashMismatch` (corruption is a result variant, not an error) or
/// `Failed` (fatal I/O).
#[derive(Debug)]
pub enum StorageMessage {
    WriteVerified {
        piece: usize,
        hash: [u8; 20],
        bytes: Bytes,
    },
    Read {
        piece: usize,
    },
    /// Re-verify everything on disk, answering with a
    /// `ValidationProgress` per piece.
    Validate,
}

#[derive(Debug)]
pub enum StorageFeedback {
    /// Verified and persisted. The piece bytes travel back so the owner
    /// can reclaim the buffer once this last reference drops.
    Written { piece: usize, bytes: Bytes },
    HashMismatch { piece: usize },
    Failed { piece: usize, error: String },
    Data { piece: usize, bytes: Option<Bytes> },
    ValidationProgress { piece: usize, is_valid: bool },
}

#[derive(Debug, Clone)]
pub struct StorageHandle {
    pub message_tx: mpsc::Sender<StorageMessage>,
    pub cancellation_token: CancellationToken,
}

impl StorageHandle {
    pub fn new(
        message_tx: mpsc::Sender<StorageMessage>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            message_tx,
            cancellation_token,
        }
    }

    pub fn try_write_verified(
        &self,
        piece: usize,
        hash: [u8; 20],
        bytes: Bytes,
    ) -> anyhow::Result<()> {
        self.message_tx
            .try_send(StorageMessage::WriteVerified { piece, hash, bytes })?;
        Ok(())
    }

    pub fn try_read(&self, piece: usize) -> anyhow::Result<()> {
        self.message_tx.try_send(StorageMessage::Read { piece })?;
        Ok(())
    }

    pub async fn validate(&self) -> anyhow::Result<()> {
        self.message_tx.send(StorageMessage::Validate).await?;
        Ok(())
    }
}

/// Why a torrent entered the error state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageError {
    pub piece: usize,
    pub error: String,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "storage failure on piece {}: {}", self.piece, self.error)
    }
}

impl std::error::Error for StorageError {}
