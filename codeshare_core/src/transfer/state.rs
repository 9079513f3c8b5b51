//! Per-file transfer bookkeeping.

use crate::error::{ErrorKind, Result, TransferError};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferStatus {
    Pending,
    WaitingAccept,
    Processing,
    Success,
    Error,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (Success | Error, _) => false,
            (_, Error) => true,
            (Pending, WaitingAccept | Processing) => true,
            (WaitingAccept, Processing) => true,
            (Processing, Success) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileTransferState {
    pub file_id: Uuid,
    pub file_name: String,
    pub total_chunks: u32,
    pub bytes_transferred: u64,
    pub start_time: Instant,
    chunks: BTreeSet<u32>,
    status: TransferStatus,
    error: Option<ErrorKind>,
    history: Vec<TransferStatus>,
}

impl FileTransferState {
    pub fn new(file_name: impl Into<String>, total_chunks: u32) -> Self {
        Self {
            file_id: Uuid::new_v4(),
            file_name: file_name.into(),
            total_chunks,
            bytes_transferred: 0,
            start_time: Instant::now(),
            chunks: BTreeSet::new(),
            status: TransferStatus::Pending,
            error: None,
            history: vec![TransferStatus::Pending],
        }
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error
    }

    /// Every status this transfer has been in, oldest first
    pub fn history(&self) -> &[TransferStatus] {
        &self.history
    }

    pub fn transition(&mut self, next: TransferStatus) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(TransferError::Protocol(format!(
                "illegal transfer transition {:?} -> {:?}",
                self.status, next
            )));
        }
        self.status = next;
        self.history.push(next);
        Ok(())
    }

    /// Move to `Error`; a transfer that already finished keeps its outcome
    pub fn fail(&mut self, kind: ErrorKind) {
        if self.status.is_terminal() {
            return;
        }
        self.error = Some(kind);
        self.status = TransferStatus::Error;
        self.history.push(TransferStatus::Error);
    }

    /// Returns whether the index was new; redelivery is harmless
    pub fn record_chunk(&mut self, index: u32, bytes: u64) -> bool {
        if self.status.is_terminal() || !self.chunks.insert(index) {
            return false;
        }
        self.bytes_transferred += bytes;
        true
    }

    pub fn has_chunk(&self, index: u32) -> bool {
        self.chunks.contains(&index)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.len() == self.total_chunks as usize
    }

    /// Fraction of chunks seen, in `[0, 1]`
    pub fn progress(&self) -> f32 {
        if self.total_chunks == 0 {
            return 1.0;
        }
        self.chunks.len() as f32 / self.total_chunks as f32
    }
}
