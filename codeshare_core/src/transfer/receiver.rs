//! Receiving half of the chunk pipeline.
//!
//! Chunks may arrive in any order; each is decrypted, decompressed and written
//! straight to a private staging file at its offset. Only the set of received
//! indices stays in memory. On `complete` the receiver checks that every index
//! is present and the staged bytes hash correctly, so a short transfer never
//! yields a file.

use super::codec::CodecRuntime;
use super::constants::{DEFAULT_PROGRESS_INTERVAL, MAX_FILE_SIZE};
use super::hash::compute_file_hash;
use super::protocol::{Chunk, FileInfo, WireMessage};
use super::state::{FileTransferState, TransferStatus};
use super::utils::{ProgressReporter, open_secure_file, sanitize_file_name, validate_transfer_info};
use crate::AppEvent;
use crate::channel::{ChannelManager, PeerConnector, Signaling};
use crate::error::{ErrorKind, Result, TransferError};
use crate::keyvault::{KeyVault, SymmetricKey, decrypt_payload};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Message the receiver sends when the user declines a file
pub const REJECTED_MESSAGE: &str = "transfer rejected by receiver";

/// Smallest chunk size accepted for multi-chunk files
const MIN_CHUNK_SIZE: u32 = 1024;

const STAGING_SUFFIX: &str = ".part";

#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    /// Skip the `WaitingAccept` stage
    pub auto_accept: bool,
    pub max_size: u64,
    pub progress_interval: Duration,
    /// Where incoming bytes are staged; the system temp dir when unset
    pub staging_dir: Option<PathBuf>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            auto_accept: true,
            max_size: MAX_FILE_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            staging_dir: None,
        }
    }
}

/// Identity and session key used to unwrap an incoming transfer key
#[derive(Clone)]
pub struct KeySource {
    pub vault: Arc<KeyVault>,
    pub session_key: SymmetricKey,
}

/// Staging file that is removed on drop unless it was moved into place
#[derive(Debug)]
struct StagedFile {
    path: PathBuf,
    keep: bool,
}

impl StagedFile {
    async fn create(dir: &Path) -> Result<(Self, File)> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!(".codeshare-{}{}", Uuid::new_v4(), STAGING_SUFFIX));
        let file = open_secure_file(&path).await?;
        debug!(path = %path.display(), "Staging incoming file");
        Ok((Self { path, keep: false }, file))
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.keep {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// A verified file, still in its staging location until saved
#[derive(Debug)]
pub struct ReconstructedFile {
    pub info: FileInfo,
    pub state: FileTransferState,
    staged: StagedFile,
}

impl ReconstructedFile {
    /// Where the verified bytes currently live
    pub fn path(&self) -> &Path {
        &self.staged.path
    }

    /// Move into `dir` under the sanitised name, never overwriting
    pub async fn save_to(mut self, dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = unique_path(dir, &sanitize_file_name(&self.info.name)).await;
        if let Err(e) = tokio::fs::rename(&self.staged.path, &path).await {
            // Staging may sit on another filesystem
            debug!("Rename failed ({}), copying instead", e);
            tokio::fs::copy(&self.staged.path, &path).await?;
        } else {
            self.staged.keep = true;
        }
        info!(path = %path.display(), size = self.info.size, "File saved");
        Ok(path)
    }
}

async fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }
    let (stem, ext) = match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    };
    let mut n = 1;
    loop {
        let candidate = dir.join(format!("{} ({}){}", stem, n, ext));
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}

/// Decoded length chunk `index` must have
fn expected_chunk_len(info: &FileInfo, index: u32) -> u64 {
    let offset = index as u64 * info.chunk_size as u64;
    (info.size - offset).min(info.chunk_size as u64)
}

#[derive(Debug)]
pub enum ReceiveStep {
    Continue,
    /// `file-info` arrived and the user must accept or reject
    AwaitingAcceptance,
    Finished(ReconstructedFile),
}

pub struct ChunkReceiver {
    options: ReceiveOptions,
    codec: CodecRuntime,
    keys: Option<KeySource>,
    transfer_key: Option<SymmetricKey>,
    info: Option<FileInfo>,
    staged: Option<(StagedFile, File)>,
    state: Option<FileTransferState>,
    progress: Option<ProgressReporter>,
    event_tx: Option<mpsc::Sender<AppEvent>>,
}

impl ChunkReceiver {
    pub fn new(options: ReceiveOptions, codec: CodecRuntime) -> Self {
        Self {
            options,
            codec,
            keys: None,
            transfer_key: None,
            info: None,
            staged: None,
            state: None,
            progress: None,
            event_tx: None,
        }
    }

    pub fn with_keys(mut self, keys: KeySource) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<AppEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// A renegotiated offer may carry a newer session key
    pub fn update_session_key(&mut self, session_key: SymmetricKey) {
        if let Some(keys) = &mut self.keys {
            keys.session_key = session_key;
        }
    }

    pub fn state(&self) -> Option<&FileTransferState> {
        self.state.as_ref()
    }

    pub fn file_info(&self) -> Option<&FileInfo> {
        self.info.as_ref()
    }

    pub fn accept(&mut self) -> Result<()> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| TransferError::Protocol("nothing to accept".into()))?;
        state.transition(TransferStatus::Processing)
    }

    pub fn reject(&mut self) {
        self.fail(ErrorKind::TransferCancelled);
        self.staged = None;
    }

    pub fn fail(&mut self, kind: ErrorKind) {
        if let Some(state) = &mut self.state {
            state.fail(kind);
        }
    }

    /// Apply one message; any error also moves the state to `Error`
    pub async fn handle(&mut self, msg: WireMessage) -> Result<ReceiveStep> {
        let result = self.apply(msg).await;
        if let Err(e) = &result {
            self.fail(e.kind());
            self.staged = None;
        }
        result
    }

    async fn apply(&mut self, msg: WireMessage) -> Result<ReceiveStep> {
        match msg {
            WireMessage::TransferKey { wrapped } => {
                let keys = self.keys.as_ref().ok_or(TransferError::KeyUnwrapFailed)?;
                let key = keys.vault.unwrap_transfer_key(&keys.session_key, &wrapped)?;
                debug!("Transfer key unwrapped");
                self.transfer_key = Some(key);
                Ok(ReceiveStep::Continue)
            }
            WireMessage::FileInfo(info) => self.on_file_info(info).await,
            WireMessage::Chunk(chunk) => self.on_chunk(chunk).await,
            WireMessage::Complete => self.on_complete().await,
            WireMessage::Error { message } => Err(TransferError::Protocol(format!(
                "sender aborted: {}",
                message
            ))),
        }
    }

    async fn on_file_info(&mut self, info: FileInfo) -> Result<ReceiveStep> {
        if let Some(current) = &self.info {
            // Resent after renegotiation
            if *current == info {
                return Ok(ReceiveStep::Continue);
            }
            return Err(TransferError::Protocol(format!(
                "unexpected second file-info for {}",
                info.name
            )));
        }

        validate_transfer_info(&info.name, info.size, self.options.max_size)?;
        let expected = if info.chunk_size == 0 {
            if info.size == 0 { 0 } else { u64::MAX }
        } else {
            info.size.div_ceil(info.chunk_size as u64)
        };
        if expected != info.total_chunks as u64 {
            return Err(TransferError::Protocol(format!(
                "{} bytes in {} byte chunks is not {} chunks",
                info.size, info.chunk_size, info.total_chunks
            )));
        }
        if info.total_chunks > 1 && info.chunk_size < MIN_CHUNK_SIZE {
            return Err(TransferError::Protocol(format!(
                "chunk size {} is below the minimum of {}",
                info.chunk_size, MIN_CHUNK_SIZE
            )));
        }
        if info.encrypted && self.transfer_key.is_none() {
            return Err(TransferError::KeyUnwrapFailed);
        }

        let name = sanitize_file_name(&info.name);
        info!(name = %name, size = info.size, chunks = info.total_chunks, "Incoming file");

        let staging_dir = self
            .options
            .staging_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        self.staged = Some(StagedFile::create(&staging_dir).await?);
        self.state = Some(FileTransferState::new(name.clone(), info.total_chunks));
        self.progress = Some(ProgressReporter::new(
            self.event_tx.clone(),
            name.clone(),
            false,
            self.options.progress_interval,
        ));
        if let Some(tx) = &self.event_tx {
            let _ = tx
                .send(AppEvent::IncomingFile {
                    name,
                    size: info.size,
                })
                .await;
        }
        self.info = Some(info);

        let state = self.state.as_mut().ok_or_else(|| {
            TransferError::Protocol("transfer state missing after file-info".into())
        })?;
        if self.options.auto_accept {
            state.transition(TransferStatus::Processing)?;
            Ok(ReceiveStep::Continue)
        } else {
            state.transition(TransferStatus::WaitingAccept)?;
            Ok(ReceiveStep::AwaitingAcceptance)
        }
    }

    async fn on_chunk(&mut self, chunk: Chunk) -> Result<ReceiveStep> {
        let (Some(info), Some(state)) = (&self.info, &mut self.state) else {
            return Err(TransferError::Protocol("chunk before file-info".into()));
        };
        if state.status().is_terminal() {
            return Err(TransferError::Protocol("chunk after the transfer ended".into()));
        }
        if chunk.total != info.total_chunks || chunk.index >= info.total_chunks {
            return Err(TransferError::Protocol(format!(
                "chunk {} of {} does not fit the {} chunks file-info announced",
                chunk.index, chunk.total, info.total_chunks
            )));
        }

        let payload = if chunk.encrypted {
            let key = self.transfer_key.as_ref().ok_or(TransferError::KeyUnwrapFailed)?;
            decrypt_payload(key, &chunk.payload)?
        } else if info.encrypted {
            return Err(TransferError::Protocol(format!(
                "unencrypted chunk {} in an encrypted transfer",
                chunk.index
            )));
        } else {
            chunk.payload.to_vec()
        };
        let expected = expected_chunk_len(info, chunk.index);
        let data = self
            .codec
            .decompress(chunk.codec, &payload, expected as usize)?;
        let len = data.len() as u64;
        if len != expected {
            return Err(TransferError::Protocol(format!(
                "chunk {} decoded to {} bytes, expected {}",
                chunk.index, len, expected
            )));
        }

        let (_, file) = self
            .staged
            .as_mut()
            .ok_or_else(|| TransferError::Protocol("no staging file for chunk".into()))?;
        // Redelivery overwrites
        file.seek(SeekFrom::Start(chunk.index as u64 * info.chunk_size as u64))
            .await?;
        file.write_all(&data).await?;
        state.record_chunk(chunk.index, len);

        if let Some(progress) = &mut self.progress {
            progress
                .update(state.chunk_count(), state.total_chunks as usize, state.bytes_transferred)
                .await;
        }
        Ok(ReceiveStep::Continue)
    }

    async fn on_complete(&mut self) -> Result<ReceiveStep> {
        let (Some(info), Some(state)) = (&self.info, &mut self.state) else {
            return Err(TransferError::Protocol("complete before file-info".into()));
        };
        if state.status() != TransferStatus::Processing {
            return Err(TransferError::Protocol(format!(
                "complete while {:?}",
                state.status()
            )));
        }

        let received = state.chunk_count();
        let total = info.total_chunks as usize;
        if received != total {
            warn!(received, total, "Sender completed with chunks missing");
            return Err(TransferError::TransferIncomplete { received, total });
        }

        let (staged, mut file) = self
            .staged
            .take()
            .ok_or_else(|| TransferError::Protocol("no staging file to complete".into()))?;
        file.flush().await?;
        file.sync_all().await?;
        let written = file.metadata().await?.len();
        drop(file);
        if written != info.size {
            return Err(TransferError::Protocol(format!(
                "reconstructed {} bytes, expected {}",
                written, info.size
            )));
        }
        if let Some(expected) = &info.file_hash {
            let actual = compute_file_hash(&staged.path).await?;
            if &actual != expected {
                return Err(TransferError::Protocol(format!(
                    "hash mismatch: expected {}, got {}",
                    expected, actual
                )));
            }
        }

        state.transition(TransferStatus::Success)?;
        info!(name = %state.file_name, size = written, "File reconstructed");

        Ok(ReceiveStep::Finished(ReconstructedFile {
            info: info.clone(),
            state: state.clone(),
            staged,
        }))
    }
}

async fn send_best_effort<C: PeerConnector>(manager: &ChannelManager<C>, msg: WireMessage) {
    match msg.encode() {
        Ok(frame) => {
            if let Err(e) = manager.send(frame).await {
                debug!("Could not notify sender: {}", e);
            }
        }
        Err(e) => debug!("Could not encode notification: {}", e),
    }
}

/// Drive `receiver` from the channel until a file is reconstructed.
///
/// A lost connection is renegotiated through `signaling`. When the receiver
/// does not auto-accept, `decision` yields the user's answer; a missing or
/// dropped decision counts as a rejection.
pub async fn receive_file<C: PeerConnector, S: Signaling>(
    manager: &ChannelManager<C>,
    signaling: &S,
    receiver: &mut ChunkReceiver,
    mut decision: Option<oneshot::Receiver<bool>>,
) -> Result<ReconstructedFile> {
    manager.begin_transfer().await?;

    loop {
        let frame = match manager.recv().await {
            Ok(frame) => frame,
            Err(TransferError::ConnectionLost(reason)) => {
                warn!("Connection lost while receiving: {}", reason);
                match manager.recover_as_answerer(signaling).await {
                    Ok(offer) => {
                        if let Some(key) = offer.session_key.as_deref().and_then(SymmetricKey::from_base64) {
                            receiver.update_session_key(key);
                        }
                        manager.begin_transfer().await?;
                        continue;
                    }
                    Err(e) => {
                        receiver.fail(e.kind());
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                receiver.fail(e.kind());
                return Err(e);
            }
        };

        let step = match WireMessage::decode(&frame) {
            Ok(msg) => receiver.handle(msg).await,
            Err(e) => {
                receiver.fail(e.kind());
                Err(e)
            }
        };

        match step {
            Ok(ReceiveStep::Continue) => {}
            Ok(ReceiveStep::AwaitingAcceptance) => {
                let accepted = match decision.take() {
                    Some(rx) => rx.await.unwrap_or(false),
                    None => false,
                };
                if accepted {
                    receiver.accept()?;
                } else {
                    info!("Transfer rejected");
                    receiver.reject();
                    send_best_effort(
                        manager,
                        WireMessage::Error {
                            message: REJECTED_MESSAGE.to_string(),
                        },
                    )
                    .await;
                    return Err(TransferError::TransferCancelled);
                }
            }
            Ok(ReceiveStep::Finished(file)) => {
                send_best_effort(manager, WireMessage::Complete).await;
                return Ok(file);
            }
            Err(e) => {
                if !matches!(e, TransferError::TransferCancelled) {
                    send_best_effort(
                        manager,
                        WireMessage::Error {
                            message: e.to_string(),
                        },
                    )
                    .await;
                }
                return Err(e);
            }
        }
    }
}
