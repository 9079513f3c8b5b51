//! Sending half of the chunk pipeline.
//!
//! Chunks are read, compressed and encrypted `parallelism` at a time on the
//! blocking pool, then handed to the channel strictly in index order.

use super::codec::{Codec, CodecRuntime};
use super::constants::{DEFAULT_PROGRESS_INTERVAL, MAX_FILE_SIZE};
use super::hash::compute_file_hash;
use super::protocol::{Chunk, FileInfo, WireMessage};
use super::receiver::REJECTED_MESSAGE;
use super::state::{FileTransferState, TransferStatus};
use super::utils::{ProgressReporter, sanitize_file_name};
use crate::AppEvent;
use crate::channel::{ChannelManager, PeerConnector, Signaling};
use crate::error::{Result, TransferError};
use crate::keyvault::{IdentityPublicKey, KeyVault, SymmetricKey, encrypt_payload};
use crate::probe::TransferProfile;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

/// Grace period for reading a peer's parting message after the link drops
const PARTING_MESSAGE_WAIT: Duration = Duration::from_millis(200);

/// A local file ready to be offered
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub hash: String,
}

impl OutgoingFile {
    pub async fn open(path: &Path) -> Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(TransferError::Protocol(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        if metadata.len() > MAX_FILE_SIZE {
            return Err(TransferError::Protocol(format!(
                "{} exceeds the {} byte limit",
                path.display(),
                MAX_FILE_SIZE
            )));
        }

        let name = path
            .file_name()
            .map(|n| sanitize_file_name(&n.to_string_lossy()))
            .unwrap_or_else(|| sanitize_file_name(""));
        let hash = compute_file_hash(path).await?;

        Ok(Self {
            path: path.to_path_buf(),
            name,
            size: metadata.len(),
            hash,
        })
    }
}

/// Receiver identity plus the session key both sides share
#[derive(Clone)]
pub struct EncryptionContext {
    pub recipient: IdentityPublicKey,
    pub session_key: SymmetricKey,
}

#[derive(Clone)]
pub struct SendOptions {
    pub profile: TransferProfile,
    pub encryption: Option<EncryptionContext>,
    pub progress_interval: Duration,
}

impl SendOptions {
    pub fn new(profile: TransferProfile) -> Self {
        Self {
            profile: profile.normalized(),
            encryption: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

pub fn chunk_count(size: u64, chunk_size: usize) -> Result<u32> {
    let count = size.div_ceil(chunk_size.max(1) as u64);
    u32::try_from(count)
        .map_err(|_| TransferError::Protocol(format!("{} chunks exceed the index range", count)))
}

/// Everything needed to produce any chunk independently
#[derive(Clone)]
struct ChunkPlan {
    /// Opened once per pass; reads seek under the lock
    source: Arc<Mutex<File>>,
    size: u64,
    chunk_size: usize,
    total: u32,
    level: u32,
    codec: CodecRuntime,
    key: Option<SymmetricKey>,
}

impl ChunkPlan {
    fn source(file: File) -> Arc<Mutex<File>> {
        Arc::new(Mutex::new(file))
    }

    /// Returns the chunk and its raw length
    async fn produce(self, index: u32) -> Result<(Chunk, u64)> {
        let offset = index as u64 * self.chunk_size as u64;
        let len = (self.size - offset).min(self.chunk_size as u64) as usize;

        let mut raw = vec![0u8; len];
        {
            let mut file = self.source.lock().await;
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(&mut raw).await?;
        }

        let ChunkPlan {
            total,
            level,
            codec,
            key,
            ..
        } = self;
        let (codec, payload, encrypted) = tokio::task::spawn_blocking(move || {
            let (codec, compressed) = codec.compress(&raw, level);
            match &key {
                Some(key) => encrypt_payload(key, &compressed).map(|ct| (codec, ct, true)),
                None => Ok((codec, compressed, false)),
            }
        })
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e)))??;

        Ok((
            Chunk {
                index,
                total,
                codec,
                encrypted,
                payload: Bytes::from(payload),
            },
            len as u64,
        ))
    }
}

fn peer_error(message: String) -> TransferError {
    if message == REJECTED_MESSAGE {
        TransferError::TransferCancelled
    } else {
        TransferError::Protocol(format!("receiver reported: {}", message))
    }
}

pub struct FileSender {
    file: OutgoingFile,
    options: SendOptions,
    codec: CodecRuntime,
    state: FileTransferState,
    event_tx: Option<mpsc::Sender<AppEvent>>,
}

impl FileSender {
    pub fn new(file: OutgoingFile, options: SendOptions, codec: CodecRuntime) -> Result<Self> {
        let total = chunk_count(file.size, options.profile.chunk_size_bytes)?;
        let state = FileTransferState::new(file.name.clone(), total);
        Ok(Self {
            file,
            options,
            codec,
            state,
            event_tx: None,
        })
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<AppEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn state(&self) -> &FileTransferState {
        &self.state
    }

    pub fn file(&self) -> &OutgoingFile {
        &self.file
    }

    /// Stream the file and wait for the receiver's acknowledgement.
    ///
    /// A connection lost mid-transfer is renegotiated on the remaining
    /// candidate servers and the file is streamed again from the start.
    pub async fn run<C: PeerConnector, S: Signaling>(
        &mut self,
        manager: &ChannelManager<C>,
        signaling: &S,
    ) -> Result<()> {
        let result = loop {
            match self.stream_once(manager).await {
                Err(TransferError::ConnectionLost(reason)) => {
                    if let Some(e) = self.parting_message(manager).await {
                        break Err(e);
                    }
                    warn!("Connection lost mid-transfer: {}", reason);
                    if let Err(e) = manager.recover_as_offerer(signaling).await {
                        break Err(e);
                    }
                }
                other => break other,
            }
        };

        match result {
            Ok(()) => {
                self.state.transition(TransferStatus::Success)?;
                info!(
                    name = %self.file.name,
                    bytes = self.state.bytes_transferred,
                    secs = self.state.start_time.elapsed().as_secs_f64(),
                    "Transfer acknowledged"
                );
                if let Some(tx) = &self.event_tx {
                    let _ = tx
                        .send(AppEvent::TransferCompleted(self.file.name.clone()))
                        .await;
                }
                manager.complete().await
            }
            Err(e) => {
                self.state.fail(e.kind());
                if matches!(e, TransferError::TransferCancelled) {
                    manager.cancel().await;
                } else {
                    manager.abort().await;
                }
                if let Some(tx) = &self.event_tx {
                    let _ = tx
                        .send(AppEvent::Error(format!("{}: {}", self.file.name, e)))
                        .await;
                }
                Err(e)
            }
        }
    }

    /// A receiver that rejects or fails sends one message before closing
    async fn parting_message<C: PeerConnector>(
        &self,
        manager: &ChannelManager<C>,
    ) -> Option<TransferError> {
        while let Ok(frame) = manager.recv_timeout(PARTING_MESSAGE_WAIT).await {
            if let Ok(WireMessage::Error { message }) = WireMessage::decode(&frame) {
                return Some(peer_error(message));
            }
        }
        None
    }

    async fn stream_once<C: PeerConnector>(&mut self, manager: &ChannelManager<C>) -> Result<()> {
        manager.begin_transfer().await?;
        self.state.transition(TransferStatus::Processing)?;

        let profile = self.options.profile;
        let total = self.state.total_chunks;

        let key = match &self.options.encryption {
            Some(enc) => {
                let key = KeyVault::generate_transfer_key()?;
                let wrapped = KeyVault::wrap_transfer_key(&enc.recipient, &key, &enc.session_key)?;
                manager
                    .send(WireMessage::TransferKey { wrapped }.encode()?)
                    .await?;
                Some(key)
            }
            None => None,
        };

        let info = FileInfo {
            name: self.file.name.clone(),
            size: self.file.size,
            total_chunks: total,
            chunk_size: profile.chunk_size_bytes as u32,
            file_hash: Some(self.file.hash.clone()),
            encrypted: key.is_some(),
        };
        manager.send(WireMessage::FileInfo(info).encode()?).await?;
        info!(
            name = %self.file.name,
            size = self.file.size,
            chunks = total,
            chunk_size = profile.chunk_size_bytes,
            parallelism = profile.parallelism,
            "Sending file"
        );

        let plan = ChunkPlan {
            source: ChunkPlan::source(File::open(&self.file.path).await?),
            size: self.file.size,
            chunk_size: profile.chunk_size_bytes,
            total,
            level: profile.compression_level,
            codec: self.codec.clone(),
            key,
        };
        let mut chunks = stream::iter(0..total)
            .map(|index| plan.clone().produce(index))
            .buffered(profile.parallelism);

        let mut progress = ProgressReporter::new(
            self.event_tx.clone(),
            self.file.name.clone(),
            true,
            self.options.progress_interval,
        );
        let mut compressed = 0usize;

        while let Some(produced) = chunks.next().await {
            let (chunk, raw_len) = produced?;
            let index = chunk.index;
            if chunk.codec != Codec::None {
                compressed += 1;
            }
            manager.send(WireMessage::Chunk(chunk).encode()?).await?;
            self.state.record_chunk(index, raw_len);
            progress
                .update(
                    self.state.chunk_count(),
                    total as usize,
                    self.state.bytes_transferred,
                )
                .await;
        }
        debug!(compressed, total, "All chunks handed to the channel");

        manager.send(WireMessage::Complete.encode()?).await?;
        self.await_ack(manager).await
    }

    async fn await_ack<C: PeerConnector>(&self, manager: &ChannelManager<C>) -> Result<()> {
        loop {
            let frame = manager.recv_timeout(self.options.profile.timeout).await?;
            match WireMessage::decode(&frame)? {
                WireMessage::Complete => return Ok(()),
                WireMessage::Error { message } => return Err(peer_error(message)),
                other => debug!("Ignoring {:?} while awaiting acknowledgement", other),
            }
        }
    }
}
