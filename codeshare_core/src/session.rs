//! Send and receive flows: code, negotiation, key exchange and the chunk
//! pipeline, wired together.

use crate::AppEvent;
use crate::channel::{ChannelManager, ChannelOptions, CodeSignaling, OfferDetails, PeerConnector};
use crate::config::AppConfig;
use crate::error::{Result, TransferError};
use crate::keyvault::{KeyVault, SessionKeySlot, SymmetricKey, decode_public_key};
use crate::probe::{DeviceClass, TransferProfile};
use crate::rendezvous::RendezvousStore;
use crate::rendezvous::backend::RendezvousBackend;
use crate::transfer::codec::CodecRuntime;
use crate::transfer::constants::{COMPRESSION_FAST, HIGH_PERFORMANCE_THRESHOLD, PARALLELISM_FAST};
use crate::transfer::receiver::{ChunkReceiver, KeySource, ReceiveOptions, ReconstructedFile, receive_file};
use crate::transfer::sender::{EncryptionContext, FileSender, OutgoingFile, SendOptions};
use crate::transfer::state::FileTransferState;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// ICE servers tried in order
    pub candidates: Vec<String>,
    pub device: DeviceClass,
    pub code_ttl: Duration,
    pub session_key_max_age: Duration,
    pub progress_interval: Duration,
    pub channel: ChannelOptions,
}

impl SessionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        let mut channel = ChannelOptions::for_device(config.device_class);
        channel.apply_profile(&TransferProfile::for_device(config.device_class));
        channel.low_water_mark = config.low_water_mark;
        Self {
            candidates: config.ice_servers.clone(),
            device: config.device_class,
            code_ttl: config.code_ttl(),
            session_key_max_age: config.session_key_max_age(),
            progress_interval: config.progress_interval(),
            channel,
        }
    }
}

/// Raise throughput for large files unless the device is constrained
pub fn high_performance_profile(profile: TransferProfile, device: DeviceClass) -> TransferProfile {
    if device.is_constrained() {
        return profile;
    }
    TransferProfile {
        parallelism: profile.parallelism.max(PARALLELISM_FAST),
        compression_level: profile.compression_level.min(COMPRESSION_FAST),
        ..profile
    }
}

/// One peer's side of one file transfer
pub struct TransferSession<C: PeerConnector, B> {
    manager: ChannelManager<C>,
    store: Arc<RendezvousStore<B>>,
    vault: Arc<KeyVault>,
    codec: CodecRuntime,
    config: SessionConfig,
    event_tx: Option<mpsc::Sender<AppEvent>>,
}

impl<C: PeerConnector, B: RendezvousBackend> TransferSession<C, B> {
    pub fn new(
        connector: C,
        store: Arc<RendezvousStore<B>>,
        vault: Arc<KeyVault>,
        config: SessionConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            manager: ChannelManager::new(connector, config.channel.clone(), cancel),
            store,
            vault,
            codec: CodecRuntime::new(),
            config,
            event_tx: None,
        }
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<AppEvent>) -> Self {
        self.manager = self.manager.with_events(event_tx.clone());
        self.event_tx = Some(event_tx);
        self
    }

    pub fn with_codec(mut self, codec: CodecRuntime) -> Self {
        self.codec = codec;
        self
    }

    pub fn manager(&self) -> &ChannelManager<C> {
        &self.manager
    }

    fn signaling_for_offer(&self) -> CodeSignaling<B> {
        let signaling = CodeSignaling::offerer(
            self.store.clone(),
            self.config.code_ttl,
            self.config.channel.answer_timeout,
        );
        match &self.event_tx {
            Some(tx) => signaling.with_events(tx.clone()),
            None => signaling,
        }
    }

    /// Offer `path` under a fresh code and stream it once a receiver connects
    pub async fn send(
        &self,
        path: &Path,
        profile: TransferProfile,
        encrypt: bool,
    ) -> Result<FileTransferState> {
        let file = OutgoingFile::open(path).await?;
        let high_performance = file.size > HIGH_PERFORMANCE_THRESHOLD;
        let profile = if high_performance {
            high_performance_profile(profile, self.config.device)
        } else {
            profile
        }
        .normalized();
        self.manager.apply_profile(&profile);

        let session_key = if encrypt {
            let slot = SessionKeySlot::new();
            self.vault
                .check_and_rotate(self.config.session_key_max_age, &slot)
                .await?;
            slot.current().await
        } else {
            None
        };

        let signaling = self.signaling_for_offer();
        let details = OfferDetails {
            chunk_size: profile.chunk_size_bytes,
            public_key: Some(self.vault.public_key_base64()),
            high_performance,
            session_key: session_key.as_ref().map(SymmetricKey::to_base64),
        };

        let result = self
            .send_negotiated(&signaling, file, profile, details, session_key)
            .await;
        if let Err(e) = signaling.release().await {
            debug!("Could not release code: {}", e);
        }
        result
    }

    async fn send_negotiated(
        &self,
        signaling: &CodeSignaling<B>,
        file: OutgoingFile,
        profile: TransferProfile,
        details: OfferDetails,
        session_key: Option<SymmetricKey>,
    ) -> Result<FileTransferState> {
        let answer = self
            .manager
            .connect_as_offerer(signaling, self.config.candidates.clone(), details)
            .await?;

        let encryption = match session_key {
            Some(session_key) => {
                let recipient = answer
                    .public_key
                    .as_deref()
                    .and_then(decode_public_key)
                    .ok_or(TransferError::KeyUnwrapFailed)?;
                Some(EncryptionContext {
                    recipient,
                    session_key,
                })
            }
            None => None,
        };

        let options = SendOptions {
            profile,
            encryption,
            progress_interval: self.config.progress_interval,
        };
        let mut sender = FileSender::new(file, options, self.codec.clone())?;
        if let Some(tx) = &self.event_tx {
            sender = sender.with_events(tx.clone());
        }
        sender.run(&self.manager, signaling).await?;
        Ok(sender.state().clone())
    }

    /// Resolve `code`, connect to its sender and reconstruct the file in staging
    pub async fn receive(
        &self,
        code: &str,
        options: ReceiveOptions,
        decision: Option<oneshot::Receiver<bool>>,
    ) -> Result<ReconstructedFile> {
        let signaling = CodeSignaling::answerer(
            self.store.clone(),
            code,
            self.config.channel.answer_timeout,
        )?;
        let offer = self
            .manager
            .connect_as_answerer(&signaling, Some(self.vault.public_key_base64()))
            .await?;
        info!(
            chunk_size = offer.chunk_size,
            high_performance = offer.high_performance,
            "Connected to sender"
        );

        let mut receiver = ChunkReceiver::new(options, self.codec.clone());
        if let Some(tx) = &self.event_tx {
            receiver = receiver.with_events(tx.clone());
        }
        if let Some(key) = offer.session_key.as_deref().and_then(SymmetricKey::from_base64) {
            self.vault.adopt_session_key(key.clone()).await;
            receiver = receiver.with_keys(KeySource {
                vault: self.vault.clone(),
                session_key: key,
            });
        }

        let result = receive_file(&self.manager, &signaling, &mut receiver, decision).await;
        match &result {
            Ok(file) => {
                self.manager.complete().await?;
                if let Some(tx) = &self.event_tx {
                    let _ = tx
                        .send(AppEvent::FileReconstructed {
                            name: file.state.file_name.clone(),
                            size: file.info.size,
                        })
                        .await;
                }
            }
            Err(TransferError::TransferCancelled) => self.manager.cancel().await,
            Err(_) => self.manager.abort().await,
        }
        result
    }

    /// [`receive`](Self::receive), then write the file into `dir`
    pub async fn receive_to(
        &self,
        code: &str,
        dir: &Path,
        mut options: ReceiveOptions,
        decision: Option<oneshot::Receiver<bool>>,
    ) -> Result<PathBuf> {
        // Staging beside the target keeps the final move a rename
        options
            .staging_dir
            .get_or_insert_with(|| dir.to_path_buf());
        let file = self.receive(code, options, decision).await?;
        let path = file.save_to(dir).await?;
        if let Some(tx) = &self.event_tx {
            let _ = tx
                .send(AppEvent::FileSaved { path: path.clone() })
                .await;
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_performance_profile() {
        let base = TransferProfile {
            parallelism: 1,
            compression_level: 11,
            ..TransferProfile::with_chunk_size(4096)
        };
        let boosted = high_performance_profile(base, DeviceClass::Desktop);
        assert_eq!(boosted.parallelism, PARALLELISM_FAST);
        assert_eq!(boosted.compression_level, COMPRESSION_FAST);
        assert_eq!(boosted.chunk_size_bytes, 4096);

        assert_eq!(high_performance_profile(base, DeviceClass::Mobile), base);
    }

    #[test]
    fn test_config_carries_low_water_mark() {
        let app = AppConfig {
            low_water_mark: 4096,
            ..AppConfig::default()
        };
        let config = SessionConfig::from_app_config(&app);
        assert_eq!(config.channel.low_water_mark, 4096);
        assert_eq!(config.candidates, app.ice_servers);
    }

    #[test]
    fn test_mobile_config_gets_more_patience() {
        let mobile = SessionConfig::from_app_config(&AppConfig {
            device_class: DeviceClass::Mobile,
            ..AppConfig::default()
        });
        let desktop = SessionConfig::from_app_config(&AppConfig::default());
        assert_eq!(
            mobile.channel.open_retries,
            desktop.channel.open_retries + crate::transfer::constants::CONSTRAINED_EXTRA_RETRIES
        );
        assert!(mobile.channel.completion_timeout > desktop.channel.completion_timeout);
        assert!(mobile.progress_interval > desktop.progress_interval);
    }

    #[tokio::test]
    async fn test_send_adopts_profile_retry_policy() {
        use crate::channel::memory::MemoryNetwork;
        use crate::probe::RetryStrategy;
        use crate::rendezvous::MemoryBackend;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        tokio::fs::write(&path, vec![1u8; 2048]).await.unwrap();

        let network = MemoryNetwork::new();
        network.fail_server("down").await;
        let mut config = SessionConfig::from_app_config(&AppConfig::default());
        config.candidates = vec!["down".into()];
        let session = TransferSession::new(
            network,
            Arc::new(RendezvousStore::new(MemoryBackend::new())),
            Arc::new(KeyVault::new().unwrap()),
            config,
            CancellationToken::new(),
        );

        let profile = TransferProfile {
            retry_attempts: 0,
            retry_strategy: RetryStrategy::Linear,
            timeout: Duration::from_secs(7),
            ..TransferProfile::with_chunk_size(1024)
        };
        assert!(session.send(&path, profile, false).await.is_err());

        let options = session.manager().options();
        assert_eq!(options.open_retries, 0);
        assert_eq!(options.retry_strategy, RetryStrategy::Linear);
        assert_eq!(options.completion_timeout, Duration::from_secs(7));
    }
}
