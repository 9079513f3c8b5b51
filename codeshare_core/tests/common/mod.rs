#![allow(dead_code)]

use codeshare_core::channel::ChannelOptions;
use codeshare_core::channel::memory::MemoryNetwork;
use codeshare_core::rendezvous::backend::RendezvousBackend;
use codeshare_core::{AppEvent, DeviceClass, KeyVault, RendezvousStore, SessionConfig, TransferSession};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn test_config(candidates: &[&str]) -> SessionConfig {
    SessionConfig {
        candidates: candidates.iter().map(|s| s.to_string()).collect(),
        device: DeviceClass::Desktop,
        code_ttl: Duration::from_secs(60),
        session_key_max_age: Duration::from_secs(30 * 60),
        progress_interval: Duration::from_secs(3600),
        channel: ChannelOptions {
            open_timeout: Duration::from_millis(200),
            open_retries: 1,
            retry_base_delay: Duration::from_millis(10),
            answer_timeout: Duration::from_secs(10),
            ..ChannelOptions::default()
        },
    }
}

pub fn session<B: RendezvousBackend>(
    network: &MemoryNetwork,
    store: &Arc<RendezvousStore<B>>,
    config: SessionConfig,
    cancel: CancellationToken,
) -> TransferSession<MemoryNetwork, B> {
    let vault = Arc::new(KeyVault::new().unwrap());
    TransferSession::new(network.clone(), store.clone(), vault, config, cancel)
}

/// Deterministic, poorly compressible content
pub fn pattern(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x1234_5678;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

pub async fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    tokio::fs::write(&path, data).await.unwrap();
    path
}

/// Collects every event; the first code is also forwarded on its own
pub fn collect_events(
    mut rx: mpsc::Receiver<AppEvent>,
) -> (oneshot::Receiver<String>, JoinHandle<Vec<AppEvent>>) {
    let (code_tx, code_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let mut code_tx = Some(code_tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            if let AppEvent::CodeReady { code } = &event {
                if let Some(tx) = code_tx.take() {
                    let _ = tx.send(code.clone());
                }
            }
            events.push(event);
        }
        events
    });
    (code_rx, handle)
}
