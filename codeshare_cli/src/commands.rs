use anyhow::{Context, Result};
use codeshare_core::config::{AppConfig, BackendKind};
use codeshare_core::probe::{ConnectionClass, HttpProbe, NetworkProbe};
use codeshare_core::rendezvous::backend::RendezvousBackend;
use codeshare_core::rendezvous::server::serve;
use codeshare_core::rendezvous::{FileBackend, MemoryBackend, RemoteBackend};
use codeshare_core::transfer::ReceiveOptions;
use codeshare_core::{AppEvent, KeyVault, RendezvousStore, SessionConfig, TransferSession};
use codeshare_rtc::RtcConnector;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub enum Action {
    Send { path: PathBuf, encrypt: bool },
    Receive { code: String, out: PathBuf },
}

pub fn build_probe(config: &AppConfig) -> NetworkProbe {
    let transport = config.probe_url.as_deref().and_then(|url| match HttpProbe::new(url) {
        Ok(probe) => Some(probe),
        Err(e) => {
            warn!("Ignoring probe URL: {:#}", e);
            None
        }
    });
    NetworkProbe::new(transport, config.probe_timeout(), ConnectionClass::Unknown)
}

pub async fn run_probe(config: &AppConfig, cancel: &CancellationToken) -> Result<()> {
    let probe = build_probe(config);
    let measurement = probe.measure_cancellable(cancel).await?;
    let profile = codeshare_core::probe::derive_profile(&measurement, config.device_class);

    println!(
        "Bandwidth: {:.1} KiB/s, latency: {} ms, reliability: {:.2}",
        measurement.bandwidth_bytes_per_sec / 1024.0,
        measurement.latency_ms,
        measurement.reliability
    );
    println!(
        "Profile: chunk {} bytes, parallelism {}, compression {}, retries {} ({:?})",
        profile.chunk_size_bytes,
        profile.parallelism,
        profile.compression_level,
        profile.retry_attempts,
        profile.retry_strategy
    );
    Ok(())
}

pub async fn run_server(port: u16, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind rendezvous port {}", port))?;
    serve(listener, cancel).await?;
    Ok(())
}

/// Dispatch on the configured backend; each backend is its own type
pub async fn run_transfer(
    config: &AppConfig,
    action: Action,
    cancel: CancellationToken,
    event_tx: mpsc::Sender<AppEvent>,
) -> Result<()> {
    match config.backend {
        BackendKind::Memory => {
            warn!("The memory backend only reaches peers inside this process");
            run_with_backend(MemoryBackend::new(), config, action, cancel, event_tx).await
        }
        BackendKind::File => {
            let path = config.rendezvous_file();
            info!(path = %path.display(), "Using file rendezvous backend");
            run_with_backend(FileBackend::new(path), config, action, cancel, event_tx).await
        }
        BackendKind::Remote => {
            let url = config
                .remote_url
                .as_deref()
                .context("The remote backend needs --remote-url")?;
            let backend = RemoteBackend::new(url)?;
            run_with_backend(backend, config, action, cancel, event_tx).await
        }
    }
}

async fn run_with_backend<B: RendezvousBackend>(
    backend: B,
    config: &AppConfig,
    action: Action,
    cancel: CancellationToken,
    event_tx: mpsc::Sender<AppEvent>,
) -> Result<()> {
    let store = Arc::new(RendezvousStore::new(backend));
    let vault = Arc::new(KeyVault::new()?);
    let session = TransferSession::new(
        RtcConnector::new(),
        store,
        vault,
        SessionConfig::from_app_config(config),
        cancel.clone(),
    )
    .with_events(event_tx);

    match action {
        Action::Send { path, encrypt } => {
            let profile = build_probe(config)
                .measure_cancellable(&cancel)
                .await
                .map(|m| codeshare_core::probe::derive_profile(&m, config.device_class))?;
            send(&session, &path, profile, encrypt).await
        }
        Action::Receive { code, out } => {
            let options = ReceiveOptions {
                progress_interval: config.progress_interval(),
                ..ReceiveOptions::default()
            };
            session.receive_to(&code, &out, options, None).await?;
            Ok(())
        }
    }
}

async fn send<B: RendezvousBackend>(
    session: &TransferSession<RtcConnector, B>,
    path: &Path,
    profile: codeshare_core::TransferProfile,
    encrypt: bool,
) -> Result<()> {
    info!(
        chunk = profile.chunk_size_bytes,
        parallelism = profile.parallelism,
        encrypt,
        "Sending {}",
        path.display()
    );
    let state = session
        .send(path, profile, encrypt)
        .await
        .with_context(|| format!("Failed to send {}", path.display()))?;
    info!(
        file_id = %state.file_id,
        bytes = state.bytes_transferred,
        elapsed_ms = state.start_time.elapsed().as_millis() as u64,
        "Transfer finished"
    );
    Ok(())
}
