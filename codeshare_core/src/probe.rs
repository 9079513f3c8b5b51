//! Network quality estimation and transfer profile derivation.

use crate::error::{Result, TransferError};
use crate::transfer::constants::*;
use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Upper bound on how long a probe may take
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest probe response we read before giving up on the body
const MAX_PROBE_BODY: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkMeasurement {
    pub bandwidth_bytes_per_sec: f64,
    pub latency_ms: u64,
    /// In `[0, 1]`
    pub reliability: f32,
}

impl NetworkMeasurement {
    /// Returned whenever a probe fails: slow, laggy and unreliable
    pub const CONSERVATIVE: Self = Self {
        bandwidth_bytes_per_sec: 10.0 * 1024.0,
        latency_ms: 800,
        reliability: 0.3,
    };

    /// Reliability follows round-trip latency
    pub fn from_timing(bytes: usize, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64().max(0.001);
        let latency_ms = elapsed.as_millis() as u64;
        let reliability = if latency_ms < 200 {
            1.0
        } else if latency_ms < 500 {
            0.7
        } else {
            0.4
        };
        Self {
            bandwidth_bytes_per_sec: bytes as f64 / secs,
            latency_ms,
            reliability,
        }
    }
}

/// Platform-reported connection type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionClass {
    Unrestricted,
    LocalNetwork,
    Cellular,
    #[default]
    Unknown,
}

impl ConnectionClass {
    fn heuristic(self) -> Option<NetworkMeasurement> {
        match self {
            Self::LocalNetwork => Some(NetworkMeasurement {
                bandwidth_bytes_per_sec: 10.0 * 1024.0 * 1024.0,
                latency_ms: 5,
                reliability: 1.0,
            }),
            // Probing on cellular burns the user's data plan
            Self::Cellular => Some(NetworkMeasurement {
                bandwidth_bytes_per_sec: 150.0 * 1024.0,
                latency_ms: 250,
                reliability: 0.7,
            }),
            Self::Unrestricted | Self::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceClass {
    #[default]
    Desktop,
    Mobile,
    LowMemory,
}

impl DeviceClass {
    pub fn is_constrained(self) -> bool {
        !matches!(self, Self::Desktop)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryStrategy {
    Linear,
    Exponential,
}

impl RetryStrategy {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay(self, base: Duration, attempt: u32) -> Duration {
        let delay = match self {
            Self::Linear => base.saturating_mul(attempt + 1),
            Self::Exponential => base.saturating_mul(1u32 << attempt.min(16)),
        };
        delay.min(Duration::from_secs(30))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProfile {
    pub chunk_size_bytes: usize,
    pub parallelism: usize,
    /// Brotli quality, 0 disables compression
    pub compression_level: u32,
    pub retry_attempts: u32,
    pub retry_strategy: RetryStrategy,
    pub timeout: Duration,
}

impl TransferProfile {
    /// Profile with an explicit chunk size and default everything else
    pub fn with_chunk_size(chunk_size_bytes: usize) -> Self {
        Self {
            chunk_size_bytes,
            parallelism: 1,
            compression_level: 0,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_strategy: RetryStrategy::Exponential,
            timeout: DEFAULT_TIMEOUT,
        }
        .normalized()
    }

    /// Medium-band defaults adjusted for `device`, for when nothing was measured
    pub fn for_device(device: DeviceClass) -> Self {
        constrain_for_device(Self::with_chunk_size(CHUNK_MEDIUM), device)
    }

    /// Enforce `chunk_size_bytes > 0` and `parallelism >= 1`
    pub fn normalized(mut self) -> Self {
        self.chunk_size_bytes = self.chunk_size_bytes.max(1);
        self.parallelism = self.parallelism.max(1);
        self.compression_level = self.compression_level.min(11);
        self
    }
}

/// Banded profile for a measurement, clamped by device class
pub fn derive_profile(measurement: &NetworkMeasurement, device: DeviceClass) -> TransferProfile {
    let bw = measurement.bandwidth_bytes_per_sec;
    let (chunk, mut parallelism, compression) = if bw < BAND_VERY_SLOW_BPS {
        (CHUNK_VERY_SLOW, PARALLELISM_VERY_SLOW, COMPRESSION_VERY_SLOW)
    } else if bw < BAND_SLOW_BPS {
        (CHUNK_SLOW, PARALLELISM_SLOW, COMPRESSION_SLOW)
    } else if bw < BAND_MEDIUM_BPS {
        (CHUNK_MEDIUM, PARALLELISM_MEDIUM, COMPRESSION_MEDIUM)
    } else {
        (CHUNK_FAST, PARALLELISM_FAST, COMPRESSION_FAST)
    };

    if measurement.latency_ms > HIGH_LATENCY_MS {
        parallelism = parallelism.max(HIGH_LATENCY_MIN_PARALLELISM);
    }

    let profile = TransferProfile {
        chunk_size_bytes: chunk,
        parallelism,
        compression_level: compression,
        retry_attempts: DEFAULT_RETRY_ATTEMPTS,
        retry_strategy: RetryStrategy::Exponential,
        timeout: DEFAULT_TIMEOUT,
    };

    constrain_for_device(profile, device)
}

/// Smaller chunks, less parallelism, more patience on constrained devices
pub fn constrain_for_device(mut profile: TransferProfile, device: DeviceClass) -> TransferProfile {
    let caps = match device {
        DeviceClass::Desktop => None,
        DeviceClass::Mobile => Some((MOBILE_MAX_CHUNK, MOBILE_MAX_PARALLELISM)),
        DeviceClass::LowMemory => Some((LOW_MEMORY_MAX_CHUNK, LOW_MEMORY_MAX_PARALLELISM)),
    };
    if let Some((max_chunk, max_parallelism)) = caps {
        profile.chunk_size_bytes = profile.chunk_size_bytes.min(max_chunk);
        profile.parallelism = profile.parallelism.min(max_parallelism);
        profile.timeout = profile.timeout.saturating_mul(CONSTRAINED_TIMEOUT_FACTOR);
        profile.retry_attempts += CONSTRAINED_EXTRA_RETRIES;
    }

    profile.normalized()
}

/// Fetches a small remote resource and reports how many bytes arrived
pub trait ProbeTransport: Send + Sync {
    fn fetch(&self) -> impl Future<Output = anyhow::Result<usize>> + Send;
}

/// Plain HTTP/1.1 GET over a TCP stream
#[derive(Debug, Clone)]
pub struct HttpProbe {
    url: Url,
}

impl HttpProbe {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let url = Url::parse(url).context("Invalid probe URL")?;
        if url.scheme() != "http" {
            return Err(anyhow!("Probe URL must use http://, got {}", url.scheme()));
        }
        if url.host_str().is_none() {
            return Err(anyhow!("Probe URL has no host"));
        }
        Ok(Self { url })
    }
}

impl ProbeTransport for HttpProbe {
    async fn fetch(&self) -> anyhow::Result<usize> {
        let host = self.url.host_str().ok_or_else(|| anyhow!("Probe URL has no host"))?;
        let port = self.url.port_or_known_default().unwrap_or(80);
        let mut path = self.url.path().to_string();
        if let Some(query) = self.url.query() {
            path.push('?');
            path.push_str(query);
        }

        let mut stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("Cannot reach probe host {}:{}", host, port))?;
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
            path, host
        );
        stream.write_all(request.as_bytes()).await?;

        let mut response = Vec::new();
        (&mut stream)
            .take(MAX_PROBE_BODY as u64)
            .read_to_end(&mut response)
            .await?;

        let header_end = response
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .ok_or_else(|| anyhow!("Malformed probe response"))?;
        let status_line = response[..header_end]
            .split(|b| *b == b'\r')
            .next()
            .unwrap_or_default();
        let status_line = String::from_utf8_lossy(status_line);
        if !status_line.split_whitespace().nth(1).is_some_and(|code| code.starts_with('2')) {
            return Err(anyhow!("Probe returned {}", status_line));
        }

        Ok(response.len() - header_end - 4)
    }
}

/// Estimates network quality; never surfaces a probe failure
pub struct NetworkProbe<T = HttpProbe> {
    transport: Option<T>,
    timeout: Duration,
    connection: ConnectionClass,
}

impl<T: ProbeTransport> NetworkProbe<T> {
    pub fn new(transport: Option<T>, timeout: Duration, connection: ConnectionClass) -> Self {
        Self {
            transport,
            timeout,
            connection,
        }
    }

    pub fn connection_class(&self) -> ConnectionClass {
        self.connection
    }

    pub async fn measure(&self) -> NetworkMeasurement {
        if let Some(estimate) = self.connection.heuristic() {
            debug!(class = ?self.connection, "Using connection-class heuristic");
            return estimate;
        }

        let Some(transport) = &self.transport else {
            return NetworkMeasurement::CONSERVATIVE;
        };

        let start = Instant::now();
        match tokio::time::timeout(self.timeout, transport.fetch()).await {
            Ok(Ok(bytes)) => {
                let m = NetworkMeasurement::from_timing(bytes, start.elapsed());
                info!(
                    bandwidth = m.bandwidth_bytes_per_sec as u64,
                    latency_ms = m.latency_ms,
                    reliability = m.reliability,
                    "Network probe finished"
                );
                m
            }
            Ok(Err(e)) => {
                warn!("Network probe failed, using conservative estimate: {:#}", e);
                NetworkMeasurement::CONSERVATIVE
            }
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "Network probe timed out");
                NetworkMeasurement::CONSERVATIVE
            }
        }
    }

    /// Like [`measure`](Self::measure) but gives up when `cancel` fires
    pub async fn measure_cancellable(&self, cancel: &CancellationToken) -> Result<NetworkMeasurement> {
        tokio::select! {
            _ = cancel.cancelled() => Err(TransferError::TransferCancelled),
            m = self.measure() => Ok(m),
        }
    }

    pub async fn profile_for(&self, device: DeviceClass) -> TransferProfile {
        derive_profile(&self.measure().await, device)
    }

    /// Re-derive the profile only when the reported connection type changed
    pub async fn on_connection_change(
        &mut self,
        connection: ConnectionClass,
        device: DeviceClass,
    ) -> Option<TransferProfile> {
        if connection == self.connection {
            return None;
        }
        info!(from = ?self.connection, to = ?connection, "Connection class changed");
        self.connection = connection;
        Some(self.profile_for(device).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingProbe;

    impl ProbeTransport for FailingProbe {
        async fn fetch(&self) -> anyhow::Result<usize> {
            Err(anyhow!("simulated network error"))
        }
    }

    struct StalledProbe;

    impl ProbeTransport for StalledProbe {
        async fn fetch(&self) -> anyhow::Result<usize> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(0)
        }
    }

    fn m(bw_kib: f64, latency_ms: u64) -> NetworkMeasurement {
        NetworkMeasurement {
            bandwidth_bytes_per_sec: bw_kib * 1024.0,
            latency_ms,
            reliability: 1.0,
        }
    }

    #[test]
    fn test_bands() {
        let p = derive_profile(&m(20.0, 50), DeviceClass::Desktop);
        assert_eq!((p.chunk_size_bytes, p.parallelism), (CHUNK_VERY_SLOW, 1));
        assert_eq!(p.compression_level, COMPRESSION_VERY_SLOW);

        let p = derive_profile(&m(100.0, 50), DeviceClass::Desktop);
        assert_eq!((p.chunk_size_bytes, p.parallelism), (CHUNK_SLOW, PARALLELISM_SLOW));

        let p = derive_profile(&m(500.0, 50), DeviceClass::Desktop);
        assert_eq!((p.chunk_size_bytes, p.parallelism), (CHUNK_MEDIUM, PARALLELISM_MEDIUM));

        let p = derive_profile(&m(5000.0, 50), DeviceClass::Desktop);
        assert_eq!((p.chunk_size_bytes, p.parallelism), (CHUNK_FAST, PARALLELISM_FAST));
        assert_eq!(p.compression_level, COMPRESSION_FAST);
    }

    #[test]
    fn test_high_latency_raises_parallelism() {
        let p = derive_profile(&m(20.0, 900), DeviceClass::Desktop);
        assert_eq!(p.parallelism, HIGH_LATENCY_MIN_PARALLELISM);
    }

    #[test]
    fn test_device_clamps() {
        let fast = m(5000.0, 20);
        let mobile = derive_profile(&fast, DeviceClass::Mobile);
        assert!(mobile.chunk_size_bytes <= MOBILE_MAX_CHUNK);
        assert!(mobile.parallelism <= MOBILE_MAX_PARALLELISM);
        assert!(mobile.timeout > DEFAULT_TIMEOUT);
        assert!(mobile.retry_attempts > DEFAULT_RETRY_ATTEMPTS);

        let low = derive_profile(&m(20.0, 900), DeviceClass::LowMemory);
        assert_eq!(low.parallelism, 1);
        assert!(low.chunk_size_bytes <= LOW_MEMORY_MAX_CHUNK);
    }

    #[tokio::test]
    async fn test_probe_failure_yields_valid_profile() {
        let probe = NetworkProbe::new(
            Some(FailingProbe),
            Duration::from_secs(1),
            ConnectionClass::Unrestricted,
        );
        assert_eq!(probe.measure().await, NetworkMeasurement::CONSERVATIVE);
        let profile = probe.profile_for(DeviceClass::Desktop).await;
        assert!(profile.chunk_size_bytes > 0);
        assert!(profile.parallelism >= 1);
    }

    #[tokio::test]
    async fn test_probe_timeout_is_bounded() {
        let probe = NetworkProbe::new(
            Some(StalledProbe),
            Duration::from_millis(50),
            ConnectionClass::Unknown,
        );
        let start = Instant::now();
        assert_eq!(probe.measure().await, NetworkMeasurement::CONSERVATIVE);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cellular_skips_probe() {
        let probe = NetworkProbe::new(
            Some(StalledProbe),
            Duration::from_secs(10),
            ConnectionClass::Cellular,
        );
        let measured = probe.measure().await;
        assert!(measured.bandwidth_bytes_per_sec > NetworkMeasurement::CONSERVATIVE.bandwidth_bytes_per_sec);
    }

    #[tokio::test]
    async fn test_connection_change_rederives() {
        let mut probe: NetworkProbe<FailingProbe> =
            NetworkProbe::new(None, Duration::from_secs(1), ConnectionClass::LocalNetwork);
        assert!(
            probe
                .on_connection_change(ConnectionClass::LocalNetwork, DeviceClass::Desktop)
                .await
                .is_none()
        );
        let profile = probe
            .on_connection_change(ConnectionClass::Cellular, DeviceClass::Desktop)
            .await
            .unwrap();
        assert_eq!(profile.chunk_size_bytes, CHUNK_SLOW);
        assert_eq!(probe.connection_class(), ConnectionClass::Cellular);
    }

    #[tokio::test]
    async fn test_cancelled_probe() {
        let probe = NetworkProbe::new(
            Some(StalledProbe),
            Duration::from_secs(10),
            ConnectionClass::Unknown,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            probe.measure_cancellable(&cancel).await,
            Err(TransferError::TransferCancelled)
        ));
    }

    #[test]
    fn test_retry_delays() {
        let base = Duration::from_millis(100);
        assert_eq!(RetryStrategy::Linear.delay(base, 2), Duration::from_millis(300));
        assert_eq!(RetryStrategy::Exponential.delay(base, 3), Duration::from_millis(800));
        assert_eq!(RetryStrategy::Exponential.delay(base, 40), Duration::from_secs(30));
    }

    #[test]
    fn test_http_probe_rejects_https() {
        assert!(HttpProbe::new("https://example.com/probe").is_err());
        assert!(HttpProbe::new("http://example.com/probe.bin").is_ok());
    }

    #[tokio::test]
    async fn test_http_probe_against_local_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            let body = vec![b'x'; 2048];
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len());
            sock.write_all(head.as_bytes()).await.unwrap();
            sock.write_all(&body).await.unwrap();
        });

        let probe = HttpProbe::new(&format!("http://{}/probe", addr)).unwrap();
        assert_eq!(probe.fetch().await.unwrap(), 2048);
    }
}
