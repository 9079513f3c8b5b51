use crate::probe::DeviceClass;
use crate::transfer::constants::{
    DEFAULT_LOW_WATER_MARK, DEFAULT_PROGRESS_INTERVAL, MOBILE_PROGRESS_INTERVAL,
};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "codeshare";
const APP_NAME: &str = "codeshare";
const CONFIG_FILE: &str = "config.json";
const RENDEZVOUS_FILE: &str = "rendezvous.json";

/// Environment override for the config directory (used by tests)
pub const CONFIG_DIR_ENV: &str = "CODESHARE_CONFIG_DIR";

/// Default candidate ICE servers, in order of preference
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
    "stun:stun.cloudflare.com:3478",
    "stun:stun.nextcloud.com:443",
    "stun:stun.stunprotocol.org:3478",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Peers in the same process only
    Memory,
    #[default]
    File,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub download_path: PathBuf,
    pub ice_servers: Vec<String>,
    pub backend: BackendKind,
    /// WebSocket URL of a rendezvous server, used by the remote backend
    pub remote_url: Option<String>,
    pub code_ttl_secs: u64,
    pub device_class: DeviceClass,
    /// Plain-HTTP resource fetched by the network probe
    pub probe_url: Option<String>,
    pub probe_timeout_ms: u64,
    pub session_key_max_age_minutes: u64,
    pub low_water_mark: usize,
    /// Overrides the device default when set
    pub progress_interval_ms: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let download_path = directories::UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(|d| d.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("codeshare");

        Self {
            download_path,
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            backend: BackendKind::default(),
            remote_url: None,
            code_ttl_secs: 600,
            device_class: DeviceClass::default(),
            probe_url: None,
            probe_timeout_ms: 5000,
            session_key_max_age_minutes: 30,
            low_water_mark: DEFAULT_LOW_WATER_MARK,
            progress_interval_ms: None,
        }
    }
}

impl AppConfig {
    fn get_config_path() -> Option<PathBuf> {
        get_config_dir().map(|dir| dir.join(CONFIG_FILE))
    }

    /// Load config from disk or return default
    pub fn load() -> Self {
        let path = match Self::get_config_path() {
            Some(p) => p,
            None => return Self::default(),
        };

        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    /// Save config to disk
    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::get_config_path().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no config directory")
        })?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
    }

    pub fn code_ttl(&self) -> Duration {
        Duration::from_secs(self.code_ttl_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn session_key_max_age(&self) -> Duration {
        Duration::from_secs(self.session_key_max_age_minutes.saturating_mul(60))
    }

    /// Mobile devices report progress less often
    pub fn progress_interval(&self) -> Duration {
        match (self.progress_interval_ms, self.device_class) {
            (Some(ms), _) => Duration::from_millis(ms),
            (None, DeviceClass::Mobile) => MOBILE_PROGRESS_INTERVAL,
            (None, _) => DEFAULT_PROGRESS_INTERVAL,
        }
    }

    /// Location of the persistent rendezvous store used by the file backend
    pub fn rendezvous_file(&self) -> PathBuf {
        get_config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(RENDEZVOUS_FILE)
    }
}

/// Get the config directory path for this app
pub fn get_config_dir() -> Option<PathBuf> {
    if let Ok(test_path) = std::env::var(CONFIG_DIR_ENV) {
        return Some(PathBuf::from(test_path));
    }

    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
        .map(|dirs| dirs.config_dir().to_path_buf())
}
