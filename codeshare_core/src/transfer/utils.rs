use crate::AppEvent;
use crate::error::{Result, TransferError};
use crate::transfer::constants::{MAX_FILENAME_LENGTH, MAX_FILE_SIZE};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::sync::mpsc;

const FALLBACK_NAME: &str = "unknown_file";

const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Reject announced files over `max_size` (capped at [`MAX_FILE_SIZE`]) or with overlong names
pub fn validate_transfer_info(file_name: &str, file_size: u64, max_size: u64) -> Result<()> {
    let limit = max_size.min(MAX_FILE_SIZE);
    if file_size > limit {
        return Err(TransferError::Protocol(format!(
            "file rejected: {} ({} bytes) exceeds the {} byte limit",
            file_name, file_size, limit
        )));
    }

    if file_name.len() > MAX_FILENAME_LENGTH {
        return Err(TransferError::Protocol(format!(
            "file rejected: name is {} bytes, max {}",
            file_name.len(),
            MAX_FILENAME_LENGTH
        )));
    }
    Ok(())
}

/// Create a new file readable only by its owner; an existing path is an error
pub async fn open_secure_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}

pub fn format_transfer_speed(bytes_transferred: u64, elapsed_secs: f64) -> String {
    if elapsed_secs <= 0.0 {
        return "Starting...".to_string();
    }

    let speed_bps = bytes_transferred as f64 / elapsed_secs;
    if speed_bps > 1_000_000.0 {
        format!("{:.2} MB/s", speed_bps / 1_000_000.0)
    } else if speed_bps > 1_000.0 {
        format!("{:.1} KB/s", speed_bps / 1_000.0)
    } else {
        format!("{:.0} B/s", speed_bps)
    }
}

fn truncate_on_char_boundary(s: &mut String, max: usize) {
    let mut cutoff = max.min(s.len());
    while !s.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    s.truncate(cutoff);
}

/// Reduce a peer-supplied name to a single safe path component
pub fn sanitize_file_name(file_name: &str) -> String {
    // Last component of either separator style
    let last = file_name.rsplit(['/', '\\']).next().unwrap_or_default();

    let mut clean: String = last.chars().filter(|c| !c.is_control()).collect();

    if clean.trim().is_empty()
        || clean == "."
        || clean == ".."
        || RESERVED_NAMES.iter().any(|r| clean.eq_ignore_ascii_case(r))
    {
        return FALLBACK_NAME.to_string();
    }

    if clean.len() > MAX_FILENAME_LENGTH {
        match clean.rfind('.') {
            // Keep a short extension intact
            Some(idx) if clean.len() - idx < 20 => {
                let ext = clean[idx..].to_string();
                clean.truncate(idx);
                truncate_on_char_boundary(&mut clean, MAX_FILENAME_LENGTH - ext.len());
                clean.push_str(&ext);
            }
            _ => truncate_on_char_boundary(&mut clean, MAX_FILENAME_LENGTH),
        }
    }

    clean
}

/// Throttled, monotonic progress events for one file
pub struct ProgressReporter {
    event_tx: Option<mpsc::Sender<AppEvent>>,
    file_name: String,
    is_sending: bool,
    interval: Duration,
    started: Instant,
    last_emit: Option<Instant>,
    last_progress: f32,
}

impl ProgressReporter {
    pub fn new(
        event_tx: Option<mpsc::Sender<AppEvent>>,
        file_name: impl Into<String>,
        is_sending: bool,
        interval: Duration,
    ) -> Self {
        Self {
            event_tx,
            file_name: file_name.into(),
            is_sending,
            interval,
            started: Instant::now(),
            last_emit: None,
            last_progress: 0.0,
        }
    }

    /// Highest percentage reported so far
    pub fn last_progress(&self) -> f32 {
        self.last_progress
    }

    /// Emits at most once per interval, always on the final chunk
    pub async fn update(&mut self, done_chunks: usize, total_chunks: usize, bytes: u64) {
        let progress = if total_chunks == 0 {
            100.0
        } else {
            (done_chunks as f32 / total_chunks as f32) * 100.0
        };
        if progress < self.last_progress {
            return;
        }

        let finished = done_chunks >= total_chunks;
        let due = self
            .last_emit
            .is_none_or(|at| at.elapsed() >= self.interval);
        if !finished && !due {
            return;
        }

        self.last_progress = progress;
        self.last_emit = Some(Instant::now());

        let Some(tx) = &self.event_tx else {
            return;
        };
        let elapsed = self.started.elapsed().as_secs_f64();
        let speed_bps = if elapsed > 0.0 {
            bytes as f64 / elapsed
        } else {
            0.0
        };
        let _ = tx
            .send(AppEvent::TransferProgress {
                file_name: self.file_name.clone(),
                progress,
                speed: format_transfer_speed(bytes, elapsed),
                speed_bps,
                is_sending: self.is_sending,
            })
            .await;
    }
}
