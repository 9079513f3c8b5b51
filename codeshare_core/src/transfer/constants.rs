//! Tunable thresholds for chunking, banding and channel flow control.

use std::time::Duration;

/// Read buffer used when hashing files (1MB)
pub const BUFFER_SIZE: usize = 1024 * 1024;

/// Largest file a receiver accepts unless configured otherwise (100GB)
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024 * 1024;

/// Maximum accepted file name length in bytes
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Files above this size are announced as high-performance transfers (1GB)
pub const HIGH_PERFORMANCE_THRESHOLD: u64 = 1024 * 1024 * 1024;

// Bandwidth bands (bytes per second)
pub const BAND_VERY_SLOW_BPS: f64 = 50.0 * 1024.0;
pub const BAND_SLOW_BPS: f64 = 200.0 * 1024.0;
pub const BAND_MEDIUM_BPS: f64 = 1024.0 * 1024.0;

// Chunk sizes per band
pub const CHUNK_VERY_SLOW: usize = 4 * 1024;
pub const CHUNK_SLOW: usize = 8 * 1024;
pub const CHUNK_MEDIUM: usize = 16 * 1024;
pub const CHUNK_FAST: usize = 48 * 1024;

// Parallelism per band
pub const PARALLELISM_VERY_SLOW: usize = 1;
pub const PARALLELISM_SLOW: usize = 2;
pub const PARALLELISM_MEDIUM: usize = 3;
pub const PARALLELISM_FAST: usize = 4;

// Brotli quality per band (0..=11, 0 disables compression)
pub const COMPRESSION_VERY_SLOW: u32 = 11;
pub const COMPRESSION_SLOW: u32 = 9;
pub const COMPRESSION_MEDIUM: u32 = 6;
pub const COMPRESSION_FAST: u32 = 3;

/// Round trips above this latency raise the parallelism floor
pub const HIGH_LATENCY_MS: u64 = 300;
pub const HIGH_LATENCY_MIN_PARALLELISM: usize = 2;

// Device clamps
pub const MOBILE_MAX_CHUNK: usize = 16 * 1024;
pub const MOBILE_MAX_PARALLELISM: usize = 2;
pub const LOW_MEMORY_MAX_CHUNK: usize = 8 * 1024;
pub const LOW_MEMORY_MAX_PARALLELISM: usize = 1;
pub const CONSTRAINED_EXTRA_RETRIES: u32 = 2;
pub const CONSTRAINED_TIMEOUT_FACTOR: u32 = 2;

// Retry defaults
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

// Data channel
pub const DEFAULT_MAX_RETRANSMITS: u16 = 10;
pub const MOBILE_MAX_RETRANSMITS: u16 = 5;
pub const DEFAULT_GATHER_TIMEOUT: Duration = Duration::from_secs(10);
pub const MOBILE_GATHER_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(5);
pub const OPEN_RETRIES: u32 = 3;
pub const DEFAULT_ANSWER_TIMEOUT: Duration = Duration::from_secs(120);
pub const COMPLETION_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffered-bytes mark above which sends are withheld (1MB)
pub const DEFAULT_LOW_WATER_MARK: usize = 1024 * 1024;
pub const BUFFER_POLL_INTERVAL: Duration = Duration::from_millis(10);

// Progress reporting
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(1000);
pub const MOBILE_PROGRESS_INTERVAL: Duration = Duration::from_millis(3000);
