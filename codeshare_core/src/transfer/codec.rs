//! Per-chunk compression.
//!
//! Brotli is the primary codec. When it is unavailable the runtime falls back
//! to an escaped run-length transform that is deterministic and always
//! decodable. A chunk is only sent compressed when that makes it smaller.

use crate::error::{Result, TransferError};
use brotli::{CompressorWriter, Decompressor};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

const BROTLI_BUFFER: usize = 4096;
const BROTLI_LGWIN: u32 = 22;

/// Escape byte of the run-length transform
const RLE_ESCAPE: u8 = 0xFF;
/// Shortest run worth encoding as a triple
const RLE_MIN_RUN: usize = 4;

/// Codec marker carried in every chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Codec {
    None = 0,
    Brotli = 1,
    Rle = 2,
}

impl Codec {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Brotli),
            2 => Some(Self::Rle),
            _ => None,
        }
    }
}

fn brotli_compress(data: &[u8], quality: u32) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2);
    {
        let mut w = CompressorWriter::new(&mut out, BROTLI_BUFFER, quality, BROTLI_LGWIN);
        w.write_all(data)?;
    }
    Ok(out)
}

/// Decodes at most `limit + 1` bytes, so an oversized stream is detectable
fn brotli_decompress(data: &[u8], limit: usize) -> std::io::Result<Vec<u8>> {
    let dec = Decompressor::new(data, BROTLI_BUFFER);
    let mut out = Vec::new();
    dec.take(limit as u64 + 1).read_to_end(&mut out)?;
    Ok(out)
}

fn over_limit(limit: usize) -> TransferError {
    TransferError::Protocol(format!("chunk decodes past {} bytes", limit))
}

/// Runs become `ESC, len, byte`; a literal escape byte is always a triple
pub fn rle_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        let byte = data[i];
        let mut run = 1;
        while i + run < data.len() && data[i + run] == byte && run < u8::MAX as usize {
            run += 1;
        }
        if run >= RLE_MIN_RUN || byte == RLE_ESCAPE {
            out.extend_from_slice(&[RLE_ESCAPE, run as u8, byte]);
        } else {
            out.extend(std::iter::repeat_n(byte, run));
        }
        i += run;
    }
    out
}

pub fn rle_decode(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len().min(limit));
    let mut i = 0;
    while i < data.len() {
        if data[i] == RLE_ESCAPE {
            if i + 2 >= data.len() {
                return Err(TransferError::Protocol("truncated run-length triple".into()));
            }
            let run = data[i + 1] as usize;
            if out.len() + run > limit {
                return Err(over_limit(limit));
            }
            out.extend(std::iter::repeat_n(data[i + 2], run));
            i += 3;
        } else {
            if out.len() == limit {
                return Err(over_limit(limit));
            }
            out.push(data[i]);
            i += 1;
        }
    }
    Ok(out)
}

/// Owned codec state shared by every chunk of a transfer
#[derive(Debug, Clone)]
pub struct CodecRuntime {
    brotli_available: bool,
}

impl Default for CodecRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecRuntime {
    pub fn new() -> Self {
        // A tiny self-test stands in for loading the codec module
        let brotli_available = brotli_compress(b"codeshare", 1)
            .and_then(|c| brotli_decompress(&c, 64))
            .is_ok_and(|d| d == b"codeshare");
        if !brotli_available {
            tracing::warn!("Brotli unavailable, using run-length fallback");
        }
        Self { brotli_available }
    }

    /// Runtime that only ever uses the fallback transform
    pub fn fallback_only() -> Self {
        Self {
            brotli_available: false,
        }
    }

    pub fn brotli_available(&self) -> bool {
        self.brotli_available
    }

    /// Compress at `level` (0 disables); returns the raw bytes when nothing is gained
    pub fn compress(&self, data: &[u8], level: u32) -> (Codec, Vec<u8>) {
        if level == 0 || data.is_empty() {
            return (Codec::None, data.to_vec());
        }

        let candidate = if self.brotli_available {
            match brotli_compress(data, level.min(11)) {
                Ok(out) => (Codec::Brotli, out),
                Err(e) => {
                    tracing::debug!("Brotli failed on chunk, using fallback: {}", e);
                    (Codec::Rle, rle_encode(data))
                }
            }
        } else {
            (Codec::Rle, rle_encode(data))
        };

        if candidate.1.len() < data.len() {
            candidate
        } else {
            (Codec::None, data.to_vec())
        }
    }

    /// Decode one chunk; output longer than `limit` bytes is a protocol error
    pub fn decompress(&self, codec: Codec, data: &[u8], limit: usize) -> Result<Vec<u8>> {
        let out = match codec {
            Codec::None => data.to_vec(),
            Codec::Brotli => brotli_decompress(data, limit)
                .map_err(|e| TransferError::Protocol(format!("brotli decode failed: {}", e)))?,
            Codec::Rle => rle_decode(data, limit)?,
        };
        if out.len() > limit {
            return Err(over_limit(limit));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressible_chunk_is_compressed() {
        let runtime = CodecRuntime::new();
        let data = b"abcabcabc".repeat(1000);
        let (codec, out) = runtime.compress(&data, 6);
        assert_eq!(codec, Codec::Brotli);
        assert!(out.len() < data.len());
        assert_eq!(runtime.decompress(codec, &out, data.len()).unwrap(), data);
    }

    #[test]
    fn test_incompressible_chunk_sent_raw() {
        let runtime = CodecRuntime::new();
        let data: Vec<u8> = (0..4096).map(|_| rand::random::<u8>()).collect();
        let (codec, out) = runtime.compress(&data, 11);
        assert_eq!(codec, Codec::None);
        assert_eq!(out, data);
    }

    #[test]
    fn test_level_zero_disables() {
        let runtime = CodecRuntime::new();
        let (codec, _) = runtime.compress(&[0u8; 1024], 0);
        assert_eq!(codec, Codec::None);
    }

    #[test]
    fn test_fallback_runtime() {
        let runtime = CodecRuntime::fallback_only();
        let mut data = vec![7u8; 500];
        data.extend_from_slice(&[1, 2, 3, 0xFF, 0xFF, 9]);
        let (codec, out) = runtime.compress(&data, 9);
        assert_eq!(codec, Codec::Rle);
        assert_eq!(runtime.decompress(codec, &out, data.len()).unwrap(), data);
    }

    #[test]
    fn test_rle_escape_bytes() {
        let data = [0xFF, 1, 0xFF, 0xFF, 2, 2];
        assert_eq!(rle_decode(&rle_encode(&data), data.len()).unwrap(), data);
        assert_eq!(rle_encode(&[0xFF]), vec![0xFF, 1, 0xFF]);
        assert!(rle_decode(&[0xFF, 3], 16).is_err());
    }

    #[test]
    fn test_brotli_bomb_stops_at_limit() {
        let runtime = CodecRuntime::new();
        let zeros = vec![0u8; 16 * 1024 * 1024];
        let (codec, bomb) = runtime.compress(&zeros, 5);
        assert_eq!(codec, Codec::Brotli);
        assert!(bomb.len() < 16 * 1024);
        drop(zeros);

        let err = runtime.decompress(codec, &bomb, 1024).unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)), "{:?}", err);
    }

    #[test]
    fn test_rle_run_past_limit() {
        // 1000 run triples would expand to 255000 bytes
        let bomb = [RLE_ESCAPE, 255, 0].repeat(1000);
        assert!(rle_decode(&bomb, 4096).is_err());
        assert!(rle_decode(&[1, 2, 3, 4, 5], 4).is_err());
        assert_eq!(rle_decode(&[1, 2, 3, 4], 4).unwrap(), vec![1, 2, 3, 4]);

        let runtime = CodecRuntime::new();
        assert!(runtime.decompress(Codec::None, &[0u8; 9], 8).is_err());
    }

    #[test]
    fn test_codec_marker() {
        assert_eq!(Codec::from_u8(Codec::Brotli as u8), Some(Codec::Brotli));
        assert_eq!(Codec::from_u8(9), None);
    }
}
