//! Data channel message format.
//!
//! Control messages travel as JSON text frames tagged by `type`. Chunks are
//! binary frames with a fixed 16-byte big-endian header:
//!
//! ```text
//! 0      1       2        4        8        12       16
//! | kind | flags | (zero) | index  | total  | length | payload ...
//! ```
//!
//! `flags` holds the codec in its low bits and the encrypted marker in bit 7.

use super::codec::Codec;
use crate::channel::Frame;
use crate::error::{Result, TransferError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub const CHUNK_HEADER_LEN: usize = 16;

const KIND_CHUNK: u8 = 0x01;
const FLAG_ENCRYPTED: u8 = 0x80;
const CODEC_MASK: u8 = 0x0F;

/// Announced before any chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub total_chunks: u32,
    pub chunk_size: u32,
    /// BLAKE3 of the original file, hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u32,
    pub total: u32,
    pub codec: Codec,
    pub encrypted: bool,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    FileInfo(FileInfo),
    Chunk(Chunk),
    Complete,
    Error { message: String },
    /// Per-transfer key wrapped for the receiver's identity
    TransferKey { wrapped: Vec<u8> },
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum Control {
    FileInfo(FileInfo),
    Complete {},
    Error { message: String },
    TransferKey { wrapped: String },
}

impl WireMessage {
    pub fn encode(&self) -> Result<Frame> {
        let control = match self {
            Self::Chunk(chunk) => return Ok(Frame::Binary(encode_chunk(chunk)?)),
            Self::FileInfo(info) => Control::FileInfo(info.clone()),
            Self::Complete => Control::Complete {},
            Self::Error { message } => Control::Error {
                message: message.clone(),
            },
            Self::TransferKey { wrapped } => Control::TransferKey {
                wrapped: BASE64.encode(wrapped),
            },
        };
        Ok(Frame::Text(serde_json::to_string(&control)?))
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        match frame {
            Frame::Binary(data) => Ok(Self::Chunk(decode_chunk(data)?)),
            Frame::Text(text) => Ok(match serde_json::from_str::<Control>(text)? {
                Control::FileInfo(info) => Self::FileInfo(info),
                Control::Complete {} => Self::Complete,
                Control::Error { message } => Self::Error { message },
                Control::TransferKey { wrapped } => Self::TransferKey {
                    wrapped: BASE64.decode(wrapped).map_err(|e| {
                        TransferError::Protocol(format!("transfer key is not base64: {}", e))
                    })?,
                },
            }),
        }
    }
}

fn encode_chunk(chunk: &Chunk) -> Result<Bytes> {
    let len = u32::try_from(chunk.payload.len())
        .map_err(|_| TransferError::Protocol("chunk payload too large".into()))?;
    let mut flags = chunk.codec as u8 & CODEC_MASK;
    if chunk.encrypted {
        flags |= FLAG_ENCRYPTED;
    }

    let mut buf = BytesMut::with_capacity(CHUNK_HEADER_LEN + chunk.payload.len());
    buf.put_u8(KIND_CHUNK);
    buf.put_u8(flags);
    buf.put_u16(0);
    buf.put_u32(chunk.index);
    buf.put_u32(chunk.total);
    buf.put_u32(len);
    buf.extend_from_slice(&chunk.payload);
    Ok(buf.freeze())
}

fn decode_chunk(data: &Bytes) -> Result<Chunk> {
    if data.len() < CHUNK_HEADER_LEN {
        return Err(TransferError::Protocol(format!(
            "chunk frame of {} bytes is shorter than its header",
            data.len()
        )));
    }
    if data[0] != KIND_CHUNK {
        return Err(TransferError::Protocol(format!(
            "unknown binary frame kind {:#04x}",
            data[0]
        )));
    }

    let flags = data[1];
    let codec = Codec::from_u8(flags & CODEC_MASK)
        .ok_or_else(|| TransferError::Protocol(format!("unknown codec {}", flags & CODEC_MASK)))?;
    let word = |at: usize| u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
    let index = word(4);
    let total = word(8);
    let len = word(12) as usize;

    if data.len() - CHUNK_HEADER_LEN != len {
        return Err(TransferError::Protocol(format!(
            "chunk {} declares {} payload bytes but carries {}",
            index,
            len,
            data.len() - CHUNK_HEADER_LEN
        )));
    }
    if index >= total {
        return Err(TransferError::Protocol(format!(
            "chunk index {} out of range for {} chunks",
            index, total
        )));
    }

    Ok(Chunk {
        index,
        total,
        codec,
        encrypted: flags & FLAG_ENCRYPTED != 0,
        payload: data.slice(CHUNK_HEADER_LEN..),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_wire_format() {
        let info = WireMessage::FileInfo(FileInfo {
            name: "a.bin".into(),
            size: 10,
            total_chunks: 1,
            chunk_size: 16384,
            file_hash: None,
            encrypted: false,
        });
        let Frame::Text(text) = info.encode().unwrap() else {
            panic!("control messages are text frames");
        };
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "file-info");
        assert_eq!(json["totalChunks"], 1);
        assert_eq!(json["chunkSize"], 16384);

        let Frame::Text(text) = WireMessage::Complete.encode().unwrap() else {
            panic!("control messages are text frames");
        };
        assert_eq!(text, r#"{"type":"complete"}"#);
    }

    #[test]
    fn test_chunk_header_layout() {
        let chunk = Chunk {
            index: 3,
            total: 10,
            codec: Codec::Brotli,
            encrypted: true,
            payload: Bytes::from_static(b"xyz"),
        };
        let Frame::Binary(data) = WireMessage::Chunk(chunk.clone()).encode().unwrap() else {
            panic!("chunks are binary frames");
        };
        assert_eq!(data.len(), CHUNK_HEADER_LEN + 3);
        assert_eq!(&data[..4], &[KIND_CHUNK, 0x81, 0, 0]);
        assert_eq!(&data[4..8], &3u32.to_be_bytes());
        assert_eq!(&data[8..12], &10u32.to_be_bytes());
        assert_eq!(&data[12..16], &3u32.to_be_bytes());

        let decoded = WireMessage::decode(&Frame::Binary(data)).unwrap();
        assert_eq!(decoded, WireMessage::Chunk(chunk));
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(WireMessage::decode(&Frame::Binary(Bytes::from_static(&[1, 0, 0]))).is_err());
        assert!(WireMessage::decode(&Frame::Text("{\"type\":\"bogus\"}".into())).is_err());

        let mut bad_len = BytesMut::new();
        bad_len.put_u8(KIND_CHUNK);
        bad_len.put_u8(0);
        bad_len.put_u16(0);
        bad_len.put_u32(0);
        bad_len.put_u32(1);
        bad_len.put_u32(99);
        bad_len.extend_from_slice(b"short");
        assert!(WireMessage::decode(&Frame::Binary(bad_len.freeze())).is_err());
    }

    #[test]
    fn test_transfer_key_is_base64_on_the_wire() {
        let msg = WireMessage::TransferKey { wrapped: vec![0xFF; 8] };
        let frame = msg.encode().unwrap();
        let Frame::Text(text) = &frame else {
            panic!("control messages are text frames");
        };
        assert!(text.contains("transfer-key"));
        assert!(text.contains("//////////8="));
        assert_eq!(WireMessage::decode(&frame).unwrap(), msg);
    }
}
