//! Chunk pipeline over an open peer channel.
//!
//! This module provides:
//! - Wire messages and the binary chunk frame
//! - Per-chunk compression and encryption on the sending side
//! - Reassembly, completeness and digest checks on the receiving side
//! - Transfer state tracking

pub mod codec;
pub mod constants;
pub mod hash;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod state;
pub mod utils;

// Re-export public API
pub use codec::{Codec, CodecRuntime};
pub use protocol::{Chunk, FileInfo, WireMessage};
pub use receiver::{ChunkReceiver, ReceiveOptions, ReconstructedFile, receive_file};
pub use sender::{FileSender, OutgoingFile, SendOptions};
pub use state::{FileTransferState, TransferStatus};
