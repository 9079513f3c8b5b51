use std::path::PathBuf;

pub mod channel;
pub mod collab;
pub mod config;
pub mod error;
pub mod keyvault;
pub mod probe;
pub mod rendezvous;
pub mod session;
pub mod transfer;

pub use channel::{ChannelManager, ChannelOptions, ChannelState, Frame};
pub use error::{ErrorKind, Result, TransferError};
pub use keyvault::KeyVault;
pub use probe::{DeviceClass, NetworkProbe, TransferProfile};
pub use rendezvous::RendezvousStore;
pub use session::{SessionConfig, TransferSession};

//Struct report from Core to front-end
#[derive(Debug, Clone)]
pub enum AppEvent {
    Status(String),

    /// Sender: the code to share with the receiver
    CodeReady {
        code: String,
    },

    /// Channel lifecycle moved to a new state
    ChannelState(ChannelState),

    /// Receiver: a peer announced a file
    IncomingFile {
        name: String,
        size: u64,
    },

    TransferProgress {
        file_name: String,
        progress: f32,
        speed: String,
        speed_bps: f64,
        is_sending: bool,
    },
    TransferCompleted(String),

    /// Receiver: every chunk arrived and the digest matched
    FileReconstructed {
        name: String,
        size: u64,
    },

    FileSaved {
        path: PathBuf,
    },
    Error(String),
}
