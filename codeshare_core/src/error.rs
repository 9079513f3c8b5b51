use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flat error kind attached to a failed transfer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    CryptoUnavailable,
    AuthenticationFailed,
    KeyUnwrapFailed,
    CodeNotFound,
    CodeExpired,
    InvalidCodeFormat,
    ChannelTimeout,
    ChannelNegotiationFailed,
    TransferIncomplete,
    TransferCancelled,
    /// Anything outside the taxonomy above (I/O, malformed frames, backend faults)
    Other,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("cryptographic primitives unavailable: {0}")]
    CryptoUnavailable(String),

    #[error("authentication tag did not verify")]
    AuthenticationFailed,

    #[error("transfer key could not be unwrapped")]
    KeyUnwrapFailed,

    #[error("no transfer is registered under code {0}")]
    CodeNotFound(String),

    #[error("code {0} has expired")]
    CodeExpired(String),

    #[error("invalid code format: {0:?}")]
    InvalidCodeFormat(String),

    #[error("channel timed out: {0}")]
    ChannelTimeout(String),

    #[error("all candidate servers failed ({attempts} attempts)")]
    ChannelNegotiationFailed { attempts: usize },

    #[error("peer signalled completion after {received} of {total} chunks")]
    TransferIncomplete { received: usize, total: usize },

    #[error("transfer cancelled")]
    TransferCancelled,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("rendezvous backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CryptoUnavailable(_) => ErrorKind::CryptoUnavailable,
            Self::AuthenticationFailed => ErrorKind::AuthenticationFailed,
            Self::KeyUnwrapFailed => ErrorKind::KeyUnwrapFailed,
            Self::CodeNotFound(_) => ErrorKind::CodeNotFound,
            Self::CodeExpired(_) => ErrorKind::CodeExpired,
            Self::InvalidCodeFormat(_) => ErrorKind::InvalidCodeFormat,
            Self::ChannelTimeout(_) => ErrorKind::ChannelTimeout,
            Self::ChannelNegotiationFailed { .. } => ErrorKind::ChannelNegotiationFailed,
            Self::TransferIncomplete { .. } => ErrorKind::TransferIncomplete,
            Self::TransferCancelled => ErrorKind::TransferCancelled,
            Self::ConnectionLost(_)
            | Self::Protocol(_)
            | Self::Backend(_)
            | Self::Serialization(_)
            | Self::Io(_) => ErrorKind::Other,
        }
    }

    /// Whether the user should simply re-enter or re-request the code
    pub fn is_code_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::CodeNotFound | ErrorKind::CodeExpired | ErrorKind::InvalidCodeFormat
        )
    }
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            TransferError::TransferIncomplete { received: 7, total: 10 }.kind(),
            ErrorKind::TransferIncomplete
        );
        assert_eq!(TransferError::Protocol("x".into()).kind(), ErrorKind::Other);
        assert!(TransferError::CodeExpired("abcde".into()).is_code_error());
        assert!(!TransferError::AuthenticationFailed.is_code_error());
    }

    #[test]
    fn test_incomplete_message() {
        let err = TransferError::TransferIncomplete { received: 7, total: 10 };
        assert_eq!(err.to_string(), "peer signalled completion after 7 of 10 chunks");
    }
}
