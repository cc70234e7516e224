/// Storage node error types.
///
/// Every failure a handler can report maps onto one variant, and every
/// variant has a stable one-byte result code on the wire. Free-form detail
/// travels separately in the packet's result message.

use serde::{Deserialize, Serialize};

/// Unified error type for all storage node operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum EcError {
    #[error("malformed packet")]
    MalformedPacket,
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("size exceeded")]
    SizeExceeded,
    #[error("no space available")]
    NoSpace,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("operation not supported")]
    NoSupport,
    #[error("I/O error")]
    Io,
    #[error("disk unavailable")]
    DiskUnavailable,
    #[error("internal error")]
    Internal,

    // Transport-level failures, seen by the side that opened the connection
    #[error("network error")]
    NetworkError,
    #[error("operation timed out")]
    Timeout,

    // Aggregate replication failures reported back to clients
    #[error("replication to follower timed out")]
    ReplicationTimeout,
    #[error("follower unreachable")]
    ReplicationNetwork,
    #[error("follower rejected operation")]
    ReplicationRejected,
}

impl EcError {
    /// Convert from a raw wire result code to EcError.
    ///
    /// Returns `None` for codes that are not errors (`Init`, `Ok`).
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 | 0xF0 => None,
            0xE0 => Some(Self::NetworkError),
            0xE1 => Some(Self::Timeout),
            0xF1 => Some(Self::MalformedPacket),
            0xF2 => Some(Self::ReplicationTimeout),
            0xF3 => Some(Self::ReplicationNetwork),
            0xF4 => Some(Self::InvalidArgument),
            0xF5 => Some(Self::NotFound),
            0xF6 => Some(Self::NoSpace),
            0xF7 => Some(Self::Io),
            0xF8 => Some(Self::Internal),
            0xF9 => Some(Self::ReplicationRejected),
            0xFA => Some(Self::AlreadyExists),
            0xFB => Some(Self::ChecksumMismatch),
            0xFC => Some(Self::SizeExceeded),
            0xFD => Some(Self::NoSupport),
            0xFE => Some(Self::DiskUnavailable),
            _ => Some(Self::Internal),
        }
    }

    /// Convert to raw wire result code.
    pub fn to_code(self) -> u8 {
        match self {
            Self::NetworkError => 0xE0,
            Self::Timeout => 0xE1,
            Self::MalformedPacket => 0xF1,
            Self::ReplicationTimeout => 0xF2,
            Self::ReplicationNetwork => 0xF3,
            Self::InvalidArgument => 0xF4,
            Self::NotFound => 0xF5,
            Self::NoSpace => 0xF6,
            Self::Io => 0xF7,
            Self::Internal => 0xF8,
            Self::ReplicationRejected => 0xF9,
            Self::AlreadyExists => 0xFA,
            Self::ChecksumMismatch => 0xFB,
            Self::SizeExceeded => 0xFC,
            Self::NoSupport => 0xFD,
            Self::DiskUnavailable => 0xFE,
        }
    }

    /// Whether this error was produced by the replication stage rather
    /// than by local execution.
    pub fn is_replication_failure(self) -> bool {
        matches!(
            self,
            Self::ReplicationTimeout | Self::ReplicationNetwork | Self::ReplicationRejected
        )
    }
}

/// Result type alias for storage node operations.
pub type EcResult<T> = Result<T, EcError>;

impl From<std::io::Error> for EcError {
    fn from(_: std::io::Error) -> Self {
        EcError::Io
    }
}
