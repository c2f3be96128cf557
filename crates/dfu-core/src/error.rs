//! Crate-wide error type.

use thiserror::Error;

use crate::firmware::FirmwareError;
use crate::protocol::{DfuState, DfuStatus};
use crate::sector::SectorError;
use crate::transport::TransportError;

/// Coarse classification of a [`DfuError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad signature, checksum, truncated record or invalid layout.
    Malformed,
    /// The device or file lacks something the operation needs.
    Unsupported,
    /// The device entered dfuERROR or broke protocol framing.
    Protocol,
    /// A bounded wait ran out.
    Timeout,
    /// Verify-after-download mismatch.
    Integrity,
    /// The USB layer failed.
    Transport,
    NotFound,
    Cancelled,
    Io,
    Config,
}

#[derive(Error, Debug)]
pub enum DfuError {
    #[error(transparent)]
    Firmware(#[from] FirmwareError),

    #[error(transparent)]
    Sector(#[from] SectorError),

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("{message} [{state},{status}]")]
    Protocol {
        state: DfuState,
        status: DfuStatus,
        message: String,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Verify failed at 0x{address:08X}: {detail}")]
    Integrity { address: u32, detail: String },

    #[error("{context} on {device} in state {state}: {source}")]
    Transport {
        context: String,
        device: String,
        state: DfuState,
        #[source]
        source: TransportError,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DfuError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DfuError::Firmware(e) => e.kind(),
            DfuError::Sector(_) | DfuError::Unsupported(_) => ErrorKind::Unsupported,
            DfuError::InvalidImage(_) => ErrorKind::Malformed,
            DfuError::Protocol { .. } => ErrorKind::Protocol,
            DfuError::Timeout(_) => ErrorKind::Timeout,
            DfuError::Integrity { .. } => ErrorKind::Integrity,
            DfuError::Transport { .. } => ErrorKind::Transport,
            DfuError::NotFound(_) => ErrorKind::NotFound,
            DfuError::Cancelled => ErrorKind::Cancelled,
            DfuError::Io(_) => ErrorKind::Io,
            DfuError::Config(_) => ErrorKind::Config,
        }
    }
}

impl From<toml::de::Error> for DfuError {
    fn from(e: toml::de::Error) -> Self {
        DfuError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for DfuError {
    fn from(e: toml::ser::Error) -> Self {
        DfuError::Config(e.to_string())
    }
}
