//! Error types for the BPP peer core.
//!
//! Each component reports its own error enum. None of these errors are
//! recovered inside the core: the caller decides whether to map them to an
//! OBEX response code, abort the operation, or give up on a document.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::port::PortOperation;

/// Errors raised while turning an XML document into a SOAP element tree.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Unbalanced, empty or truncated tags. The whole document is discarded.
    #[error("malformed XML: {reason}")]
    MalformedXml { reason: String },

    /// The element tree could not be allocated.
    #[error("allocation failure while flattening the element tree")]
    AllocationFailure,

    /// The id generator produced an id that is already staged.
    #[error("staged element id {id} already exists")]
    DuplicateId { id: u32 },

    /// The XML source file could not be read.
    #[error("failed to read XML document {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl BuildError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        BuildError::MalformedXml {
            reason: reason.into(),
        }
    }
}

/// Errors raised by the chunked transfer manager.
///
/// End of file is not an error; it is reported through `FillOutcome`.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Open, stat, seek, read or write failed.
    #[error("file I/O failed on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// `fill_from_file`/`drain_to_file` called before `begin`.
    #[error("no transfer in progress")]
    NotStarted,
}

impl TransferError {
    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io { source, .. } => source.raw_os_error(),
            Self::NotStarted => None,
        }
    }
}

/// Errors raised by the per-channel operation state machine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    /// A request arrived while another operation is outstanding.
    #[error("port busy with {current}, cannot start {requested}")]
    ConflictingOperation {
        current: PortOperation,
        requested: PortOperation,
    },

    /// Abort or completion requested with nothing outstanding.
    #[error("no operation in progress")]
    NoOperation,

    /// `None` and `Abort` are not requests and cannot be started.
    #[error("{op} cannot be started as a request")]
    InvalidOperation { op: PortOperation },
}

/// Errors reported by the transport/profile layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport rejected the call: {reason}")]
    Rejected { reason: String },

    #[error("transport is disconnected")]
    Disconnected,
}

/// Errors surfaced by [`crate::session::Session`].
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Invalid peer configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("buffer size must be greater than zero")]
    ZeroBufferSize,

    #[error("root directory is not a directory: {}", path.display())]
    RootNotDirectory { path: PathBuf },

    #[error("root directory is not accessible: {}", path.display())]
    RootAccessDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
