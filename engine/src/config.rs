//! Peer configuration.

use std::fs;
use std::io;
use std::path::PathBuf;

use crate::error::ConfigError;

/// Default size of each transfer buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Settings shared by every channel of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Directory received documents are written to and referenced objects
    /// are served from.
    pub root_directory: PathBuf,

    /// Capacity of each transfer buffer in bytes.
    pub buffer_size: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            root_directory: PathBuf::from("."),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl PeerConfig {
    pub fn new(root_directory: impl Into<PathBuf>) -> Self {
        PeerConfig {
            root_directory: root_directory.into(),
            ..Self::default()
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Check the buffer size and that the root directory exists.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }

        match fs::metadata(&self.root_directory) {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(ConfigError::RootNotDirectory {
                path: self.root_directory.clone(),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ConfigError::RootNotDirectory {
                path: self.root_directory.clone(),
            }),
            Err(e) => Err(ConfigError::RootAccessDenied {
                path: self.root_directory.clone(),
                source: e,
            }),
        }
    }
}
