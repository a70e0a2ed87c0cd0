//! Chunked transfer manager.
//!
//! A `TransferContext` moves a file through a fixed-size buffer across many
//! transport round trips. The outbound direction (file push, send document,
//! referenced objects served to a printer) fills the buffer from the file;
//! the inbound direction drains indication data into the file. Both track
//! a byte offset and whether the first segment of the operation is still
//! pending, which is what OBEX needs to tell a first request from a
//! continuation.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, trace};

use crate::error::TransferError;

/// Result of a successful [`TransferContext::fill_from_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// More of the file remains after what is now buffered.
    Success,
    /// The buffer now holds the tail of the file (possibly nothing).
    EndOfFile,
}

/// Per-channel, per-direction transfer state.
#[derive(Debug)]
pub struct TransferContext {
    path: Option<PathBuf>,
    byte_index: u64,
    total_size: Option<u64>,
    first_phase: bool,
    limit: Option<u64>,
    buffer: Box<[u8]>,
    buffer_len: usize,
}

impl TransferContext {
    /// Create an idle context with a buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        TransferContext {
            path: None,
            byte_index: 0,
            total_size: None,
            first_phase: true,
            limit: None,
            buffer: vec![0u8; capacity].into_boxed_slice(),
            buffer_len: 0,
        }
    }

    /// Start a transfer of `path` from its first byte.
    pub fn begin(&mut self, path: impl Into<PathBuf>) {
        self.begin_window(path, 0, None);
    }

    /// Start an outbound transfer of at most `count` bytes of `path`
    /// beginning at `offset`. `None` reads the remainder of the file.
    pub fn begin_window(&mut self, path: impl Into<PathBuf>, offset: u64, count: Option<u64>) {
        let path = path.into();
        trace!(
            "begin transfer of {} at offset {} (count {:?})",
            path.display(),
            offset,
            count
        );
        self.path = Some(path);
        self.byte_index = offset;
        self.total_size = None;
        self.first_phase = true;
        self.limit = count.map(|count| offset.saturating_add(count));
        self.buffer_len = 0;
    }

    /// Forget the current transfer. Called when the operation completes,
    /// aborts or the channel closes.
    pub fn reset(&mut self) {
        self.path = None;
        self.byte_index = 0;
        self.total_size = None;
        self.first_phase = true;
        self.limit = None;
        self.buffer_len = 0;
    }

    /// Fill the free part of the buffer from the file.
    ///
    /// On the first phase the file is stat'ed to learn its size; a failed
    /// stat, or anything other than a regular file or symlink, counts as
    /// size 0. The first phase never reports `EndOfFile`, so even an empty
    /// file produces one `Success` before the end is signalled. A later fill
    /// that reads nothing into free space also ends the transfer, which
    /// covers a file that shrank after the first phase.
    ///
    /// # Errors
    /// `Io` when the file cannot be opened, positioned or read.
    pub fn fill_from_file(&mut self) -> Result<FillOutcome, TransferError> {
        let path = self.path.clone().ok_or(TransferError::NotStarted)?;
        let io_err = |source: io::Error| TransferError::Io {
            path: path.clone(),
            source,
        };

        let mut file = File::open(&path).map_err(io_err)?;

        let was_first_phase = self.first_phase;
        if was_first_phase {
            let size = stat_size(&path);
            debug!("{} is {} bytes", path.display(), size);
            self.total_size = Some(size);
        }
        let end = match (self.total_size, self.limit) {
            (Some(size), Some(limit)) => size.min(limit),
            (Some(size), None) => size,
            (None, Some(limit)) => limit,
            (None, None) => 0,
        };

        file.seek(SeekFrom::Start(self.byte_index)).map_err(io_err)?;

        let free = self.capacity() - self.buffer_len;
        let window = end.saturating_sub(self.byte_index);
        let wanted = if self.limit.is_some() {
            free.min(usize::try_from(window).unwrap_or(usize::MAX))
        } else {
            free
        };

        let read = read_up_to(
            &mut file,
            &mut self.buffer[self.buffer_len..self.buffer_len + wanted],
        )
        .map_err(io_err)?;
        self.byte_index += read as u64;
        self.buffer_len += read;
        self.first_phase = false;

        trace!(
            "filled {} bytes from {} (offset now {}, buffered {})",
            read,
            path.display(),
            self.byte_index,
            self.buffer_len
        );

        if !was_first_phase && self.byte_index >= end {
            Ok(FillOutcome::EndOfFile)
        } else if !was_first_phase && wanted > 0 && read == 0 {
            debug!(
                "{} ended at {} bytes, short of the {} expected",
                path.display(),
                self.byte_index,
                end
            );
            Ok(FillOutcome::EndOfFile)
        } else {
            Ok(FillOutcome::Success)
        }
    }

    /// Write inbound data to the file.
    ///
    /// The first write of an operation creates or truncates the file; later
    /// writes append. The first phase ends after the first successful write,
    /// even a zero-length one.
    ///
    /// # Errors
    /// `Io` when the file cannot be opened or written.
    pub fn drain_to_file(&mut self, bytes: &[u8]) -> Result<(), TransferError> {
        let path = self.path.clone().ok_or(TransferError::NotStarted)?;
        let io_err = |source: io::Error| TransferError::Io {
            path: path.clone(),
            source,
        };

        let mut options = OpenOptions::new();
        if self.first_phase {
            options.write(true).create(true).truncate(true);
        } else {
            options.append(true);
        }
        let mut file = options.open(&path).map_err(io_err)?;
        file.write_all(bytes).map_err(io_err)?;

        self.byte_index += bytes.len() as u64;
        self.first_phase = false;
        trace!(
            "wrote {} bytes to {} (offset now {})",
            bytes.len(),
            path.display(),
            self.byte_index
        );
        Ok(())
    }

    /// Drop the first `n` buffered bytes after they were handed to the
    /// transport. The unsent tail moves to the start of the buffer.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buffer_len);
        self.buffer.copy_within(n..self.buffer_len, 0);
        self.buffer_len -= n;
    }

    /// Buffered bytes waiting to be sent.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.buffer_len]
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.path.is_some()
    }

    pub fn byte_index(&self) -> u64 {
        self.byte_index
    }

    /// Size learned by the first fill, if any.
    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    pub fn is_first_phase(&self) -> bool {
        self.first_phase
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }
}

fn stat_size(path: &Path) -> u64 {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => fs::metadata(path).map(|m| m.len()).unwrap_or(0),
        Ok(meta) if meta.is_file() => meta.len(),
        _ => 0,
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
