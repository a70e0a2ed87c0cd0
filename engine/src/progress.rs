//! Progress reporting trait.
//!
//! Decouples the session from whatever shows transfer progress (the CLI
//! prints to stderr; tests record calls).

use std::path::Path;

use crate::obex::ResponseCode;
use crate::port::{PortOperation, ServerPort};

/// Receives progress updates for chunked transfers.
///
/// All methods are called synchronously from the event-processing thread.
pub trait ProgressCallback {
    /// A push, send-document or referenced-object transfer began.
    /// `total_size` is known only for outbound transfers.
    fn on_transfer_started(
        &self,
        port: ServerPort,
        op: PortOperation,
        path: &Path,
        total_size: Option<u64>,
    );

    /// `bytes_so_far` bytes of the current transfer have been moved.
    fn on_transfer_progress(&self, port: ServerPort, op: PortOperation, bytes_so_far: u64);

    /// The transfer finished with `code` (a terminal response code).
    fn on_transfer_completed(
        &self,
        port: ServerPort,
        op: PortOperation,
        code: ResponseCode,
        bytes: u64,
    );
}
