//! # BPP Engine - Basic Printing Profile peer core
//!
//! The transport-independent part of a Bluetooth Basic Printing Profile
//! peer. Designed as the foundation for a sender, a printer, or both, on top
//! of whatever profile stack delivers the events.
//!
//! ## Overview
//!
//! The engine turns BPP traffic into file and document operations:
//! - SOAP bodies are parsed into nested element trees (and back out as
//!   requests)
//! - Job ids are located in Create Job responses and later requests
//! - Documents and referenced objects move through fixed-size buffers, one
//!   segment per transport round trip
//! - Each logical port runs at most one operation at a time
//! - Progress reporting via callbacks (decoupled from UI technology)
//!
//! ## Basic Usage
//!
//! ```
//! use bpp_engine::build_from_xml;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let document = build_from_xml(
//!     b"<CreateJobResponse><JobId>12</JobId><OperationStatus>0</OperationStatus></CreateJobResponse>",
//! )?;
//! assert_eq!(document.total_elements(), 3);
//! assert_eq!(document.job_id(), Some(12));
//! # Ok(())
//! # }
//! ```
//!
//! Driving a transfer:
//!
//! ```no_run
//! use std::path::Path;
//! use bpp_engine::{LoopbackTransport, PeerConfig, Session};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut sender = Session::new(PeerConfig::new("outbox"), LoopbackTransport::new())?;
//! sender.file_push(Path::new("outbox/report.pdf"), "application/pdf")?;
//! // Hand each queued call to the stack, then feed its confirmations back
//! // through `on_push_confirmation` until the port is idle again.
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **staging**: Flat list of partially built elements and the id generator
//! - **reducer**: XML event reducer building the staging list
//! - **builder**: Tokenizer glue and tree flattening
//! - **soap**: Element tree types and Job-Id extraction
//! - **transfer**: Chunked file transfer contexts
//! - **port**: Per-port operation state machine
//! - **obex**: OBEX response codes
//! - **session**: Transport event handling for a peer
//! - **loopback**: In-process transport joining two sessions
//! - **config**: Peer configuration
//! - **error**: Error types and handling
//! - **progress**: Progress callback trait
//! - **checksums**: Checksum computation and verification

pub mod staging;
pub mod reducer;
pub mod builder;
pub mod soap;
pub mod transfer;
pub mod port;
pub mod obex;
pub mod session;
pub mod loopback;
pub mod config;
pub mod error;
pub mod progress;
pub mod checksums;

// Re-export main types and functions
pub use builder::{build_from_file, build_from_xml, DocumentBuilder};
pub use soap::{extract_job_id, find_job_id, SoapDocument, SoapElement, SoapValue};
pub use transfer::{FillOutcome, TransferContext};
pub use port::{PortOperation, PortState, PortTable, Role, ServerPort};
pub use obex::ResponseCode;
pub use session::{ObjectRequest, PushSegment, Session, Transport};
pub use loopback::{pump, LoopbackTransport, Message};
pub use config::PeerConfig;
pub use error::{BuildError, ConfigError, PortError, SessionError, TransferError, TransportError};
pub use progress::ProgressCallback;
pub use checksums::{compute_file_checksum, files_match, ChecksumAlgorithm, ChecksumValue};
