//! Transport-event handling for one BPP peer.
//!
//! A [`Session`] owns the operation state of every channel and the transfer
//! context of every channel with a chunked operation in flight. Local
//! commands (`file_push`, `create_job`, ...) start operations; indication and
//! confirmation events from the profile layer advance them. Nothing here
//! loops or waits: each event produces at most one call into the
//! [`Transport`], and the next step happens when the next event arrives.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use uuid::Uuid;

use crate::builder::build_from_file;
use crate::config::PeerConfig;
use crate::error::{PortError, SessionError, TransportError};
use crate::obex::ResponseCode;
use crate::port::{PortOperation, PortTable, Role, ServerPort};
use crate::progress::ProgressCallback;
use crate::soap::{extract_job_id, SoapDocument, SoapElement};
use crate::transfer::{FillOutcome, TransferContext};

/// One segment of a file push or send document request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushSegment<'a> {
    pub mime_type: &'a str,
    /// Only present on the first segment.
    pub file_name: Option<&'a str>,
    pub data: &'a [u8],
    pub final_segment: bool,
}

/// A request for (part of) a referenced object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRequest<'a> {
    pub object: &'a str,
    pub offset: u64,
    /// `None` asks for the remainder of the object.
    pub count: Option<u64>,
    pub want_size: bool,
}

/// Calls into the profile layer.
///
/// Implementations hand the call to the Bluetooth stack (or, in tests and
/// the CLI demo, queue it for the peer session). Each call must return
/// without waiting for the remote side.
pub trait Transport {
    fn file_push_request(&mut self, segment: PushSegment<'_>) -> Result<(), TransportError>;

    fn send_document_request(
        &mut self,
        job_id: i64,
        segment: PushSegment<'_>,
    ) -> Result<(), TransportError>;

    fn push_response(
        &mut self,
        port: ServerPort,
        op: PortOperation,
        code: ResponseCode,
    ) -> Result<(), TransportError>;

    fn soap_request(
        &mut self,
        port: ServerPort,
        op: PortOperation,
        document: &SoapDocument,
    ) -> Result<(), TransportError>;

    fn soap_response(
        &mut self,
        port: ServerPort,
        op: PortOperation,
        code: ResponseCode,
        document: Option<&SoapDocument>,
    ) -> Result<(), TransportError>;

    fn referenced_objects_request(&mut self, request: ObjectRequest<'_>) -> Result<(), TransportError>;

    fn referenced_objects_response(
        &mut self,
        code: ResponseCode,
        object_size: Option<u64>,
        data: &[u8],
    ) -> Result<(), TransportError>;

    fn abort_request(&mut self, port: ServerPort) -> Result<(), TransportError>;
}

/// A chunked operation in flight on one channel.
#[derive(Debug)]
struct ActiveTransfer {
    op: PortOperation,
    context: TransferContext,
    /// Bytes handed to the transport and not yet confirmed.
    in_flight: usize,
    final_sent: bool,
    mime_type: String,
    job_id: Option<i64>,
    object: Option<String>,
    offset: u64,
    count: Option<u64>,
}

impl ActiveTransfer {
    fn new(op: PortOperation, context: TransferContext) -> Self {
        ActiveTransfer {
            op,
            context,
            in_flight: 0,
            final_sent: false,
            mime_type: String::new(),
            job_id: None,
            object: None,
            offset: 0,
            count: None,
        }
    }
}

/// A BPP peer: sender, printer, or both.
pub struct Session<T: Transport> {
    config: PeerConfig,
    transport: T,
    ports: PortTable,
    transfers: HashMap<(Role, ServerPort), ActiveTransfer>,
    job_id: Option<i64>,
    progress: Option<Box<dyn ProgressCallback>>,
}

impl<T: Transport> Session<T> {
    /// Create a session after validating `config`.
    pub fn new(config: PeerConfig, transport: T) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Session {
            config,
            transport,
            ports: PortTable::new(),
            transfers: HashMap::new(),
            job_id: None,
            progress: None,
        })
    }

    pub fn set_progress(&mut self, progress: Box<dyn ProgressCallback>) {
        self.progress = Some(progress);
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn ports(&self) -> &PortTable {
        &self.ports
    }

    /// Operation outstanding on a channel.
    pub fn operation(&self, role: Role, port: ServerPort) -> PortOperation {
        self.ports.current(role, port)
    }

    /// Job id returned by the last successful Create Job.
    pub fn job_id(&self) -> Option<i64> {
        self.job_id
    }

    /// Transfer context of a channel, while a chunked operation is active.
    pub fn transfer(&self, role: Role, port: ServerPort) -> Option<&TransferContext> {
        self.transfers.get(&(role, port)).map(|t| &t.context)
    }

    // ---- sender (client) side ------------------------------------------

    /// Push a file to the printer's job port.
    pub fn file_push(&mut self, path: &Path, mime_type: &str) -> Result<(), SessionError> {
        self.start_outbound(PortOperation::FilePush, path, mime_type, None)
    }

    /// Send a document for a job created earlier. Uses the job id from the
    /// last Create Job when `job_id` is `None`.
    pub fn send_document(
        &mut self,
        path: &Path,
        mime_type: &str,
        job_id: Option<i64>,
    ) -> Result<(), SessionError> {
        let job_id = job_id.or(self.job_id).unwrap_or(0);
        self.start_outbound(PortOperation::SendDocument, path, mime_type, Some(job_id))
    }

    fn start_outbound(
        &mut self,
        op: PortOperation,
        path: &Path,
        mime_type: &str,
        job_id: Option<i64>,
    ) -> Result<(), SessionError> {
        let key = (Role::RemoteClient, ServerPort::Job);
        self.ports.try_start(key.0, key.1, op)?;

        let mut transfer = ActiveTransfer::new(op, TransferContext::new(self.config.buffer_size));
        transfer.mime_type = mime_type.to_string();
        transfer.job_id = job_id;
        transfer.context.begin(path);

        let outcome = match transfer.context.fill_from_file() {
            Ok(outcome) => outcome,
            Err(e) => {
                self.ports.complete(key.0, key.1);
                return Err(e.into());
            }
        };

        let file_name = path.file_name().and_then(|n| n.to_str());
        let final_segment = outcome == FillOutcome::EndOfFile;
        let segment = PushSegment {
            mime_type,
            file_name,
            data: transfer.context.data(),
            final_segment,
        };
        let sent = match job_id {
            Some(job_id) => self.transport.send_document_request(job_id, segment),
            None => self.transport.file_push_request(segment),
        };
        if let Err(e) = sent {
            self.ports.complete(key.0, key.1);
            return Err(e.into());
        }

        info!("{} of {} started ({:?} bytes)", op, path.display(), transfer.context.total_size());
        transfer.in_flight = transfer.context.buffer_len();
        transfer.final_sent = final_segment;
        if let Some(progress) = &self.progress {
            progress.on_transfer_started(key.1, op, path, transfer.context.total_size());
        }
        self.transfers.insert(key, transfer);
        Ok(())
    }

    /// Response to a file push or send document segment.
    pub fn on_push_confirmation(
        &mut self,
        port: ServerPort,
        code: ResponseCode,
    ) -> Result<(), SessionError> {
        let key = (Role::RemoteClient, port);
        let Some(mut transfer) = self.transfers.remove(&key) else {
            warn!("push confirmation {} on idle {} port", code, port);
            return Ok(());
        };

        transfer.context.consume(transfer.in_flight);
        transfer.in_flight = 0;
        if !code.is_continue() || transfer.final_sent {
            self.finish(key, transfer, code);
            return Ok(());
        }

        let outcome = match transfer.context.fill_from_file() {
            Ok(outcome) => outcome,
            Err(e) => {
                self.abort_after_failure(port, transfer.op);
                return Err(e.into());
            }
        };

        let final_segment = outcome == FillOutcome::EndOfFile;
        let segment = PushSegment {
            mime_type: &transfer.mime_type,
            file_name: None,
            data: transfer.context.data(),
            final_segment,
        };
        let sent = match transfer.job_id {
            Some(job_id) => self.transport.send_document_request(job_id, segment),
            None => self.transport.file_push_request(segment),
        };
        if let Err(e) = sent {
            self.abort_after_failure(port, transfer.op);
            return Err(e.into());
        }

        transfer.in_flight = transfer.context.buffer_len();
        transfer.final_sent = final_segment;
        if let Some(progress) = &self.progress {
            progress.on_transfer_progress(port, transfer.op, transfer.context.byte_index());
        }
        self.transfers.insert(key, transfer);
        Ok(())
    }

    /// Send a SOAP request built from an XML file.
    ///
    /// The document is built before the port is claimed, so a malformed
    /// file leaves the channel idle.
    pub fn soap_request(
        &mut self,
        port: ServerPort,
        op: PortOperation,
        xml_path: &Path,
    ) -> Result<(), SessionError> {
        if !is_soap_operation(op) {
            return Err(PortError::InvalidOperation { op }.into());
        }
        let document = build_from_file(xml_path)?;
        self.send_soap_request(port, op, &document)
    }

    /// Send an already built SOAP request.
    pub fn send_soap_request(
        &mut self,
        port: ServerPort,
        op: PortOperation,
        document: &SoapDocument,
    ) -> Result<(), SessionError> {
        if !is_soap_operation(op) {
            return Err(PortError::InvalidOperation { op }.into());
        }
        self.ports.try_start(Role::RemoteClient, port, op)?;
        if let Err(e) = self.transport.soap_request(port, op, document) {
            self.ports.complete(Role::RemoteClient, port);
            return Err(e.into());
        }
        debug!("{} request on {} port with {} elements", op, port, document.total_elements());
        Ok(())
    }

    pub fn get_printer_attributes(&mut self, port: ServerPort, xml_path: &Path) -> Result<(), SessionError> {
        self.soap_request(port, PortOperation::GetPrinterAttributes, xml_path)
    }

    pub fn create_job(&mut self, xml_path: &Path) -> Result<(), SessionError> {
        self.soap_request(ServerPort::Job, PortOperation::CreateJob, xml_path)
    }

    pub fn get_job_attributes(&mut self, port: ServerPort, xml_path: &Path) -> Result<(), SessionError> {
        self.soap_request(port, PortOperation::GetJobAttributes, xml_path)
    }

    pub fn cancel_job(&mut self, port: ServerPort, xml_path: &Path) -> Result<(), SessionError> {
        self.soap_request(port, PortOperation::CancelJob, xml_path)
    }

    pub fn get_event(&mut self, xml_path: &Path) -> Result<(), SessionError> {
        self.soap_request(ServerPort::Status, PortOperation::GetEvent, xml_path)
    }

    /// Response to a SOAP request. Returns the operation it answered.
    ///
    /// A Create Job response carrying a `JobId` updates [`Session::job_id`].
    pub fn on_soap_confirmation(
        &mut self,
        port: ServerPort,
        code: ResponseCode,
        elements: &[SoapElement],
    ) -> PortOperation {
        let op = self.ports.current(Role::RemoteClient, port);
        if !is_soap_operation(op) {
            warn!("SOAP confirmation {} on {} port with {} outstanding", code, port, op);
            return op;
        }

        if op == PortOperation::CreateJob && code.is_success() {
            match extract_job_id(elements) {
                Some(job_id) => {
                    info!("printer created job {}", job_id);
                    self.job_id = Some(job_id);
                }
                None => warn!("Create Job response carries no JobId"),
            }
        }

        if !code.is_continue() {
            self.ports.complete(Role::RemoteClient, port);
        }
        debug!("{} confirmation on {} port: {}", op, port, code);
        op
    }

    /// Pull a referenced object from the sender into `destination`.
    pub fn get_referenced_objects(
        &mut self,
        object: &str,
        offset: u64,
        count: Option<u64>,
        destination: &Path,
    ) -> Result<(), SessionError> {
        let key = (Role::RemoteClient, ServerPort::ReferencedObject);
        let op = PortOperation::GetReferencedObjects;
        self.ports.try_start(key.0, key.1, op)?;

        let request = ObjectRequest {
            object,
            offset,
            count,
            want_size: true,
        };
        if let Err(e) = self.transport.referenced_objects_request(request) {
            self.ports.complete(key.0, key.1);
            return Err(e.into());
        }

        let mut transfer = ActiveTransfer::new(op, TransferContext::new(self.config.buffer_size));
        transfer.context.begin(destination);
        transfer.object = Some(object.to_string());
        transfer.offset = offset;
        transfer.count = count;
        if let Some(progress) = &self.progress {
            progress.on_transfer_started(key.1, op, destination, None);
        }
        self.transfers.insert(key, transfer);
        Ok(())
    }

    /// A segment of a referenced object arrived.
    pub fn on_referenced_objects_confirmation(
        &mut self,
        code: ResponseCode,
        object_size: Option<u64>,
        data: &[u8],
    ) -> Result<(), SessionError> {
        let key = (Role::RemoteClient, ServerPort::ReferencedObject);
        let Some(mut transfer) = self.transfers.remove(&key) else {
            warn!("referenced object confirmation {} with nothing requested", code);
            return Ok(());
        };
        if let Some(size) = object_size {
            debug!("referenced object is {} bytes", size);
        }

        if code.is_continue() || code.is_success() {
            if let Err(e) = transfer.context.drain_to_file(data) {
                self.abort_after_failure(key.1, transfer.op);
                return Err(e.into());
            }
        }

        if !code.is_continue() {
            if !code.is_success() {
                warn!("referenced object request failed: {}", code);
            }
            self.finish(key, transfer, code);
            return Ok(());
        }

        let object = transfer.object.clone().unwrap_or_default();
        let request = ObjectRequest {
            object: &object,
            offset: transfer.offset,
            count: transfer.count,
            want_size: false,
        };
        if let Err(e) = self.transport.referenced_objects_request(request) {
            self.abort_after_failure(key.1, transfer.op);
            return Err(e.into());
        }
        if let Some(progress) = &self.progress {
            progress.on_transfer_progress(key.1, transfer.op, transfer.context.byte_index());
        }
        self.transfers.insert(key, transfer);
        Ok(())
    }

    /// Ask the remote server to abort the operation on `port`.
    ///
    /// # Errors
    /// `NoOperation` when nothing is outstanding on the port.
    pub fn abort(&mut self, port: ServerPort) -> Result<PortOperation, SessionError> {
        let aborted = self.ports.get_mut(Role::RemoteClient, port).begin_abort()?;
        self.transfers.remove(&(Role::RemoteClient, port));
        if let Err(e) = self.transport.abort_request(port) {
            self.ports.complete(Role::RemoteClient, port);
            return Err(e.into());
        }
        info!("abort of {} requested on {} port", aborted, port);
        Ok(aborted)
    }

    /// The remote server acknowledged an abort.
    pub fn on_abort_confirmation(&mut self, port: ServerPort) {
        let op = self.ports.current(Role::RemoteClient, port);
        if op == PortOperation::Abort {
            self.ports.complete(Role::RemoteClient, port);
        } else {
            debug!("abort confirmation on {} port with {} outstanding", port, op);
        }
    }

    // ---- printer / object server side ---------------------------------

    /// A file push segment arrived. Returns the response code sent back.
    pub fn on_push_indication(
        &mut self,
        port: ServerPort,
        segment: PushSegment<'_>,
    ) -> Result<ResponseCode, SessionError> {
        self.receive_segment(port, PortOperation::FilePush, segment)
    }

    /// A send document segment arrived. Returns the response code sent back.
    pub fn on_send_document_indication(
        &mut self,
        port: ServerPort,
        job_id: i64,
        segment: PushSegment<'_>,
    ) -> Result<ResponseCode, SessionError> {
        if segment.file_name.is_some() {
            debug!("document for job {} arriving", job_id);
        }
        self.receive_segment(port, PortOperation::SendDocument, segment)
    }

    fn receive_segment(
        &mut self,
        port: ServerPort,
        op: PortOperation,
        segment: PushSegment<'_>,
    ) -> Result<ResponseCode, SessionError> {
        let key = (Role::LocalServer, port);
        let mut transfer = match self.transfers.remove(&key) {
            Some(transfer) if transfer.op == op => transfer,
            Some(transfer) => {
                self.transfers.insert(key, transfer);
                return self.respond_push(port, op, ResponseCode::SERVICE_UNAVAILABLE);
            }
            None => {
                if let Err(e) = self.ports.try_start(key.0, key.1, op) {
                    warn!("rejecting {} on {} port: {}", op, port, e);
                    return self.respond_push(port, op, ResponseCode::SERVICE_UNAVAILABLE);
                }
                let path = self.receive_path(segment.file_name);
                info!("receiving {} ({}) into {}", op, segment.mime_type, path.display());
                let mut transfer =
                    ActiveTransfer::new(op, TransferContext::new(self.config.buffer_size));
                transfer.mime_type = segment.mime_type.to_string();
                transfer.context.begin(&path);
                if let Some(progress) = &self.progress {
                    progress.on_transfer_started(port, op, &path, None);
                }
                transfer
            }
        };

        if let Err(e) = transfer.context.drain_to_file(segment.data) {
            warn!("{} on {} port failed: {}", op, port, e);
            let code = ResponseCode::INTERNAL_SERVER_ERROR;
            self.finish(key, transfer, code);
            return self.respond_push(port, op, code);
        }

        if segment.final_segment {
            self.finish(key, transfer, ResponseCode::OK);
            return self.respond_push(port, op, ResponseCode::OK);
        }

        if let Some(progress) = &self.progress {
            progress.on_transfer_progress(port, op, transfer.context.byte_index());
        }
        self.transfers.insert(key, transfer);
        self.respond_push(port, op, ResponseCode::CONTINUE)
    }

    fn respond_push(
        &mut self,
        port: ServerPort,
        op: PortOperation,
        code: ResponseCode,
    ) -> Result<ResponseCode, SessionError> {
        self.transport.push_response(port, op, code)?;
        Ok(code)
    }

    /// Where an inbound document is stored: the peer's file name (without
    /// any directory part) under the root directory, or a generated name.
    fn receive_path(&self, file_name: Option<&str>) -> PathBuf {
        let name = file_name
            .and_then(|name| Path::new(name).file_name())
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| format!("{}.bin", Uuid::new_v4()).into());
        self.config.root_directory.join(name)
    }

    /// A SOAP request arrived on a local server port.
    ///
    /// # Errors
    /// `InvalidOperation` for anything but the five SOAP requests; the
    /// request has already been answered with Bad Request and the port is
    /// untouched.
    /// `ConflictingOperation` when the port is busy; the request has already
    /// been answered with Service Unavailable.
    pub fn on_soap_indication(
        &mut self,
        port: ServerPort,
        op: PortOperation,
        elements: &[SoapElement],
    ) -> Result<(), SessionError> {
        if !is_soap_operation(op) {
            warn!("{} is not a SOAP request", op);
            self.transport
                .soap_response(port, op, ResponseCode::BAD_REQUEST, None)?;
            return Err(PortError::InvalidOperation { op }.into());
        }
        if let Err(e) = self.ports.try_start(Role::LocalServer, port, op) {
            warn!("rejecting {} on {} port: {}", op, port, e);
            self.transport
                .soap_response(port, op, ResponseCode::SERVICE_UNAVAILABLE, None)?;
            return Err(e.into());
        }

        if let Some(job_id) = extract_job_id(elements) {
            debug!("{} request for job {}", op, job_id);
        }
        Ok(())
    }

    /// Answer the SOAP request outstanding on `port`.
    pub fn respond_soap(
        &mut self,
        port: ServerPort,
        code: ResponseCode,
        document: Option<&SoapDocument>,
    ) -> Result<(), SessionError> {
        let op = self.ports.current(Role::LocalServer, port);
        if !is_soap_operation(op) {
            return Err(PortError::NoOperation.into());
        }
        self.transport.soap_response(port, op, code, document)?;
        if !code.is_continue() {
            self.ports.complete(Role::LocalServer, port);
        }
        Ok(())
    }

    /// Answer the SOAP request outstanding on `port` with an XML file.
    pub fn respond_soap_from_file(
        &mut self,
        port: ServerPort,
        code: ResponseCode,
        xml_path: &Path,
    ) -> Result<(), SessionError> {
        let document = build_from_file(xml_path)?;
        self.respond_soap(port, code, Some(&document))
    }

    /// The printer asked for (the next segment of) a referenced object.
    /// Returns the response code sent back.
    pub fn on_referenced_objects_indication(
        &mut self,
        request: ObjectRequest<'_>,
    ) -> Result<ResponseCode, SessionError> {
        let key = (Role::LocalServer, ServerPort::ReferencedObject);
        let op = PortOperation::GetReferencedObjects;

        let mut transfer = match self.transfers.remove(&key) {
            Some(mut transfer) => {
                transfer.context.consume(transfer.in_flight);
                transfer.in_flight = 0;
                transfer
            }
            None => {
                if let Err(e) = self.ports.try_start(key.0, key.1, op) {
                    warn!("rejecting referenced object request: {}", e);
                    self.transport
                        .referenced_objects_response(ResponseCode::SERVICE_UNAVAILABLE, None, &[])?;
                    return Ok(ResponseCode::SERVICE_UNAVAILABLE);
                }
                let path = match Path::new(request.object).file_name() {
                    Some(name) => self.config.root_directory.join(name),
                    None => self.config.root_directory.join(request.object),
                };
                if !path.is_file() {
                    info!("referenced object {} not found", request.object);
                    self.ports.complete(key.0, key.1);
                    self.transport
                        .referenced_objects_response(ResponseCode::NOT_FOUND, None, &[])?;
                    return Ok(ResponseCode::NOT_FOUND);
                }
                let mut transfer =
                    ActiveTransfer::new(op, TransferContext::new(self.config.buffer_size));
                transfer.context.begin_window(&path, request.offset, request.count);
                transfer.object = Some(request.object.to_string());
                if let Some(progress) = &self.progress {
                    progress.on_transfer_started(key.1, op, &path, None);
                }
                transfer
            }
        };

        let was_first = transfer.context.is_first_phase();
        let outcome = match transfer.context.fill_from_file() {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("serving referenced object failed: {}", e);
                let code = ResponseCode::INTERNAL_SERVER_ERROR;
                self.finish(key, transfer, code);
                self.transport.referenced_objects_response(code, None, &[])?;
                return Ok(code);
            }
        };

        let object_size = if was_first && request.want_size {
            transfer.context.total_size()
        } else {
            None
        };
        let code = match outcome {
            FillOutcome::EndOfFile => ResponseCode::OK,
            FillOutcome::Success => ResponseCode::CONTINUE,
        };
        if let Err(e) =
            self.transport
                .referenced_objects_response(code, object_size, transfer.context.data())
        {
            warn!("referenced object response not delivered: {}", e);
            self.finish(key, transfer, ResponseCode::INTERNAL_SERVER_ERROR);
            return Err(e.into());
        }

        if code.is_continue() {
            transfer.in_flight = transfer.context.buffer_len();
            if let Some(progress) = &self.progress {
                progress.on_transfer_progress(key.1, op, transfer.context.byte_index());
            }
            self.transfers.insert(key, transfer);
        } else {
            self.finish(key, transfer, code);
        }
        Ok(code)
    }

    /// The remote client aborted the operation on a local server port.
    ///
    /// # Errors
    /// `NoOperation` when nothing was outstanding; state is unchanged.
    pub fn on_abort_indication(&mut self, port: ServerPort) -> Result<PortOperation, SessionError> {
        let op = self.ports.abort(Role::LocalServer, port)?;
        if let Some(transfer) = self.transfers.remove(&(Role::LocalServer, port)) {
            info!(
                "{} on {} port aborted after {} bytes",
                op,
                port,
                transfer.context.byte_index()
            );
        }
        Ok(op)
    }

    /// The channel to `port` closed: forget everything outstanding on it.
    pub fn on_port_closed(&mut self, port: ServerPort) {
        for role in [Role::LocalServer, Role::RemoteClient] {
            let op = self.ports.complete(role, port);
            if op != PortOperation::None {
                info!("{} port closed with {} outstanding", port, op);
            }
            self.transfers.remove(&(role, port));
        }
    }

    fn finish(&mut self, key: (Role, ServerPort), transfer: ActiveTransfer, code: ResponseCode) {
        let (role, port) = key;
        self.ports.complete(role, port);
        let bytes = transfer.context.byte_index();
        info!("{} on {} port finished: {} ({} bytes)", transfer.op, port, code, bytes);
        if let Some(progress) = &self.progress {
            progress.on_transfer_completed(port, transfer.op, code, bytes);
        }
    }

    /// A local failure in the middle of a client operation: tell the remote
    /// side and wait for the abort confirmation.
    fn abort_after_failure(&mut self, port: ServerPort, op: PortOperation) {
        let state = self.ports.get_mut(Role::RemoteClient, port);
        if state.begin_abort().is_err() {
            return;
        }
        if let Err(e) = self.transport.abort_request(port) {
            warn!("abort of {} on {} port not delivered: {}", op, port, e);
            self.ports.complete(Role::RemoteClient, port);
        }
    }
}

fn is_soap_operation(op: PortOperation) -> bool {
    matches!(
        op,
        PortOperation::GetPrinterAttributes
            | PortOperation::CreateJob
            | PortOperation::GetJobAttributes
            | PortOperation::CancelJob
            | PortOperation::GetEvent
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_from_xml;
    use crate::checksums::{files_match, ChecksumAlgorithm};
    use crate::error::TransferError;
    use crate::loopback::{pump, LoopbackTransport, Message};
    use std::fs;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    struct Peers {
        sender_dir: TempDir,
        printer_dir: TempDir,
        sender: Session<LoopbackTransport>,
        printer: Session<LoopbackTransport>,
    }

    fn peers(buffer_size: usize) -> Peers {
        let sender_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let printer_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let sender = Session::new(
            PeerConfig::new(sender_dir.path()).with_buffer_size(buffer_size),
            LoopbackTransport::new(),
        )
        .unwrap();
        let printer = Session::new(
            PeerConfig::new(printer_dir.path()).with_buffer_size(buffer_size),
            LoopbackTransport::new(),
        )
        .unwrap();
        Peers {
            sender_dir,
            printer_dir,
            sender,
            printer,
        }
    }

    fn run(peers: &mut Peers) -> usize {
        let mut respond = |_: ServerPort, _: PortOperation, _: &SoapDocument| (ResponseCode::OK, None);
        pump(&mut peers.sender, &mut peers.printer, &mut respond).expect("pump")
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    struct RecordingProgress {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl ProgressCallback for RecordingProgress {
        fn on_transfer_started(&self, _: ServerPort, op: PortOperation, _: &Path, total: Option<u64>) {
            self.events.lock().unwrap().push(format!("started {} {:?}", op, total));
        }

        fn on_transfer_progress(&self, _: ServerPort, _: PortOperation, bytes: u64) {
            self.events.lock().unwrap().push(format!("progress {}", bytes));
        }

        fn on_transfer_completed(&self, _: ServerPort, _: PortOperation, code: ResponseCode, bytes: u64) {
            self.events
                .lock()
                .unwrap()
                .push(format!("completed {} {}", code.name(), bytes));
        }
    }

    #[test]
    fn test_file_push_over_loopback() {
        let mut peers = peers(4096);
        let source = peers.sender_dir.path().join("report.pdf");
        fs::write(&source, pattern(10_000)).unwrap();

        peers.sender.file_push(&source, "application/pdf").unwrap();
        assert_eq!(
            peers.sender.operation(Role::RemoteClient, ServerPort::Job),
            PortOperation::FilePush
        );
        run(&mut peers);

        let received = peers.printer_dir.path().join("report.pdf");
        assert!(files_match(&source, &received, ChecksumAlgorithm::Sha256).unwrap());
        assert!(peers.sender.ports().get(Role::RemoteClient, ServerPort::Job).is_idle());
        assert!(peers.printer.ports().get(Role::LocalServer, ServerPort::Job).is_idle());
        assert!(peers.sender.transfer(Role::RemoteClient, ServerPort::Job).is_none());
    }

    #[test]
    fn test_file_push_segments() {
        let mut peers = peers(4096);
        let source = peers.sender_dir.path().join("doc.txt");
        fs::write(&source, pattern(10_000)).unwrap();
        peers.sender.file_push(&source, "text/plain").unwrap();

        match &peers.sender.transport().outbox()[0] {
            Message::FilePush {
                file_name,
                data,
                final_segment,
                ..
            } => {
                assert_eq!(file_name.as_deref(), Some("doc.txt"));
                assert_eq!(data.len(), 4096);
                assert!(!final_segment);
            }
            other => panic!("unexpected {:?}", other),
        }

        // Three request segments, three responses.
        assert_eq!(run(&mut peers), 6);
    }

    #[test]
    fn test_empty_file_push() {
        let mut peers = peers(64);
        let source = peers.sender_dir.path().join("empty.txt");
        fs::write(&source, b"").unwrap();

        peers.sender.file_push(&source, "text/plain").unwrap();
        run(&mut peers);

        let received = peers.printer_dir.path().join("empty.txt");
        assert_eq!(fs::read(received).unwrap(), b"");
    }

    #[test]
    fn test_second_push_conflicts() {
        let mut peers = peers(64);
        let source = peers.sender_dir.path().join("a.txt");
        fs::write(&source, b"hello").unwrap();

        peers.sender.file_push(&source, "text/plain").unwrap();
        let result = peers.sender.file_push(&source, "text/plain");
        assert!(matches!(
            result,
            Err(SessionError::Port(PortError::ConflictingOperation {
                current: PortOperation::FilePush,
                requested: PortOperation::FilePush,
            }))
        ));
        assert_eq!(peers.sender.transport().outbox().len(), 1);
    }

    #[test]
    fn test_missing_file_leaves_port_idle() {
        let mut peers = peers(64);
        let result = peers
            .sender
            .file_push(&peers.sender_dir.path().join("missing"), "text/plain");
        assert!(matches!(result, Err(SessionError::Transfer(TransferError::Io { .. }))));
        assert!(peers.sender.ports().get(Role::RemoteClient, ServerPort::Job).is_idle());
        assert!(peers.sender.transport().outbox().is_empty());
    }

    #[test]
    fn test_read_failure_mid_push_aborts() {
        let mut peers = peers(16);
        let source = peers.sender_dir.path().join("gone.txt");
        fs::write(&source, pattern(100)).unwrap();
        peers.sender.file_push(&source, "text/plain").unwrap();
        fs::remove_file(&source).unwrap();

        let result = peers.sender.on_push_confirmation(ServerPort::Job, ResponseCode::CONTINUE);
        assert!(matches!(result, Err(SessionError::Transfer(_))));
        assert_eq!(
            peers.sender.operation(Role::RemoteClient, ServerPort::Job),
            PortOperation::Abort
        );
        assert_eq!(
            peers.sender.transport().outbox().back(),
            Some(&Message::AbortRequest {
                port: ServerPort::Job
            })
        );

        peers.sender.on_abort_confirmation(ServerPort::Job);
        assert!(peers.sender.ports().get(Role::RemoteClient, ServerPort::Job).is_idle());
    }

    #[test]
    fn test_transport_failure_releases_port() {
        let mut peers = peers(64);
        let source = peers.sender_dir.path().join("a.txt");
        fs::write(&source, b"hello").unwrap();
        peers.sender.transport_mut().disconnect();

        let result = peers.sender.file_push(&source, "text/plain");
        assert!(matches!(
            result,
            Err(SessionError::Transport(TransportError::Disconnected))
        ));
        assert!(peers.sender.ports().get(Role::RemoteClient, ServerPort::Job).is_idle());
    }

    #[test]
    fn test_rejected_push_is_terminal() {
        let mut peers = peers(64);
        let source = peers.sender_dir.path().join("a.txt");
        fs::write(&source, pattern(200)).unwrap();
        peers.sender.file_push(&source, "text/plain").unwrap();

        peers
            .sender
            .on_push_confirmation(ServerPort::Job, ResponseCode::UNSUPPORTED_MEDIA_TYPE)
            .unwrap();
        assert!(peers.sender.ports().get(Role::RemoteClient, ServerPort::Job).is_idle());
        assert_eq!(peers.sender.transport().outbox().len(), 1);
    }

    #[test]
    fn test_unsolicited_confirmation_is_ignored() {
        let mut peers = peers(64);
        peers
            .sender
            .on_push_confirmation(ServerPort::Job, ResponseCode::OK)
            .unwrap();
        assert!(peers.sender.transport().outbox().is_empty());
    }

    #[test]
    fn test_create_job_then_send_document() {
        let mut peers = peers(1024);
        let request = peers.sender_dir.path().join("create.xml");
        fs::write(
            &request,
            "<CreateJob><JobName>holiday</JobName><Copies>2</Copies></CreateJob>",
        )
        .unwrap();
        let source = peers.sender_dir.path().join("photo.jpg");
        fs::write(&source, pattern(3000)).unwrap();

        peers.sender.create_job(&request).unwrap();
        let mut respond = |_: ServerPort, op: PortOperation, doc: &SoapDocument| {
            assert_eq!(op, PortOperation::CreateJob);
            assert_eq!(doc.total_elements(), 3);
            let reply = build_from_xml(
                b"<CreateJobResponse><JobId>7</JobId><OperationStatus>0x0000</OperationStatus></CreateJobResponse>",
            )
            .unwrap();
            (ResponseCode::OK, Some(reply))
        };
        pump(&mut peers.sender, &mut peers.printer, &mut respond).unwrap();
        assert_eq!(peers.sender.job_id(), Some(7));
        assert!(peers.sender.ports().get(Role::RemoteClient, ServerPort::Job).is_idle());

        peers.sender.send_document(&source, "image/jpeg", None).unwrap();
        match &peers.sender.transport().outbox()[0] {
            Message::SendDocument { job_id, .. } => assert_eq!(*job_id, 7),
            other => panic!("unexpected {:?}", other),
        }
        run(&mut peers);

        let received = peers.printer_dir.path().join("photo.jpg");
        assert!(files_match(&source, &received, ChecksumAlgorithm::Md5).unwrap());
    }

    #[test]
    fn test_malformed_request_leaves_port_idle() {
        let mut peers = peers(64);
        let request = peers.sender_dir.path().join("bad.xml");
        fs::write(&request, "<a><b>1</a>").unwrap();

        let result = peers
            .sender
            .get_printer_attributes(ServerPort::Job, &request);
        assert!(matches!(result, Err(SessionError::Build(_))));
        assert!(peers.sender.ports().get(Role::RemoteClient, ServerPort::Job).is_idle());
        assert!(peers.sender.transport().outbox().is_empty());
    }

    #[test]
    fn test_soap_request_rejects_transfer_operations() {
        let mut peers = peers(64);
        let document = build_from_xml(b"<a>1</a>").unwrap();
        let result = peers
            .sender
            .send_soap_request(ServerPort::Job, PortOperation::FilePush, &document);
        assert!(matches!(
            result,
            Err(SessionError::Port(PortError::InvalidOperation { .. }))
        ));
    }

    #[test]
    fn test_busy_printer_answers_service_unavailable() {
        let mut peers = peers(64);
        let document = build_from_xml(b"<GetEvent><JobId>3</JobId></GetEvent>").unwrap();

        peers
            .printer
            .on_soap_indication(ServerPort::Status, PortOperation::GetEvent, document.elements())
            .unwrap();
        let result = peers.printer.on_soap_indication(
            ServerPort::Status,
            PortOperation::GetJobAttributes,
            document.elements(),
        );
        assert!(matches!(result, Err(SessionError::Port(_))));
        assert_eq!(
            peers.printer.transport().outbox().back(),
            Some(&Message::SoapResponse {
                port: ServerPort::Status,
                op: PortOperation::GetJobAttributes,
                code: ResponseCode::SERVICE_UNAVAILABLE,
                document: None,
            })
        );
        assert_eq!(
            peers.printer.operation(Role::LocalServer, ServerPort::Status),
            PortOperation::GetEvent
        );
    }

    #[test]
    fn test_continue_keeps_get_event_open() {
        let mut peers = peers(64);
        let document = build_from_xml(b"<GetEvent><JobId>3</JobId></GetEvent>").unwrap();
        peers
            .sender
            .send_soap_request(ServerPort::Status, PortOperation::GetEvent, &document)
            .unwrap();

        peers
            .sender
            .on_soap_confirmation(ServerPort::Status, ResponseCode::CONTINUE, &[]);
        assert_eq!(
            peers.sender.operation(Role::RemoteClient, ServerPort::Status),
            PortOperation::GetEvent
        );
        let op = peers
            .sender
            .on_soap_confirmation(ServerPort::Status, ResponseCode::OK, &[]);
        assert_eq!(op, PortOperation::GetEvent);
        assert!(peers.sender.ports().get(Role::RemoteClient, ServerPort::Status).is_idle());
    }

    #[test]
    fn test_respond_without_request_fails() {
        let mut peers = peers(64);
        let result = peers.printer.respond_soap(ServerPort::Job, ResponseCode::OK, None);
        assert!(matches!(result, Err(SessionError::Port(PortError::NoOperation))));
    }

    #[test]
    fn test_referenced_object_pull() {
        let mut peers = peers(1024);
        let object = peers.sender_dir.path().join("logo.png");
        fs::write(&object, pattern(5000)).unwrap();
        let destination = peers.printer_dir.path().join("logo.png");

        peers
            .printer
            .get_referenced_objects("logo.png", 0, None, &destination)
            .unwrap();
        run(&mut peers);

        assert!(files_match(&object, &destination, ChecksumAlgorithm::Blake3).unwrap());
        assert!(peers
            .printer
            .ports()
            .get(Role::RemoteClient, ServerPort::ReferencedObject)
            .is_idle());
        assert!(peers
            .sender
            .ports()
            .get(Role::LocalServer, ServerPort::ReferencedObject)
            .is_idle());
    }

    #[test]
    fn test_referenced_object_window() {
        let mut peers = peers(1024);
        let data = pattern(100);
        fs::write(peers.sender_dir.path().join("data"), &data).unwrap();
        let destination = peers.printer_dir.path().join("part");

        peers
            .printer
            .get_referenced_objects("data", 10, Some(20), &destination)
            .unwrap();
        run(&mut peers);

        assert_eq!(fs::read(destination).unwrap(), &data[10..30]);
    }

    #[test]
    fn test_referenced_object_size_on_first_response() {
        let mut peers = peers(16);
        fs::write(peers.sender_dir.path().join("data"), pattern(40)).unwrap();

        let code = peers
            .sender
            .on_referenced_objects_indication(ObjectRequest {
                object: "data",
                offset: 0,
                count: None,
                want_size: true,
            })
            .unwrap();
        assert_eq!(code, ResponseCode::CONTINUE);
        match peers.sender.transport().outbox().back() {
            Some(Message::ReferencedObjectsResponse {
                object_size, data, ..
            }) => {
                assert_eq!(*object_size, Some(40));
                assert_eq!(data.len(), 16);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_referenced_object() {
        let mut peers = peers(64);
        let destination = peers.printer_dir.path().join("nothing");

        peers
            .printer
            .get_referenced_objects("nothing", 0, None, &destination)
            .unwrap();
        run(&mut peers);

        assert!(!destination.exists());
        assert!(peers
            .printer
            .ports()
            .get(Role::RemoteClient, ServerPort::ReferencedObject)
            .is_idle());
        assert!(peers
            .sender
            .ports()
            .get(Role::LocalServer, ServerPort::ReferencedObject)
            .is_idle());
    }

    #[test]
    fn test_source_truncated_mid_push_finishes() {
        let mut peers = peers(16);
        let source = peers.sender_dir.path().join("shrinking.txt");
        fs::write(&source, pattern(100)).unwrap();

        peers.sender.file_push(&source, "text/plain").unwrap();
        fs::write(&source, b"").unwrap();
        run(&mut peers);

        assert!(peers.sender.ports().get(Role::RemoteClient, ServerPort::Job).is_idle());
        assert!(peers.printer.ports().get(Role::LocalServer, ServerPort::Job).is_idle());
        let received = fs::read(peers.printer_dir.path().join("shrinking.txt")).unwrap();
        assert_eq!(received, &pattern(100)[..16]);
    }

    #[test]
    fn test_undelivered_object_response_releases_port() {
        let mut peers = peers(16);
        fs::write(peers.sender_dir.path().join("data"), pattern(40)).unwrap();
        let request = ObjectRequest {
            object: "data",
            offset: 0,
            count: None,
            want_size: true,
        };

        peers.sender.transport_mut().disconnect();
        let result = peers.sender.on_referenced_objects_indication(request);
        assert!(matches!(
            result,
            Err(SessionError::Transport(TransportError::Disconnected))
        ));
        assert!(peers
            .sender
            .ports()
            .get(Role::LocalServer, ServerPort::ReferencedObject)
            .is_idle());
        assert!(peers
            .sender
            .transfer(Role::LocalServer, ServerPort::ReferencedObject)
            .is_none());

        *peers.sender.transport_mut() = LoopbackTransport::new();
        assert_eq!(
            peers.sender.on_referenced_objects_indication(request).unwrap(),
            ResponseCode::CONTINUE
        );
    }

    #[test]
    fn test_non_soap_indication_is_refused() {
        let mut peers = peers(64);
        let result = peers
            .printer
            .on_soap_indication(ServerPort::Job, PortOperation::FilePush, &[]);
        assert!(matches!(
            result,
            Err(SessionError::Port(PortError::InvalidOperation {
                op: PortOperation::FilePush
            }))
        ));
        assert!(peers.printer.ports().get(Role::LocalServer, ServerPort::Job).is_idle());
        assert_eq!(
            peers.printer.transport().outbox().back(),
            Some(&Message::SoapResponse {
                port: ServerPort::Job,
                op: PortOperation::FilePush,
                code: ResponseCode::BAD_REQUEST,
                document: None,
            })
        );
    }

    #[test]
    fn test_abort_push() {
        let mut peers = peers(16);
        let source = peers.sender_dir.path().join("big.bin");
        fs::write(&source, pattern(1000)).unwrap();

        peers.sender.file_push(&source, "application/octet-stream").unwrap();
        assert_eq!(peers.sender.abort(ServerPort::Job).unwrap(), PortOperation::FilePush);
        assert_eq!(
            peers.sender.operation(Role::RemoteClient, ServerPort::Job),
            PortOperation::Abort
        );
        run(&mut peers);

        assert!(peers.sender.ports().get(Role::RemoteClient, ServerPort::Job).is_idle());
        assert!(peers.printer.ports().get(Role::LocalServer, ServerPort::Job).is_idle());
        assert!(peers.printer.transfer(Role::LocalServer, ServerPort::Job).is_none());
    }

    #[test]
    fn test_abort_idle_port() {
        let mut peers = peers(64);
        assert!(matches!(
            peers.sender.abort(ServerPort::Status),
            Err(SessionError::Port(PortError::NoOperation))
        ));
        assert!(matches!(
            peers.printer.on_abort_indication(ServerPort::Status),
            Err(SessionError::Port(PortError::NoOperation))
        ));
        assert!(peers.sender.transport().outbox().is_empty());
    }

    #[test]
    fn test_push_without_name_gets_generated_name() {
        let mut peers = peers(64);
        let code = peers
            .printer
            .on_push_indication(
                ServerPort::Job,
                PushSegment {
                    mime_type: "text/plain",
                    file_name: None,
                    data: b"anonymous",
                    final_segment: true,
                },
            )
            .unwrap();
        assert_eq!(code, ResponseCode::OK);

        let entries: Vec<_> = fs::read_dir(peers.printer_dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].extension().and_then(|e| e.to_str()), Some("bin"));
        assert_eq!(fs::read(&entries[0]).unwrap(), b"anonymous");
    }

    #[test]
    fn test_push_name_cannot_escape_root() {
        let mut peers = peers(64);
        peers
            .printer
            .on_push_indication(
                ServerPort::Job,
                PushSegment {
                    mime_type: "text/plain",
                    file_name: Some("../../escape.txt"),
                    data: b"x",
                    final_segment: true,
                },
            )
            .unwrap();
        assert!(peers.printer_dir.path().join("escape.txt").exists());
    }

    #[test]
    fn test_mismatched_segment_is_refused() {
        let mut peers = peers(64);
        let segment = PushSegment {
            mime_type: "text/plain",
            file_name: Some("a.txt"),
            data: b"first",
            final_segment: false,
        };
        assert_eq!(
            peers.printer.on_push_indication(ServerPort::Job, segment).unwrap(),
            ResponseCode::CONTINUE
        );
        assert_eq!(
            peers
                .printer
                .on_send_document_indication(ServerPort::Job, 1, segment)
                .unwrap(),
            ResponseCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            peers.printer.operation(Role::LocalServer, ServerPort::Job),
            PortOperation::FilePush
        );
    }

    #[test]
    fn test_port_closed_resets_everything() {
        let mut peers = peers(16);
        let source = peers.sender_dir.path().join("a.bin");
        fs::write(&source, pattern(100)).unwrap();
        peers.sender.file_push(&source, "application/octet-stream").unwrap();

        peers.sender.on_port_closed(ServerPort::Job);
        assert!(peers.sender.ports().get(Role::RemoteClient, ServerPort::Job).is_idle());
        assert!(peers.sender.transfer(Role::RemoteClient, ServerPort::Job).is_none());
        peers.sender.file_push(&source, "application/octet-stream").unwrap();
    }

    #[test]
    fn test_progress_reports() {
        let mut peers = peers(4);
        let events = Arc::new(Mutex::new(Vec::new()));
        peers.sender.set_progress(Box::new(RecordingProgress {
            events: events.clone(),
        }));
        let source = peers.sender_dir.path().join("a.txt");
        fs::write(&source, b"0123456789").unwrap();

        peers.sender.file_push(&source, "text/plain").unwrap();
        run(&mut peers);

        let events = events.lock().unwrap();
        assert_eq!(events.first().map(String::as_str), Some("started FilePush Some(10)"));
        assert_eq!(events.last().map(String::as_str), Some("completed OK 10"));
        assert!(events.iter().any(|e| e.starts_with("progress")));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = Session::new(
            PeerConfig::new("/definitely/not/here").with_buffer_size(64),
            LoopbackTransport::new(),
        );
        assert!(matches!(result, Err(SessionError::Config(_))));
    }
}
