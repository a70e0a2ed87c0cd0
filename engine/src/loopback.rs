//! In-process transport connecting two sessions.
//!
//! Each [`LoopbackTransport`] queues the calls its session makes. [`pump`]
//! moves the queued calls across and turns them into the matching
//! indication or confirmation on the other session until both queues are
//! empty. Used by the CLI demo and by tests.

use std::collections::VecDeque;

use log::{debug, trace};

use crate::error::{SessionError, TransportError};
use crate::obex::ResponseCode;
use crate::port::{PortOperation, ServerPort};
use crate::session::{ObjectRequest, PushSegment, Session, Transport};
use crate::soap::SoapDocument;

/// A transport call, owned so it can sit in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    FilePush {
        mime_type: String,
        file_name: Option<String>,
        data: Vec<u8>,
        final_segment: bool,
    },
    SendDocument {
        job_id: i64,
        mime_type: String,
        file_name: Option<String>,
        data: Vec<u8>,
        final_segment: bool,
    },
    PushResponse {
        port: ServerPort,
        op: PortOperation,
        code: ResponseCode,
    },
    SoapRequest {
        port: ServerPort,
        op: PortOperation,
        document: SoapDocument,
    },
    SoapResponse {
        port: ServerPort,
        op: PortOperation,
        code: ResponseCode,
        document: Option<SoapDocument>,
    },
    ReferencedObjectsRequest {
        object: String,
        offset: u64,
        count: Option<u64>,
        want_size: bool,
    },
    ReferencedObjectsResponse {
        code: ResponseCode,
        object_size: Option<u64>,
        data: Vec<u8>,
    },
    AbortRequest {
        port: ServerPort,
    },
}

/// Queues every call for delivery by [`pump`].
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    outbox: VecDeque<Message>,
    disconnected: bool,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls queued and not yet delivered.
    pub fn outbox(&self) -> &VecDeque<Message> {
        &self.outbox
    }

    pub fn take_messages(&mut self) -> Vec<Message> {
        self.outbox.drain(..).collect()
    }

    /// Make every later call fail with `Disconnected`.
    pub fn disconnect(&mut self) {
        self.disconnected = true;
    }

    fn queue(&mut self, message: Message) -> Result<(), TransportError> {
        if self.disconnected {
            return Err(TransportError::Disconnected);
        }
        trace!("queued {:?}", message);
        self.outbox.push_back(message);
        Ok(())
    }
}

impl Transport for LoopbackTransport {
    fn file_push_request(&mut self, segment: PushSegment<'_>) -> Result<(), TransportError> {
        self.queue(Message::FilePush {
            mime_type: segment.mime_type.to_string(),
            file_name: segment.file_name.map(str::to_string),
            data: segment.data.to_vec(),
            final_segment: segment.final_segment,
        })
    }

    fn send_document_request(
        &mut self,
        job_id: i64,
        segment: PushSegment<'_>,
    ) -> Result<(), TransportError> {
        self.queue(Message::SendDocument {
            job_id,
            mime_type: segment.mime_type.to_string(),
            file_name: segment.file_name.map(str::to_string),
            data: segment.data.to_vec(),
            final_segment: segment.final_segment,
        })
    }

    fn push_response(
        &mut self,
        port: ServerPort,
        op: PortOperation,
        code: ResponseCode,
    ) -> Result<(), TransportError> {
        self.queue(Message::PushResponse { port, op, code })
    }

    fn soap_request(
        &mut self,
        port: ServerPort,
        op: PortOperation,
        document: &SoapDocument,
    ) -> Result<(), TransportError> {
        self.queue(Message::SoapRequest {
            port,
            op,
            document: document.clone(),
        })
    }

    fn soap_response(
        &mut self,
        port: ServerPort,
        op: PortOperation,
        code: ResponseCode,
        document: Option<&SoapDocument>,
    ) -> Result<(), TransportError> {
        self.queue(Message::SoapResponse {
            port,
            op,
            code,
            document: document.cloned(),
        })
    }

    fn referenced_objects_request(&mut self, request: ObjectRequest<'_>) -> Result<(), TransportError> {
        self.queue(Message::ReferencedObjectsRequest {
            object: request.object.to_string(),
            offset: request.offset,
            count: request.count,
            want_size: request.want_size,
        })
    }

    fn referenced_objects_response(
        &mut self,
        code: ResponseCode,
        object_size: Option<u64>,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.queue(Message::ReferencedObjectsResponse {
            code,
            object_size,
            data: data.to_vec(),
        })
    }

    fn abort_request(&mut self, port: ServerPort) -> Result<(), TransportError> {
        self.queue(Message::AbortRequest { port })
    }
}

/// Answers SOAP requests on behalf of the receiving session.
pub type SoapResponder<'a> =
    dyn FnMut(ServerPort, PortOperation, &SoapDocument) -> (ResponseCode, Option<SoapDocument>) + 'a;

/// Deliver queued calls between `a` and `b` until neither has anything
/// left to send. Returns the number of calls delivered.
///
/// # Errors
/// The first error a handler returns. Calls still queued stay queued.
pub fn pump(
    a: &mut Session<LoopbackTransport>,
    b: &mut Session<LoopbackTransport>,
    responder: &mut SoapResponder<'_>,
) -> Result<usize, SessionError> {
    let mut delivered = 0;
    loop {
        let from_a = a.transport_mut().take_messages();
        let from_b = b.transport_mut().take_messages();
        if from_a.is_empty() && from_b.is_empty() {
            debug!("loopback idle after {} calls", delivered);
            return Ok(delivered);
        }

        for message in from_a {
            deliver(a, b, message, responder)?;
            delivered += 1;
        }
        for message in from_b {
            deliver(b, a, message, responder)?;
            delivered += 1;
        }
    }
}

fn deliver(
    from: &mut Session<LoopbackTransport>,
    to: &mut Session<LoopbackTransport>,
    message: Message,
    responder: &mut SoapResponder<'_>,
) -> Result<(), SessionError> {
    match message {
        Message::FilePush {
            mime_type,
            file_name,
            data,
            final_segment,
        } => {
            let segment = PushSegment {
                mime_type: &mime_type,
                file_name: file_name.as_deref(),
                data: &data,
                final_segment,
            };
            to.on_push_indication(ServerPort::Job, segment)?;
        }
        Message::SendDocument {
            job_id,
            mime_type,
            file_name,
            data,
            final_segment,
        } => {
            let segment = PushSegment {
                mime_type: &mime_type,
                file_name: file_name.as_deref(),
                data: &data,
                final_segment,
            };
            to.on_send_document_indication(ServerPort::Job, job_id, segment)?;
        }
        Message::PushResponse { port, code, .. } => to.on_push_confirmation(port, code)?,
        Message::SoapRequest { port, op, document } => {
            match to.on_soap_indication(port, op, document.elements()) {
                Ok(()) => {
                    let (code, reply) = responder(port, op, &document);
                    to.respond_soap(port, code, reply.as_ref())?;
                }
                // Already answered with Service Unavailable.
                Err(SessionError::Port(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Message::SoapResponse {
            port,
            code,
            document,
            ..
        } => {
            let elements = document.as_ref().map(|d| d.elements()).unwrap_or(&[]);
            to.on_soap_confirmation(port, code, elements);
        }
        Message::ReferencedObjectsRequest {
            object,
            offset,
            count,
            want_size,
        } => {
            let request = ObjectRequest {
                object: &object,
                offset,
                count,
                want_size,
            };
            to.on_referenced_objects_indication(request)?;
        }
        Message::ReferencedObjectsResponse {
            code,
            object_size,
            data,
        } => to.on_referenced_objects_confirmation(code, object_size, &data)?,
        Message::AbortRequest { port } => {
            if let Err(e) = to.on_abort_indication(port) {
                debug!("abort on {} port: {}", port, e);
            }
            from.on_abort_confirmation(port);
        }
    }
    Ok(())
}
