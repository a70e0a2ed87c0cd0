//! Port operation state machine.
//!
//! Every logical BPP channel serializes its operations: a new request may
//! only start when nothing is outstanding on that channel. Channels are
//! independent of each other, and the local server role and the remote
//! client role keep separate state for the same port.

use std::fmt;

use log::debug;

use crate::error::PortError;

/// The operation outstanding on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortOperation {
    #[default]
    None,
    Abort,
    FilePush,
    GetPrinterAttributes,
    CreateJob,
    SendDocument,
    GetJobAttributes,
    CancelJob,
    GetEvent,
    GetReferencedObjects,
}

impl PortOperation {
    /// True for tags that name a request which can be started.
    pub fn is_request(&self) -> bool {
        !matches!(self, PortOperation::None | PortOperation::Abort)
    }
}

impl fmt::Display for PortOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortOperation::None => "None",
            PortOperation::Abort => "Abort",
            PortOperation::FilePush => "FilePush",
            PortOperation::GetPrinterAttributes => "GetPrinterAttributes",
            PortOperation::CreateJob => "CreateJob",
            PortOperation::SendDocument => "SendDocument",
            PortOperation::GetJobAttributes => "GetJobAttributes",
            PortOperation::CancelJob => "CancelJob",
            PortOperation::GetEvent => "GetEvent",
            PortOperation::GetReferencedObjects => "GetReferencedObjects",
        };
        write!(f, "{}", name)
    }
}

/// The three logical BPP ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerPort {
    Job,
    Status,
    ReferencedObject,
}

impl fmt::Display for ServerPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerPort::Job => write!(f, "Job"),
            ServerPort::Status => write!(f, "Status"),
            ServerPort::ReferencedObject => write!(f, "ReferencedObject"),
        }
    }
}

/// Which side of a port this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Requests arrive from a remote client (printer side for Job/Status,
    /// sender side for ReferencedObject).
    LocalServer,
    /// This peer issues requests to a remote server.
    RemoteClient,
}

/// Operation state of a single channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortState {
    current: PortOperation,
}

impl PortState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> PortOperation {
        self.current
    }

    pub fn is_idle(&self) -> bool {
        self.current == PortOperation::None
    }

    /// Start `op` if the channel is idle.
    ///
    /// # Errors
    /// `InvalidOperation` for `None`/`Abort`; `ConflictingOperation` when
    /// another operation is outstanding. The state is unchanged on error.
    pub fn try_start(&mut self, op: PortOperation) -> Result<(), PortError> {
        if !op.is_request() {
            return Err(PortError::InvalidOperation { op });
        }
        if self.current != PortOperation::None {
            return Err(PortError::ConflictingOperation {
                current: self.current,
                requested: op,
            });
        }
        self.current = op;
        Ok(())
    }

    /// A terminal response arrived; the channel is idle again.
    /// Returns the operation that finished.
    pub fn complete(&mut self) -> PortOperation {
        std::mem::take(&mut self.current)
    }

    /// Abort whatever is outstanding and return it.
    ///
    /// # Errors
    /// `NoOperation` when the channel is already idle. Nothing changes.
    pub fn abort(&mut self) -> Result<PortOperation, PortError> {
        if self.current == PortOperation::None {
            return Err(PortError::NoOperation);
        }
        Ok(self.complete())
    }

    /// An abort request was sent and its confirmation is pending.
    /// Returns the operation being aborted.
    ///
    /// # Errors
    /// `NoOperation` when the channel is idle.
    pub fn begin_abort(&mut self) -> Result<PortOperation, PortError> {
        match self.current {
            PortOperation::None => Err(PortError::NoOperation),
            previous => {
                self.current = PortOperation::Abort;
                Ok(previous)
            }
        }
    }
}

/// Operation state of every channel, per role.
#[derive(Debug, Default, Clone)]
pub struct PortTable {
    local: [PortState; 3],
    remote: [PortState; 3],
}

impl PortTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, role: Role, port: ServerPort) -> &PortState {
        match role {
            Role::LocalServer => &self.local[index(port)],
            Role::RemoteClient => &self.remote[index(port)],
        }
    }

    pub fn get_mut(&mut self, role: Role, port: ServerPort) -> &mut PortState {
        match role {
            Role::LocalServer => &mut self.local[index(port)],
            Role::RemoteClient => &mut self.remote[index(port)],
        }
    }

    pub fn current(&self, role: Role, port: ServerPort) -> PortOperation {
        self.get(role, port).current()
    }

    pub fn try_start(
        &mut self,
        role: Role,
        port: ServerPort,
        op: PortOperation,
    ) -> Result<(), PortError> {
        self.get_mut(role, port).try_start(op)?;
        debug!("{:?} {} port: started {}", role, port, op);
        Ok(())
    }

    pub fn complete(&mut self, role: Role, port: ServerPort) -> PortOperation {
        let op = self.get_mut(role, port).complete();
        debug!("{:?} {} port: completed {}", role, port, op);
        op
    }

    pub fn abort(&mut self, role: Role, port: ServerPort) -> Result<PortOperation, PortError> {
        let op = self.get_mut(role, port).abort()?;
        debug!("{:?} {} port: aborted {}", role, port, op);
        Ok(op)
    }
}

fn index(port: ServerPort) -> usize {
    match port {
        ServerPort::Job => 0,
        ServerPort::Status => 1,
        ServerPort::ReferencedObject => 2,
    }
}
