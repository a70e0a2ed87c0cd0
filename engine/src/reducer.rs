//! XML event reducer.
//!
//! Folds start/end/character events into the staging list. The reducer
//! keeps a cursor on the element currently being filled and a four-state
//! machine that decides when the document is complete or malformed. It
//! never blocks and never retries; feeding it an event is a pure step.

use log::trace;

use crate::error::BuildError;
use crate::staging::{StagingList, ROOT_ID};

/// Deepest element nesting accepted, the outer element counting as 1.
/// Deeper documents are rejected as malformed so that flattening and
/// dropping the tree stay within a small, fixed stack.
pub const MAX_DEPTH: usize = 256;

/// A tokenizer event, in document order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmlEvent<'a> {
    StartElement { name: &'a [u8] },
    EndElement { name: &'a [u8] },
    Character { text: &'a [u8] },
}

/// Parser state of the reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReducerState {
    /// No element has been opened yet.
    WaitingOpen,
    /// Inside the outer element, waiting for it to close.
    WaitingClose,
    /// The outer element closed. Terminal.
    Complete,
    /// Tags did not balance. Terminal.
    Error,
}

impl ReducerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReducerState::Complete | ReducerState::Error)
    }
}

/// Reduces one document's events into a [`StagingList`].
#[derive(Debug)]
pub struct ElementReducer {
    state: ReducerState,
    current_id: u32,
    outer_id: u32,
    depth: usize,
    opening_name: Vec<u8>,
    staging: StagingList,
    error: Option<BuildError>,
}

impl ElementReducer {
    pub fn new() -> Self {
        Self::with_staging(StagingList::new())
    }

    pub fn with_staging(staging: StagingList) -> Self {
        ElementReducer {
            state: ReducerState::WaitingOpen,
            current_id: ROOT_ID,
            outer_id: ROOT_ID,
            depth: 0,
            opening_name: Vec::new(),
            staging,
            error: None,
        }
    }

    pub fn state(&self) -> ReducerState {
        self.state
    }

    /// Id of the element being filled (0 before the outer element opens).
    pub fn current_id(&self) -> u32 {
        self.current_id
    }

    /// Number of elements open at the cursor (0 outside the outer element).
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Name recorded by the first start element.
    pub fn opening_name(&self) -> &[u8] {
        &self.opening_name
    }

    pub fn staging(&self) -> &StagingList {
        &self.staging
    }

    pub fn staging_mut(&mut self) -> &mut StagingList {
        &mut self.staging
    }

    /// Give up the staged nodes. The reducer should not be fed afterwards.
    pub fn into_staging(self) -> StagingList {
        self.staging
    }

    /// Take the error that moved the reducer into `Error`, if any.
    pub fn take_error(&mut self) -> Option<BuildError> {
        self.error.take()
    }

    /// Apply one event. Events after `Complete` or `Error` are ignored.
    pub fn feed(&mut self, event: XmlEvent<'_>) {
        match (self.state, event) {
            (ReducerState::Complete | ReducerState::Error, _) => {}
            (ReducerState::WaitingOpen, XmlEvent::StartElement { name }) => self.open_outer(name),
            (ReducerState::WaitingOpen, _) => {
                trace!("ignoring event before the outer element: {:?}", event);
            }
            (ReducerState::WaitingClose, XmlEvent::StartElement { name }) => self.descend(name),
            (ReducerState::WaitingClose, XmlEvent::EndElement { name }) => self.ascend(name),
            (ReducerState::WaitingClose, XmlEvent::Character { text }) => self.attach_text(text),
        }
    }

    fn open_outer(&mut self, name: &[u8]) {
        if name.is_empty() {
            trace!("ignoring empty opening tag");
            return;
        }

        match self.staging.insert(ROOT_ID, name, None) {
            Ok(id) => {
                self.opening_name = name.to_vec();
                self.outer_id = id;
                self.current_id = id;
                self.depth = 1;
                self.state = ReducerState::WaitingClose;
            }
            Err(e) => self.fail(e),
        }
    }

    fn descend(&mut self, name: &[u8]) {
        if name.is_empty() {
            self.fail(BuildError::malformed("empty element name"));
            return;
        }
        if self.depth >= MAX_DEPTH {
            self.fail(BuildError::malformed(format!(
                "elements nested deeper than {} levels",
                MAX_DEPTH
            )));
            return;
        }

        match self.staging.insert(self.current_id, name, None) {
            Ok(id) => {
                self.current_id = id;
                self.depth += 1;
            }
            Err(e) => self.fail(e),
        }
    }

    fn ascend(&mut self, name: &[u8]) {
        if self.current_id == self.outer_id && name.eq_ignore_ascii_case(&self.opening_name) {
            self.current_id = ROOT_ID;
            self.depth = 0;
            self.state = ReducerState::Complete;
            return;
        }

        let parent_id = match self.staging.find(self.current_id) {
            Some(node) if node.name.eq_ignore_ascii_case(name) => node.parent_id,
            Some(node) => {
                let reason = format!(
                    "end tag </{}> does not close <{}>",
                    String::from_utf8_lossy(name),
                    String::from_utf8_lossy(&node.name)
                );
                self.fail(BuildError::malformed(reason));
                return;
            }
            None => {
                let reason = format!(
                    "end tag </{}> has no open element",
                    String::from_utf8_lossy(name)
                );
                self.fail(BuildError::malformed(reason));
                return;
            }
        };
        self.current_id = parent_id;
        self.depth = self.depth.saturating_sub(1);
    }

    fn attach_text(&mut self, text: &[u8]) {
        let text = strip_leading_whitespace(text);
        if text.is_empty() {
            return;
        }

        match self.staging.find_mut(self.current_id) {
            Some(node) => match node.value.as_mut() {
                Some(value) => value.extend_from_slice(text),
                None => node.value = Some(text.to_vec()),
            },
            None => {
                trace!(
                    "dropping {} bytes of character data, no element {}",
                    text.len(),
                    self.current_id
                );
            }
        }
    }

    fn fail(&mut self, error: BuildError) {
        trace!("reducer entering error state: {}", error);
        self.error = Some(error);
        self.state = ReducerState::Error;
    }
}

impl Default for ElementReducer {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip leading spaces and the TAB..CR control range.
pub fn strip_leading_whitespace(text: &[u8]) -> &[u8] {
    let start = text
        .iter()
        .position(|&b| b != b' ' && !(b'\t'..=b'\r').contains(&b))
        .unwrap_or(text.len());
    &text[start..]
}
