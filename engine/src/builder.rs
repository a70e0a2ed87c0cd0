//! SOAP element tree builder.
//!
//! `build_from_xml` tokenizes a document with quick-xml, folds the events
//! through the [`ElementReducer`] into the staging list and finally drains
//! the list into an owned [`SoapDocument`]:
//!
//! ```
//! use bpp_engine::builder::build_from_xml;
//!
//! let doc = build_from_xml(b"<a><b>1</b><c><d>2</d></c></a>").unwrap();
//! assert_eq!(doc.number_of_elements(), 1);
//! assert_eq!(doc.total_elements(), 4);
//! ```

use std::fs;
use std::path::Path;

use log::{debug, trace};
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::BuildError;
use crate::reducer::{ElementReducer, ReducerState, XmlEvent};
use crate::soap::{SoapDocument, SoapElement, SoapValue};
use crate::staging::{StagingList, ROOT_ID};

/// Drain every staged child of `parent_id` into owned elements.
///
/// Children are taken one at a time in discovery order. A child with text
/// becomes a text leaf; otherwise its own children are flattened and it
/// becomes a sequence, or an empty text leaf when it has none. An empty
/// result means `parent_id` had no children.
///
/// Recurses once per nesting level; lists built by the reducer are at most
/// [`MAX_DEPTH`](crate::reducer::MAX_DEPTH) deep.
///
/// # Errors
/// `AllocationFailure` when the element vector cannot be reserved. The
/// error aborts the whole flatten.
pub fn flatten(list: &mut StagingList, parent_id: u32) -> Result<Vec<SoapElement>, BuildError> {
    let count = list.count_children_of(parent_id);
    if count == 0 {
        return Ok(Vec::new());
    }

    let mut elements = Vec::new();
    elements
        .try_reserve_exact(count)
        .map_err(|_| BuildError::AllocationFailure)?;

    while let Some(node) = list.take_first_child_of(parent_id) {
        let value = match node.value {
            Some(text) if !text.is_empty() => SoapValue::Text(Some(text)),
            _ => {
                let children = flatten(list, node.id)?;
                if children.is_empty() {
                    SoapValue::Text(None)
                } else {
                    SoapValue::Sequence(children)
                }
            }
        };
        elements.push(SoapElement {
            name: node.name,
            value,
        });
    }

    Ok(elements)
}

/// Incremental document builder.
///
/// Feed it tokenizer events, then call [`DocumentBuilder::finish`]. On any
/// failure the staged nodes are freed so nothing from a rejected document
/// survives.
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    reducer: ElementReducer,
}

impl DocumentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, event: XmlEvent<'_>) {
        self.reducer.feed(event);
    }

    pub fn state(&self) -> ReducerState {
        self.reducer.state()
    }

    /// Nodes currently held in the staging list.
    pub fn staged_count(&self) -> usize {
        self.reducer.staging().len()
    }

    /// Discard everything staged so far.
    pub fn discard(&mut self) {
        self.reducer.staging_mut().clear();
    }

    /// Flatten a completed document.
    ///
    /// # Errors
    /// `MalformedXml` when the reducer hit unbalanced tags or the outer
    /// element never closed; flatten errors are passed through.
    pub fn finish(&mut self) -> Result<SoapDocument, BuildError> {
        match self.reducer.state() {
            ReducerState::Complete => {}
            ReducerState::Error => {
                self.discard();
                return Err(self
                    .reducer
                    .take_error()
                    .unwrap_or_else(|| BuildError::malformed("unbalanced tags")));
            }
            ReducerState::WaitingOpen => {
                self.discard();
                return Err(BuildError::malformed("document has no elements"));
            }
            ReducerState::WaitingClose => {
                self.discard();
                return Err(BuildError::malformed("document ended before the outer element closed"));
            }
        }

        let result = flatten(self.reducer.staging_mut(), ROOT_ID);
        let leftover = self.staged_count();
        if leftover > 0 {
            debug!("discarding {} staged elements not reachable from the root", leftover);
        }
        self.discard();

        let elements = result?;
        Ok(SoapDocument::new(elements))
    }
}

/// Build a SOAP element tree from an XML document.
///
/// Element names are taken without their namespace prefix. Tag balance is
/// judged by the reducer, not the tokenizer.
pub fn build_from_xml(xml: &[u8]) -> Result<SoapDocument, BuildError> {
    let mut builder = DocumentBuilder::new();
    if let Err(e) = tokenize(xml, &mut builder) {
        builder.discard();
        return Err(e);
    }

    let doc = builder.finish()?;
    trace!(
        "built document with {} top-level and {} total elements",
        doc.number_of_elements(),
        doc.total_elements()
    );
    Ok(doc)
}

/// Read an XML file and build its element tree.
pub fn build_from_file(path: &Path) -> Result<SoapDocument, BuildError> {
    let xml = fs::read(path).map_err(|e| BuildError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    debug!("building SOAP document from {} ({} bytes)", path.display(), xml.len());
    build_from_xml(&xml)
}

fn tokenize(xml: &[u8], builder: &mut DocumentBuilder) -> Result<(), BuildError> {
    let mut reader = Reader::from_reader(xml);
    let config = reader.config_mut();
    config.check_end_names = false;
    config.expand_empty_elements = true;

    let mut buf = Vec::new();
    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| BuildError::malformed(e.to_string()))?;
        match event {
            Event::Start(ref e) => builder.feed(XmlEvent::StartElement {
                name: e.local_name().as_ref(),
            }),
            Event::End(ref e) => builder.feed(XmlEvent::EndElement {
                name: e.local_name().as_ref(),
            }),
            Event::Text(ref e) => {
                let text = e
                    .unescape()
                    .map_err(|e| BuildError::malformed(e.to_string()))?;
                builder.feed(XmlEvent::Character {
                    text: text.as_bytes(),
                });
            }
            Event::CData(ref e) => builder.feed(XmlEvent::Character { text: &e[..] }),
            Event::Eof => break,
            _ => {}
        }

        if builder.state().is_terminal() {
            break;
        }
        buf.clear();
    }

    Ok(())
}
