//! Flattened SOAP data elements.
//!
//! This is the caller-owned form of a parsed document: each element is
//! either a text leaf or a sequence of child elements. Dropping a
//! [`SoapDocument`] frees the whole tree.

use std::fmt;

use serde::Serialize;

/// Name of the element carrying a job identifier.
pub const JOB_ID_ELEMENT: &str = "JobId";

/// A named, possibly nested data element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SoapElement {
    #[serde(serialize_with = "serialize_bytes_lossy")]
    pub name: Vec<u8>,
    pub value: SoapValue,
}

/// Value of a data element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SoapValue {
    /// Text leaf. `None` for an element with no children and no text.
    Text(#[serde(serialize_with = "serialize_opt_bytes_lossy")] Option<Vec<u8>>),
    /// At least one child element.
    Sequence(Vec<SoapElement>),
}

impl SoapElement {
    pub fn text(name: impl Into<Vec<u8>>, value: Option<Vec<u8>>) -> Self {
        SoapElement {
            name: name.into(),
            value: SoapValue::Text(value),
        }
    }

    pub fn sequence(name: impl Into<Vec<u8>>, children: Vec<SoapElement>) -> Self {
        SoapElement {
            name: name.into(),
            value: SoapValue::Sequence(children),
        }
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    /// Number of elements in this subtree, this one included.
    pub fn total_elements(&self) -> usize {
        match &self.value {
            SoapValue::Text(_) => 1,
            SoapValue::Sequence(children) => 1 + count_elements(children),
        }
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self.value, SoapValue::Sequence(_))
    }

    pub fn text_value(&self) -> Option<&[u8]> {
        match &self.value {
            SoapValue::Text(value) => value.as_deref(),
            SoapValue::Sequence(_) => None,
        }
    }

    pub fn children(&self) -> &[SoapElement] {
        match &self.value {
            SoapValue::Sequence(children) => children,
            SoapValue::Text(_) => &[],
        }
    }
}

/// A fully built document: the top-level elements of one SOAP body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SoapDocument {
    elements: Vec<SoapElement>,
}

impl SoapDocument {
    pub fn new(elements: Vec<SoapElement>) -> Self {
        SoapDocument { elements }
    }

    /// Number of top-level elements.
    pub fn number_of_elements(&self) -> usize {
        self.elements.len()
    }

    /// Number of elements at every depth.
    pub fn total_elements(&self) -> usize {
        count_elements(&self.elements)
    }

    pub fn elements(&self) -> &[SoapElement] {
        &self.elements
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn into_parts(self) -> (usize, Vec<SoapElement>) {
        (self.elements.len(), self.elements)
    }

    /// Job id carried anywhere in the document.
    pub fn job_id(&self) -> Option<i64> {
        extract_job_id(&self.elements)
    }
}

fn count_elements(elements: &[SoapElement]) -> usize {
    elements.iter().map(SoapElement::total_elements).sum()
}

/// Depth-first search for the first text leaf called `name`
/// (case-insensitive) and parse it as a base-10 integer.
///
/// The search stops at the first matching leaf even when its value does not
/// parse; an unparsable or missing value yields `None`.
pub fn find_job_id(elements: &[SoapElement], name: &str) -> Option<i64> {
    find_leaf(elements, name.as_bytes()).and_then(parse_job_id)
}

/// [`find_job_id`] for the standard `JobId` element.
pub fn extract_job_id(elements: &[SoapElement]) -> Option<i64> {
    find_job_id(elements, JOB_ID_ELEMENT)
}

fn find_leaf<'a>(elements: &'a [SoapElement], name: &[u8]) -> Option<&'a [u8]> {
    for element in elements {
        match &element.value {
            SoapValue::Text(Some(value)) if element.name.eq_ignore_ascii_case(name) => {
                return Some(value);
            }
            SoapValue::Text(_) => {}
            SoapValue::Sequence(children) => {
                if let Some(found) = find_leaf(children, name) {
                    return Some(found);
                }
            }
        }
    }
    None
}

fn parse_job_id(value: &[u8]) -> Option<i64> {
    std::str::from_utf8(value).ok()?.trim().parse().ok()
}

impl fmt::Display for SoapDocument {
    /// Indented listing, one element per line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_level(
            f: &mut fmt::Formatter<'_>,
            elements: &[SoapElement],
            depth: usize,
        ) -> fmt::Result {
            for element in elements {
                let indent = "  ".repeat(depth);
                match &element.value {
                    SoapValue::Text(Some(value)) => writeln!(
                        f,
                        "{}{} = {}",
                        indent,
                        element.name_lossy(),
                        String::from_utf8_lossy(value)
                    )?,
                    SoapValue::Text(None) => writeln!(f, "{}{}", indent, element.name_lossy())?,
                    SoapValue::Sequence(children) => {
                        writeln!(f, "{}{}:", indent, element.name_lossy())?;
                        write_level(f, children, depth + 1)?;
                    }
                }
            }
            Ok(())
        }

        write_level(f, &self.elements, 0)
    }
}

fn serialize_bytes_lossy<S: serde::Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(bytes))
}

fn serialize_opt_bytes_lossy<S: serde::Serializer>(
    bytes: &Option<Vec<u8>>,
    s: S,
) -> Result<S::Ok, S::Error> {
    match bytes {
        Some(bytes) => s.serialize_some(&String::from_utf8_lossy(bytes)),
        None => s.serialize_none(),
    }
}
