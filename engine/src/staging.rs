//! Element staging list.
//!
//! While an XML document is being reduced, every element is staged here as a
//! flat node that only knows its parent's id. The flattener later drains the
//! list into an owned tree. The list is an arena scanned linearly; it holds
//! one document's elements, so O(n) lookups are fine.

use crate::error::BuildError;

/// Parent id of top-level nodes.
pub const ROOT_ID: u32 = 0;

/// An interim tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingNode {
    pub id: u32,
    pub parent_id: u32,
    pub name: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// Generates staging ids.
///
/// Ids increase monotonically from 1. When the next id would leave the
/// positive signed 32-bit range the generator wraps back to 1. It never
/// emits 0, which is reserved for the root.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    last: u32,
}

impl IdGenerator {
    pub fn new() -> Self {
        IdGenerator { last: ROOT_ID }
    }

    /// Start the sequence so that the next id is `last + 1` (tests only need
    /// this to reach the wrap point).
    pub fn starting_after(last: u32) -> Self {
        IdGenerator { last }
    }

    pub fn next_id(&mut self) -> u32 {
        self.last = if self.last >= i32::MAX as u32 {
            1
        } else {
            self.last + 1
        };
        self.last
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered collection of staged nodes keyed by generated id.
#[derive(Debug, Default)]
pub struct StagingList {
    nodes: Vec<StagingNode>,
    ids: IdGenerator,
}

impl StagingList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific id generator (lets tests exercise wrap-around).
    pub fn with_generator(ids: IdGenerator) -> Self {
        StagingList {
            nodes: Vec::new(),
            ids,
        }
    }

    /// Replace the id generator. Staged nodes are kept.
    pub fn set_generator(&mut self, ids: IdGenerator) {
        self.ids = ids;
    }

    /// Stage a new node under `parent_id` and return its id.
    ///
    /// # Errors
    /// `DuplicateId` if the generated id is already in the list, which can
    /// only happen after the generator wrapped around.
    pub fn insert(
        &mut self,
        parent_id: u32,
        name: &[u8],
        value: Option<&[u8]>,
    ) -> Result<u32, BuildError> {
        let id = self.ids.next_id();
        if self.find(id).is_some() {
            return Err(BuildError::DuplicateId { id });
        }

        self.nodes.push(StagingNode {
            id,
            parent_id,
            name: name.to_vec(),
            value: value.map(<[u8]>::to_vec),
        });
        Ok(id)
    }

    pub fn find(&self, id: u32) -> Option<&StagingNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn find_mut(&mut self, id: u32) -> Option<&mut StagingNode> {
        self.nodes.iter_mut().find(|node| node.id == id)
    }

    /// Remove and return every child of `parent_id`, in discovery order.
    pub fn take_children_of(&mut self, parent_id: u32) -> Vec<StagingNode> {
        let mut taken = Vec::new();
        let mut kept = Vec::with_capacity(self.nodes.len());
        for node in self.nodes.drain(..) {
            if node.parent_id == parent_id {
                taken.push(node);
            } else {
                kept.push(node);
            }
        }
        self.nodes = kept;
        taken
    }

    /// Remove and return the earliest staged child of `parent_id`.
    pub fn take_first_child_of(&mut self, parent_id: u32) -> Option<StagingNode> {
        let index = self
            .nodes
            .iter()
            .position(|node| node.parent_id == parent_id)?;
        Some(self.nodes.remove(index))
    }

    pub fn count_children_of(&self, parent_id: u32) -> usize {
        self.nodes
            .iter()
            .filter(|node| node.parent_id == parent_id)
            .count()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Free every staged node. The id generator keeps its position.
    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let mut ids = IdGenerator::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
    }

    #[test]
    fn test_ids_wrap_to_one_before_going_negative() {
        let mut ids = IdGenerator::starting_after(i32::MAX as u32 - 1);
        assert_eq!(ids.next_id(), i32::MAX as u32);
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn test_insert_and_find() {
        let mut list = StagingList::new();
        let a = list.insert(ROOT_ID, b"a", None).expect("insert a");
        let b = list.insert(a, b"b", Some(b"1")).expect("insert b");

        let node = list.find(b).expect("b staged");
        assert_eq!(node.parent_id, a);
        assert_eq!(node.name, b"b");
        assert_eq!(node.value.as_deref(), Some(&b"1"[..]));
        assert!(list.find(99).is_none());
    }

    #[test]
    fn test_insert_rejects_duplicate_after_wrap() {
        let mut list = StagingList::with_generator(IdGenerator::starting_after(i32::MAX as u32));
        let first = list.insert(ROOT_ID, b"a", None).expect("insert a");
        assert_eq!(first, 1);

        // Rewind the generator so the next id collides with the staged one
        list.ids = IdGenerator::starting_after(i32::MAX as u32);
        let result = list.insert(ROOT_ID, b"b", None);
        assert!(matches!(result, Err(BuildError::DuplicateId { id: 1 })));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_take_children_preserves_order_and_removes() {
        let mut list = StagingList::new();
        let a = list.insert(ROOT_ID, b"a", None).unwrap();
        list.insert(a, b"x", None).unwrap();
        let other = list.insert(ROOT_ID, b"other", None).unwrap();
        list.insert(a, b"y", None).unwrap();

        assert_eq!(list.count_children_of(a), 2);
        let children = list.take_children_of(a);
        let names: Vec<_> = children.iter().map(|n| n.name.clone()).collect();
        assert_eq!(names, vec![b"x".to_vec(), b"y".to_vec()]);

        assert_eq!(list.count_children_of(a), 0);
        assert!(list.take_children_of(a).is_empty());
        assert!(list.find(other).is_some());
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_take_first_child() {
        let mut list = StagingList::new();
        list.insert(ROOT_ID, b"first", None).unwrap();
        list.insert(ROOT_ID, b"second", None).unwrap();

        let node = list.take_first_child_of(ROOT_ID).expect("first child");
        assert_eq!(node.name, b"first");
        assert_eq!(list.count_children_of(ROOT_ID), 1);
        assert!(list.take_first_child_of(42).is_none());
    }

    #[test]
    fn test_clear_empties_list() {
        let mut list = StagingList::new();
        list.insert(ROOT_ID, b"a", None).unwrap();
        list.clear();
        assert!(list.is_empty());
    }
}
