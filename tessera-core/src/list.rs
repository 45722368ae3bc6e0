//! Identity-addressed doubly linked list.
//!
//! Nodes live in a dense arena (`slots`) and are found through an
//! identity index; `next`/`prev` are identities, so a stale id held by a
//! caller can never reach into a freed slot.
//!
//! ```text
//!  head ──► (1@A) ◄──► (2@B) ◄──► (4@A) ──► None
//!             │          │          │
//!  index:   {1@A: 0,   2@B: 2,    4@A: 1}     slots: [n0, n1, n2, ·free·]
//! ```
//!
//! Invariants (checked by [`LinkedList::validate`]):
//! - following `next` from `head` visits every live node exactly once;
//! - `a.next == b.id` implies `b.prev == a.id`;
//! - the head has no `prev`, the tail has no `next`.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::error::CrdtError;
use crate::identity::Identity;
use crate::node::Node;

#[derive(Clone)]
pub struct LinkedList<T> {
    head: Option<Identity>,
    slots: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    index: FxHashMap<Identity, usize>,
}

impl<T> Default for LinkedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LinkedList<T> {
    pub fn new() -> Self {
        Self {
            head: None,
            slots: Vec::new(),
            free: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    /// Rebuild a list from a head and an unordered set of nodes, then
    /// validate the chain.
    pub(crate) fn from_parts(
        head: Option<Identity>,
        nodes: impl IntoIterator<Item = Node<T>>,
    ) -> Result<Self, CrdtError> {
        let mut list = Self::new();
        for node in nodes {
            if list.contains(&node.id) {
                return Err(CrdtError::DuplicateIdentity(node.id));
            }
            list.alloc(node);
        }
        list.head = head;
        list.validate()?;
        Ok(list)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn head(&self) -> Option<Identity> {
        self.head
    }

    pub fn contains(&self, id: &Identity) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &Identity) -> Option<&Node<T>> {
        let slot = *self.index.get(id)?;
        self.slots.get(slot)?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: &Identity) -> Option<&mut Node<T>> {
        let slot = *self.index.get(id)?;
        self.slots.get_mut(slot)?.as_mut()
    }

    /// Every live value, in arena order.
    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().flatten().map(|node| &mut node.value)
    }

    /// Insert `value` so that it ends up at position `index`.
    ///
    /// Index `0`, or any index on an empty list, inserts at the head.
    /// Walks from the head to find the predecessor, so this is O(index).
    pub fn insert_at_index(
        &mut self,
        index: usize,
        value: T,
        id: Identity,
    ) -> Result<&Node<T>, CrdtError> {
        if self.contains(&id) {
            return Err(CrdtError::DuplicateIdentity(id));
        }
        let prev = if index == 0 || self.head.is_none() {
            None
        } else {
            if index > self.len() {
                return Err(CrdtError::InvalidIndex {
                    index,
                    len: self.len(),
                });
            }
            Some(self.find_by_index(index - 1)?.id)
        };
        self.attach(prev, Node::new(id, value))
    }

    /// Idempotent remote insert.
    ///
    /// Returns `Ok(false)` if the identity is already present. The node is
    /// spliced directly after its declared `prev` as this replica currently
    /// sees it; its wire `next` is ignored.
    pub fn insert_by_id(&mut self, node: Node<T>) -> Result<bool, CrdtError> {
        if self.contains(&node.id) {
            return Ok(false);
        }
        if let Some(prev) = node.prev {
            if !self.contains(&prev) {
                return Err(CrdtError::DanglingReference(prev));
            }
        }
        let prev = node.prev;
        self.attach(prev, node)?;
        Ok(true)
    }

    /// Remove a node and relink its neighbours. Absent ids are a no-op.
    pub fn delete_node(&mut self, id: &Identity) -> Option<Node<T>> {
        self.unlink(id)?;
        let slot = self.index.remove(id)?;
        self.free.push(slot);
        self.slots.get_mut(slot)?.take()
    }

    /// Move `target` without changing its identity.
    ///
    /// `before == None` makes the target the new head; otherwise it is
    /// spliced right after `before`. `after` must exist when given but does
    /// not decide placement. Returns `Ok(false)` when the target is one of
    /// its own anchors.
    pub fn reorder_nodes(
        &mut self,
        target: Identity,
        before: Option<Identity>,
        after: Option<Identity>,
    ) -> Result<bool, CrdtError> {
        if !self.contains(&target) {
            return Err(CrdtError::DanglingReference(target));
        }
        for anchor in [before, after].into_iter().flatten() {
            if !self.contains(&anchor) {
                return Err(CrdtError::DanglingReference(anchor));
            }
        }
        if before == Some(target) || after == Some(target) {
            return Ok(false);
        }

        self.unlink(&target);
        let next = self.successor_of(before)?;
        if let Some(node) = self.get_mut(&target) {
            node.prev = before;
            node.next = next;
        }
        self.link_neighbours(before, target, next);
        Ok(true)
    }

    /// Node at position `index`, walking from the head.
    pub fn find_by_index(&self, index: usize) -> Result<&Node<T>, CrdtError> {
        if self.is_empty() {
            return Err(CrdtError::EmptyList);
        }
        if index >= self.len() {
            return Err(CrdtError::InvalidIndex {
                index,
                len: self.len(),
            });
        }

        let mut cursor = self.head;
        let mut steps = 0;
        while let Some(id) = cursor {
            let node = self
                .get(&id)
                .ok_or_else(|| CrdtError::CorruptedChain(format!("link to missing node {id}")))?;
            if steps == index {
                return Ok(node);
            }
            steps += 1;
            cursor = node.next;
        }
        Err(CrdtError::CorruptedChain(format!(
            "chain ended after {steps} of {} nodes",
            self.len()
        )))
    }

    /// Position of `id` in traversal order.
    pub fn index_of(&self, id: &Identity) -> Option<usize> {
        self.iter().position(|node| node.id == *id)
    }

    /// Nodes in traversal order.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
            remaining: self.len(),
        }
    }

    /// Ordered snapshot of the list.
    pub fn spread(&self) -> Vec<&Node<T>> {
        self.iter().collect()
    }

    pub fn ids(&self) -> Vec<Identity> {
        self.iter().map(|node| node.id).collect()
    }

    /// Check every structural invariant.
    pub fn validate(&self) -> Result<(), CrdtError> {
        let Some(head) = self.head else {
            if self.is_empty() {
                return Ok(());
            }
            return Err(CrdtError::CorruptedChain(format!(
                "no head but {} live nodes",
                self.len()
            )));
        };
        let head_node = self
            .get(&head)
            .ok_or_else(|| CrdtError::CorruptedChain(format!("head {head} is not a live node")))?;
        if let Some(prev) = head_node.prev {
            return Err(CrdtError::CorruptedChain(format!(
                "head {head} has prev {prev}"
            )));
        }

        let mut seen = 0;
        let mut prev = None;
        let mut cursor = Some(head);
        while let Some(id) = cursor {
            if seen == self.len() {
                return Err(CrdtError::CorruptedChain(format!(
                    "chain revisits nodes after {seen} steps"
                )));
            }
            let node = self
                .get(&id)
                .ok_or_else(|| CrdtError::CorruptedChain(format!("link to missing node {id}")))?;
            if node.prev != prev {
                return Err(CrdtError::CorruptedChain(format!(
                    "{id} has prev {:?}, expected {:?}",
                    node.prev, prev
                )));
            }
            prev = Some(id);
            cursor = node.next;
            seen += 1;
        }
        if seen != self.len() {
            return Err(CrdtError::CorruptedChain(format!(
                "{seen} of {} nodes reachable from head",
                self.len()
            )));
        }
        Ok(())
    }

    fn alloc(&mut self, node: Node<T>) -> usize {
        let id = node.id;
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(id, slot);
        slot
    }

    /// Store `node` between `prev` and `prev`'s current successor.
    fn attach(&mut self, prev: Option<Identity>, mut node: Node<T>) -> Result<&Node<T>, CrdtError> {
        let id = node.id;
        let next = self.successor_of(prev)?;
        node.prev = prev;
        node.next = next;
        let slot = self.alloc(node);
        self.link_neighbours(prev, id, next);
        self.slots[slot]
            .as_ref()
            .ok_or_else(|| CrdtError::CorruptedChain(format!("slot for {id} vanished")))
    }

    /// Current successor of `prev`, or the head when `prev` is `None`.
    fn successor_of(&self, prev: Option<Identity>) -> Result<Option<Identity>, CrdtError> {
        match prev {
            None => Ok(self.head),
            Some(p) => self
                .get(&p)
                .map(|node| node.next)
                .ok_or(CrdtError::DanglingReference(p)),
        }
    }

    fn link_neighbours(&mut self, prev: Option<Identity>, id: Identity, next: Option<Identity>) {
        match prev {
            Some(p) => {
                if let Some(node) = self.get_mut(&p) {
                    node.next = Some(id);
                }
            }
            None => self.head = Some(id),
        }
        if let Some(n) = next {
            if let Some(node) = self.get_mut(&n) {
                node.prev = Some(id);
            }
        }
    }

    /// Detach `id` from its neighbours, leaving it in its slot.
    fn unlink(&mut self, id: &Identity) -> Option<()> {
        let node = self.get(id)?;
        let (prev, next) = (node.prev, node.next);
        match prev {
            Some(p) => {
                if let Some(node) = self.get_mut(&p) {
                    node.next = next;
                }
            }
            None => {
                if self.head == Some(*id) {
                    self.head = next;
                }
            }
        }
        if let Some(n) = next {
            if let Some(node) = self.get_mut(&n) {
                node.prev = prev;
            }
        }
        Some(())
    }
}

impl<T: AsRef<str>> LinkedList<T> {
    /// Concatenation of every value in order.
    pub fn stringify(&self) -> String {
        self.iter().map(|node| node.value.as_ref()).collect()
    }
}

/// Two lists are equal when they hold the same nodes in the same order,
/// regardless of arena layout.
impl<T: PartialEq> PartialEq for LinkedList<T> {
    fn eq(&self, other: &Self) -> bool {
        self.head == other.head
            && self.len() == other.len()
            && self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }
}

impl<T: fmt::Debug> fmt::Debug for LinkedList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Traversal from the head. Stops after `len` steps even if the chain
/// is corrupted into a cycle.
pub struct Iter<'a, T> {
    list: &'a LinkedList<T>,
    cursor: Option<Identity>,
    remaining: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a Node<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let node = self.list.get(&self.cursor?)?;
        self.cursor = node.next;
        self.remaining -= 1;
        Some(node)
    }
}

impl<'a, T> IntoIterator for &'a LinkedList<T> {
    type Item = &'a Node<T>;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
