//! Per-entity CRDT: a [`LinkedList`] plus this replica's Lamport clock.
//!
//! `local_*` methods turn user intent into a state change and an outbound
//! operation. `remote_*` methods apply an operation minted elsewhere,
//! keeping its identity verbatim and fast-forwarding the clock past it.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CrdtError;
use crate::identity::{ClientId, Identity};
use crate::list::LinkedList;
use crate::node::{Element, Node};

/// Clock of a fresh replica; the first identity it mints is `(1, client)`.
pub const INITIAL_CLOCK: u64 = 1;

/// Outbound insert: the node with its identity and declared anchor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertOp<T> {
    pub node: Node<T>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOp {
    pub target_id: Identity,
    pub clock: u64,
}

/// Outbound field update; carries the whole node, applied last-writer-wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOp<T> {
    pub node: Node<T>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderOp {
    pub target_id: Identity,
    pub before_id: Option<Identity>,
    pub after_id: Option<Identity>,
    pub clock: u64,
}

/// Plain structural form of a list, keyed by canonical identity strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSnapshot<T> {
    pub head: Option<Identity>,
    pub node_map: BTreeMap<String, Node<T>>,
}

/// `{clock, client, list: {head, nodeMap}}` used for bootstrap and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrdtSnapshot<T> {
    pub clock: u64,
    pub client: ClientId,
    pub list: ListSnapshot<T>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Crdt<T: Element> {
    clock: u64,
    client: ClientId,
    list: LinkedList<T>,
}

impl<T: Element> Crdt<T> {
    pub fn new(client: ClientId) -> Self {
        Self {
            clock: INITIAL_CLOCK,
            client,
            list: LinkedList::new(),
        }
    }

    /// Next clock value this replica will stamp.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn set_client(&mut self, client: ClientId) {
        self.client = client;
    }

    pub fn list(&self) -> &LinkedList<T> {
        &self.list
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn get(&self, id: &Identity) -> Option<&Node<T>> {
        self.list.get(id)
    }

    pub(crate) fn value_mut(&mut self, id: &Identity) -> Option<&mut T> {
        self.list.get_mut(id).map(|node| &mut node.value)
    }

    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.list.values_mut()
    }

    /// Values in document order.
    pub fn read(&self) -> Vec<&T> {
        self.list.iter().map(|node| &node.value).collect()
    }

    pub fn spread(&self) -> Vec<&Node<T>> {
        self.list.spread()
    }

    pub fn local_insert(&mut self, index: usize, mut value: T) -> Result<InsertOp<T>, CrdtError> {
        let next = self.next_clock()?;
        let id = Identity::new(self.clock, self.client);
        value.normalize();
        let node = self.list.insert_at_index(index, value, id)?.clone();
        self.clock = next;
        Ok(InsertOp { node })
    }

    /// The returned op carries the clock after the bump.
    pub fn local_delete(&mut self, index: usize) -> Result<DeleteOp, CrdtError> {
        let clock = self.next_clock()?;
        let target_id = self.list.find_by_index(index)?.id;
        self.list.delete_node(&target_id);
        self.clock = clock;
        Ok(DeleteOp { target_id, clock })
    }

    /// Edit the value at `index` in place. Identities and the clock are untouched.
    pub fn local_update(
        &mut self,
        index: usize,
        edit: impl FnOnce(&mut T),
    ) -> Result<UpdateOp<T>, CrdtError> {
        let id = self.list.find_by_index(index)?.id;
        self.local_update_by_id(id, edit)
    }

    pub fn local_update_by_id(
        &mut self,
        id: Identity,
        edit: impl FnOnce(&mut T),
    ) -> Result<UpdateOp<T>, CrdtError> {
        let node = self
            .list
            .get_mut(&id)
            .ok_or(CrdtError::DanglingReference(id))?;
        edit(&mut node.value);
        node.value.normalize();
        Ok(UpdateOp { node: node.clone() })
    }

    pub fn local_reorder(
        &mut self,
        target_id: Identity,
        before_id: Option<Identity>,
        after_id: Option<Identity>,
    ) -> Result<ReorderOp, CrdtError> {
        let clock = self.next_clock()?;
        self.list.reorder_nodes(target_id, before_id, after_id)?;
        self.clock = clock;
        Ok(ReorderOp {
            target_id,
            before_id,
            after_id,
            clock,
        })
    }

    /// Move the element at `from` so that it ends up at position `to`.
    pub fn local_move(&mut self, from: usize, to: usize) -> Result<ReorderOp, CrdtError> {
        let target = self.list.find_by_index(from)?.id;
        let mut rest = self.list.ids();
        rest.retain(|id| *id != target);
        if to > rest.len() {
            return Err(CrdtError::InvalidIndex {
                index: to,
                len: self.list.len(),
            });
        }
        let before = to.checked_sub(1).map(|i| rest[i]);
        let after = rest.get(to).copied();
        self.local_reorder(target, before, after)
    }

    /// Returns `Ok(false)` when the node was already present.
    pub fn remote_insert(&mut self, op: InsertOp<T>) -> Result<bool, CrdtError> {
        self.observe(op.node.id.clock)?;
        let mut node = op.node;
        node.value.adopt(self.client);
        node.value.normalize();
        self.list.insert_by_id(node)
    }

    /// Returns `Ok(false)` when the target was already gone.
    pub fn remote_delete(&mut self, op: &DeleteOp) -> Result<bool, CrdtError> {
        self.observe(op.clock)?;
        Ok(self.list.delete_node(&op.target_id).is_some())
    }

    pub fn remote_update(&mut self, op: UpdateOp<T>) -> Result<(), CrdtError> {
        let id = op.node.id;
        self.observe(id.clock)?;
        let client = self.client;
        let value = self
            .value_mut(&id)
            .ok_or(CrdtError::DanglingReference(id))?;
        value.replace_with(op.node.value);
        value.adopt(client);
        value.normalize();
        Ok(())
    }

    pub fn remote_reorder(&mut self, op: &ReorderOp) -> Result<bool, CrdtError> {
        self.observe(op.clock)?;
        self.list
            .reorder_nodes(op.target_id, op.before_id, op.after_id)
    }

    pub fn serialize(&self) -> CrdtSnapshot<T> {
        CrdtSnapshot {
            clock: self.clock,
            client: self.client,
            list: ListSnapshot {
                head: self.list.head(),
                node_map: self
                    .list
                    .iter()
                    .map(|node| (node.id.to_key(), node.clone()))
                    .collect(),
            },
        }
    }

    /// Rebuild from a snapshot, rejecting any snapshot whose chain does
    /// not satisfy the list invariants.
    pub fn deserialize(snapshot: CrdtSnapshot<T>) -> Result<Self, CrdtError> {
        let CrdtSnapshot {
            clock,
            client,
            list,
        } = snapshot;

        let mut max_clock = 0;
        let mut nodes = Vec::with_capacity(list.node_map.len());
        for (key, node) in list.node_map {
            let id: Identity = key.parse()?;
            if id != node.id {
                return Err(CrdtError::Snapshot(format!(
                    "key {key} holds node {}",
                    node.id
                )));
            }
            max_clock = max_clock.max(id.clock);
            nodes.push(node);
        }
        let floor = max_clock.checked_add(1).ok_or(CrdtError::ClockOverflow)?;

        Ok(Self {
            clock: clock.max(floor),
            client,
            list: LinkedList::from_parts(list.head, nodes)?,
        })
    }

    pub fn to_json(&self) -> Result<String, CrdtError> {
        serde_json::to_string(&Crdt::serialize(self))
            .map_err(|e| CrdtError::Snapshot(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, CrdtError> {
        let snapshot: CrdtSnapshot<T> =
            serde_json::from_str(json).map_err(|e| CrdtError::Snapshot(e.to_string()))?;
        Crdt::deserialize(snapshot)
    }

    /// Clock value after the next local stamp. Checked before any
    /// mutation so an exhausted clock leaves the list untouched.
    fn next_clock(&self) -> Result<u64, CrdtError> {
        self.clock.checked_add(1).ok_or(CrdtError::ClockOverflow)
    }

    /// Lamport catch-up: never regresses. A stamp of `u64::MAX` would
    /// leave no fresh clock to mint with, so it is refused.
    fn observe(&mut self, clock: u64) -> Result<(), CrdtError> {
        let floor = clock.checked_add(1).ok_or(CrdtError::ClockOverflow)?;
        self.clock = self.clock.max(floor);
        Ok(())
    }
}

impl<T: Element> Serialize for Crdt<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Crdt::serialize(self).serialize(serializer)
    }
}

impl<'de, T: Element> Deserialize<'de> for Crdt<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let snapshot = CrdtSnapshot::<T>::deserialize(deserializer)?;
        Crdt::deserialize(snapshot).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::Char;

    fn replica(client: ClientId) -> Crdt<Char> {
        Crdt::new(client)
    }

    fn text(crdt: &Crdt<Char>) -> String {
        crdt.list().stringify()
    }

    #[test]
    fn test_local_insert_mints_fresh_identities() {
        let mut a = replica(1);
        let first = a.local_insert(0, Char::new("H")).unwrap();
        let second = a.local_insert(1, Char::new("i")).unwrap();

        assert_eq!(first.node.id, Identity::new(1, 1));
        assert_eq!(second.node.id, Identity::new(2, 1));
        assert_eq!(second.node.prev, Some(first.node.id));
        assert_eq!(a.clock(), 3);
        assert_eq!(text(&a), "Hi");
    }

    #[test]
    fn test_failed_local_insert_keeps_clock() {
        let mut a = replica(1);
        assert!(a.local_insert(0, Char::new("a")).is_ok());
        assert!(a.local_insert(5, Char::new("b")).is_err());
        assert_eq!(a.clock(), 2);
    }

    #[test]
    fn test_local_delete_reports_new_clock() {
        let mut a = replica(1);
        a.local_insert(0, Char::new("a")).unwrap();
        let op = a.local_delete(0).unwrap();
        assert_eq!(op.target_id, Identity::new(1, 1));
        assert_eq!(op.clock, 3);
        assert_eq!(a.clock(), 3);
        assert!(a.is_empty());

        let op = a.local_insert(0, Char::new("b")).unwrap();
        assert_eq!(op.node.id, Identity::new(3, 1));
        a.local_insert(1, Char::new("c")).unwrap();
        let moved = a.local_move(0, 1).unwrap();
        assert_eq!(moved.clock, 6);
        assert_eq!(a.clock(), 6);
        assert_eq!(text(&a), "cb");
    }

    #[test]
    fn test_remote_max_clock_is_refused() {
        let mut a = replica(1);
        a.local_insert(0, Char::new("a")).unwrap();
        let before = a.clone();

        let hostile = InsertOp {
            node: Node::new(Identity::new(u64::MAX, 7), Char::new("z")),
        };
        assert_eq!(a.remote_insert(hostile).unwrap_err(), CrdtError::ClockOverflow);
        let delete = DeleteOp {
            target_id: Identity::new(1, 1),
            clock: u64::MAX,
        };
        assert_eq!(a.remote_delete(&delete).unwrap_err(), CrdtError::ClockOverflow);
        assert_eq!(a, before);
    }

    #[test]
    fn test_exhausted_clock_fails_without_panic() {
        let mut a = replica(1);
        let near_end = InsertOp {
            node: Node::new(Identity::new(u64::MAX - 2, 7), Char::new("x")),
        };
        a.remote_insert(near_end).unwrap();
        assert_eq!(a.clock(), u64::MAX - 1);

        let last = a.local_insert(1, Char::new("y")).unwrap();
        assert_eq!(last.node.id, Identity::new(u64::MAX - 1, 1));
        assert_eq!(a.clock(), u64::MAX);

        let before = a.clone();
        assert_eq!(a.local_insert(0, Char::new("z")).unwrap_err(), CrdtError::ClockOverflow);
        assert_eq!(a.local_delete(0).unwrap_err(), CrdtError::ClockOverflow);
        assert_eq!(a.local_move(0, 1).unwrap_err(), CrdtError::ClockOverflow);
        assert_eq!(a, before);
        assert_eq!(text(&a), "xy");
    }

    #[test]
    fn test_local_delete_empty_list() {
        let mut a = replica(1);
        assert_eq!(a.local_delete(0).unwrap_err(), CrdtError::EmptyList);
    }

    #[test]
    fn test_remote_insert_catches_up_clock() {
        let mut a = replica(1);
        let mut b = replica(2);
        for (i, c) in "hello".chars().enumerate() {
            a.local_insert(i, Char::new(c.to_string())).unwrap();
        }
        let op = a.local_insert(5, Char::new("!")).unwrap();

        b.remote_insert(InsertOp {
            node: Node::new(op.node.id, op.node.value.clone()),
        })
        .unwrap();
        assert_eq!(b.clock(), 7);

        let mine = b.local_insert(1, Char::new("?")).unwrap();
        assert_eq!(mine.node.id, Identity::new(7, 2));
    }

    #[test]
    fn test_remote_clock_never_regresses() {
        let mut a = replica(1);
        for i in 0..10 {
            a.local_insert(i, Char::new("x")).unwrap();
        }
        assert_eq!(a.clock(), 11);
        let removed = a
            .remote_delete(&DeleteOp {
                target_id: Identity::new(1, 9),
                clock: 2,
            })
            .unwrap();
        assert!(!removed);
        assert_eq!(a.clock(), 11);
    }

    #[test]
    fn test_remote_update_is_last_writer_wins() {
        let mut a = replica(1);
        let mut b = replica(2);
        let op = a.local_insert(0, Char::new("a")).unwrap();
        b.remote_insert(op).unwrap();

        let update = a
            .local_update(0, |c| c.value = "A".to_string())
            .unwrap();
        b.remote_update(update).unwrap();
        assert_eq!(text(&b), "A");
    }

    #[test]
    fn test_remote_update_unknown_node() {
        let mut b = replica(2);
        let op = UpdateOp {
            node: Node::new(Identity::new(4, 1), Char::new("z")),
        };
        assert_eq!(
            b.remote_update(op).unwrap_err(),
            CrdtError::DanglingReference(Identity::new(4, 1))
        );
        assert_eq!(b.clock(), 5);
    }

    #[test]
    fn test_local_move_resolves_anchors() {
        let mut a = replica(1);
        for (i, c) in ["a", "b", "c", "d"].iter().enumerate() {
            a.local_insert(i, Char::new(*c)).unwrap();
        }

        let op = a.local_move(0, 2).unwrap();
        assert_eq!(text(&a), "bcad");
        assert_eq!(op.before_id, Some(Identity::new(3, 1)));
        assert_eq!(op.after_id, Some(Identity::new(4, 1)));

        let op = a.local_move(3, 0).unwrap();
        assert_eq!(text(&a), "dbca");
        assert_eq!(op.before_id, None);

        assert!(a.local_move(0, 4).is_err());
    }

    #[test]
    fn test_remote_reorder_matches_local() {
        let mut a = replica(1);
        let mut b = replica(2);
        for (i, c) in ["a", "b", "c"].iter().enumerate() {
            let op = a.local_insert(i, Char::new(*c)).unwrap();
            b.remote_insert(op).unwrap();
        }
        let op = a.local_move(2, 0).unwrap();
        b.remote_reorder(&op).unwrap();
        assert_eq!(text(&a), "cab");
        assert_eq!(a.list(), b.list());
        assert!(b.clock() > op.clock);
    }

    #[test]
    fn test_snapshot_roundtrip_json() {
        let mut a = replica(3);
        for (i, c) in "tessera".chars().enumerate() {
            a.local_insert(i, Char::new(c.to_string())).unwrap();
        }
        a.local_delete(2).unwrap();

        let json = a.to_json().unwrap();
        let restored: Crdt<Char> = Crdt::from_json(&json).unwrap();
        assert_eq!(restored, a);
        assert_eq!(text(&restored), "teera");
    }

    #[test]
    fn test_snapshot_shape() {
        let mut a = replica(1);
        a.local_insert(0, Char::new("x")).unwrap();
        let value = serde_json::to_value(&a).unwrap();
        assert_eq!(value["clock"], 2);
        assert_eq!(value["client"], 1);
        assert_eq!(value["list"]["head"]["clock"], 1);
        assert!(value["list"]["nodeMap"]["1@1"].is_object());
    }

    #[test]
    fn test_deserialize_rejects_mismatched_key() {
        let mut a = replica(1);
        a.local_insert(0, Char::new("x")).unwrap();
        let mut snapshot = a.serialize();
        let node = snapshot.list.node_map.remove("1@1").unwrap();
        snapshot.list.node_map.insert("9@9".to_string(), node);
        assert!(matches!(
            Crdt::deserialize(snapshot),
            Err(CrdtError::Snapshot(_))
        ));
    }

    #[test]
    fn test_deserialize_lifts_stale_clock() {
        let mut a = replica(1);
        a.local_insert(0, Char::new("x")).unwrap();
        let mut snapshot = a.serialize();
        snapshot.clock = 0;
        let restored = Crdt::deserialize(snapshot).unwrap();
        assert_eq!(restored.clock(), 2);
    }
}
