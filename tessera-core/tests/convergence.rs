//! Replica convergence properties.

use proptest::prelude::*;
use tessera_core::{
    Char, ClientId, Crdt, CrdtError, DeleteOp, Identity, InsertOp, Node, ReorderOp, UpdateOp,
};

// =============================================================================
// Test helpers
// =============================================================================

#[derive(Clone, Debug)]
enum Edit {
    Insert { pos_pct: f64, ch: char },
    Delete { pos_pct: f64 },
    Update { pos_pct: f64, ch: char },
    Move { from_pct: f64, to_pct: f64 },
}

#[derive(Clone, Debug)]
enum Wire {
    Insert(InsertOp<Char>),
    Delete(DeleteOp),
    Update(UpdateOp<Char>),
    Reorder(ReorderOp),
}

fn arbitrary_edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        4 => (0.0..=1.0f64, proptest::char::range('a', 'z'))
            .prop_map(|(pos_pct, ch)| Edit::Insert { pos_pct, ch }),
        2 => (0.0..=1.0f64).prop_map(|pos_pct| Edit::Delete { pos_pct }),
        1 => (0.0..=1.0f64, proptest::char::range('A', 'Z'))
            .prop_map(|(pos_pct, ch)| Edit::Update { pos_pct, ch }),
        1 => (0.0..=1.0f64, 0.0..=1.0f64)
            .prop_map(|(from_pct, to_pct)| Edit::Move { from_pct, to_pct }),
    ]
}

fn scaled(pct: f64, len: usize) -> usize {
    ((pct * len as f64) as usize).min(len)
}

/// Run one edit against `crdt`, returning the op it would send.
fn run(crdt: &mut Crdt<Char>, edit: &Edit) -> Option<Wire> {
    let len = crdt.len();
    match edit {
        Edit::Insert { pos_pct, ch } => crdt
            .local_insert(scaled(*pos_pct, len), Char::new(ch.to_string()))
            .ok()
            .map(Wire::Insert),
        Edit::Delete { pos_pct } if len > 0 => crdt
            .local_delete(scaled(*pos_pct, len - 1))
            .ok()
            .map(Wire::Delete),
        Edit::Update { pos_pct, ch } if len > 0 => crdt
            .local_update(scaled(*pos_pct, len - 1), |c| c.value = ch.to_string())
            .ok()
            .map(Wire::Update),
        Edit::Move { from_pct, to_pct } if len > 0 => crdt
            .local_move(scaled(*from_pct, len - 1), scaled(*to_pct, len - 1))
            .ok()
            .map(Wire::Reorder),
        _ => None,
    }
}

fn apply(crdt: &mut Crdt<Char>, op: &Wire) -> Result<(), CrdtError> {
    match op {
        Wire::Insert(op) => crdt.remote_insert(op.clone()).map(|_| ()),
        Wire::Delete(op) => crdt.remote_delete(op).map(|_| ()),
        Wire::Update(op) => crdt.remote_update(op.clone()),
        Wire::Reorder(op) => crdt.remote_reorder(op).map(|_| ()),
    }
}

fn observed_clock(op: &Wire) -> u64 {
    match op {
        Wire::Insert(op) => op.node.id.clock,
        Wire::Delete(op) => op.clock,
        Wire::Update(op) => op.node.id.clock,
        Wire::Reorder(op) => op.clock,
    }
}

fn author(client: ClientId, edits: &[Edit]) -> (Crdt<Char>, Vec<Wire>) {
    let mut crdt = Crdt::new(client);
    let ops = edits.iter().filter_map(|e| run(&mut crdt, e)).collect();
    (crdt, ops)
}

fn text(crdt: &Crdt<Char>) -> String {
    crdt.list().stringify()
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Delivering every op twice yields the same list as delivering it once.
    #[test]
    fn duplicate_delivery_is_idempotent(edits in prop::collection::vec(arbitrary_edit(), 1..60)) {
        let (source, ops) = author(1, &edits);
        let mut once = Crdt::<Char>::new(2);
        let mut twice = Crdt::<Char>::new(3);

        for op in &ops {
            apply(&mut once, op).unwrap();
            apply(&mut twice, op).unwrap();
            apply(&mut twice, op).unwrap();
        }

        prop_assert_eq!(once.list(), source.list());
        prop_assert_eq!(twice.list(), source.list());
    }

    /// Inserts at distinct anchors commute.
    #[test]
    fn disjoint_inserts_commute(
        base in "[a-z]{2,12}",
        left_pct in 0.0..=1.0f64,
        right_pct in 0.0..=1.0f64,
    ) {
        let mut origin = Crdt::<Char>::new(1);
        for (i, c) in base.chars().enumerate() {
            origin.local_insert(i, Char::new(c.to_string())).unwrap();
        }
        let len = origin.len();
        let left = scaled(left_pct, len);
        let right = scaled(right_pct, len);
        prop_assume!(left != right);

        let mut a = Crdt::<Char>::deserialize(origin.serialize()).unwrap();
        a.set_client(2);
        let mut b = Crdt::<Char>::deserialize(origin.serialize()).unwrap();
        b.set_client(3);

        let from_a = Wire::Insert(a.local_insert(left, Char::new("X")).unwrap());
        let from_b = Wire::Insert(b.local_insert(right, Char::new("Y")).unwrap());

        apply(&mut a, &from_b).unwrap();
        apply(&mut b, &from_a).unwrap();

        prop_assert_eq!(a.list(), b.list());
        prop_assert_eq!(text(&a), text(&b));
    }

    /// Snapshots reproduce traversal order and node contents.
    #[test]
    fn snapshot_roundtrip(edits in prop::collection::vec(arbitrary_edit(), 0..60)) {
        let (source, _) = author(4, &edits);
        let restored = Crdt::<Char>::deserialize(source.serialize()).unwrap();

        prop_assert_eq!(restored.list(), source.list());
        prop_assert_eq!(restored.read(), source.read());

        let json = source.to_json().unwrap();
        let from_json = Crdt::<Char>::from_json(&json).unwrap();
        prop_assert_eq!(from_json.list(), source.list());
    }

    /// The clock stays above every identity and stamp the replica has seen.
    #[test]
    fn clock_is_monotonic(
        local in prop::collection::vec(arbitrary_edit(), 1..30),
        remote in prop::collection::vec(arbitrary_edit(), 1..30),
    ) {
        let (_, incoming) = author(9, &remote);
        let mut replica = Crdt::<Char>::new(1);
        let mut seen = 0;
        let mut stamped = 0;
        let mut last = replica.clock();

        let mut incoming = incoming.iter();
        for edit in &local {
            if let Some(op) = run(&mut replica, edit) {
                // Own deletes and reorders carry the clock after the bump.
                stamped = stamped.max(observed_clock(&op));
            }
            if let Some(op) = incoming.next() {
                seen = seen.max(observed_clock(op));
                // May fail once local edits diverged; the clock still catches up.
                let _ = apply(&mut replica, op);
            }
            prop_assert!(replica.clock() >= last);
            prop_assert!(replica.clock() >= stamped);
            prop_assert!(replica.clock() > seen);
            last = replica.clock();
        }
        for node in replica.spread() {
            prop_assert!(replica.clock() > node.id.clock);
        }
    }

    /// `spread` covers every node and the chain ends after exactly `len` steps.
    #[test]
    fn traversal_is_consistent(edits in prop::collection::vec(arbitrary_edit(), 1..80)) {
        let (crdt, _) = author(1, &edits);
        prop_assert_eq!(crdt.spread().len(), crdt.len());
        prop_assert!(crdt.list().validate().is_ok());
        if let Some(tail) = crdt.spread().last() {
            prop_assert!(tail.next.is_none());
        }
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn scenario_a_insert_and_delete() {
    let mut crdt = Crdt::<Char>::new(1);
    crdt.local_insert(0, Char::new("H")).unwrap();
    assert_eq!(text(&crdt), "H");
    crdt.local_insert(1, Char::new("i")).unwrap();
    assert_eq!(text(&crdt), "Hi");
    crdt.local_delete(0).unwrap();
    assert_eq!(text(&crdt), "i");
}

#[test]
fn scenario_b_relay_order_decides() {
    const A: ClientId = 1;
    const B: ClientId = 2;
    let mut a = Crdt::<Char>::new(A);
    let mut b = Crdt::<Char>::new(B);

    let x = a.local_insert(0, Char::new("X")).unwrap();
    let y = b.local_insert(0, Char::new("Y")).unwrap();
    assert_eq!(x.node.id, Identity::new(1, A));
    assert_eq!(y.node.id, Identity::new(1, B));

    // Every replica applies the relay's sequence, A then B, to its pre-sync state.
    let relayed = [Wire::Insert(x), Wire::Insert(y)];
    let mut replicas = [Crdt::<Char>::new(A), Crdt::<Char>::new(B), Crdt::<Char>::new(0)];
    for replica in &mut replicas {
        for op in &relayed {
            apply(replica, op).unwrap();
        }
    }

    assert_eq!(text(&replicas[0]), "YX");
    assert_eq!(replicas[0].list(), replicas[1].list());
    assert_eq!(replicas[1].list(), replicas[2].list());
}

#[test]
fn scenario_c_insert_after_deleted_anchor() {
    let mut crdt = Crdt::<Char>::new(2);
    let anchor = Identity::new(5, 1);
    crdt.remote_insert(InsertOp {
        node: Node::new(anchor, Char::new("a")),
    })
    .unwrap();
    crdt.remote_delete(&DeleteOp {
        target_id: anchor,
        clock: 6,
    })
    .unwrap();

    let racing = InsertOp {
        node: Node::with_prev(Identity::new(6, 1), Char::new("b"), Some(anchor)),
    };
    assert_eq!(
        crdt.remote_insert(racing).unwrap_err(),
        CrdtError::DanglingReference(anchor)
    );
    assert!(crdt.is_empty());
    assert!(crdt.list().validate().is_ok());
}

#[test]
fn scenario_d_reorder_to_head() {
    let mut crdt = Crdt::<Char>::new(1);
    for (i, c) in ["a", "b", "c"].iter().enumerate() {
        crdt.local_insert(i, Char::new(*c)).unwrap();
    }
    let x = crdt.list().find_by_index(0).unwrap().id;
    let target = crdt.list().find_by_index(2).unwrap().id;
    let middle = crdt.list().find_by_index(1).unwrap().id;

    crdt.local_reorder(target, None, Some(x)).unwrap();

    assert_eq!(text(&crdt), "cab");
    let head = crdt.get(&target).unwrap();
    assert_eq!(crdt.list().head(), Some(target));
    assert_eq!(head.prev, None);
    assert_eq!(head.next, Some(x));
    assert_eq!(crdt.get(&x).unwrap().prev, Some(target));
    assert_eq!(crdt.get(&middle).unwrap().next, None);
    assert!(crdt.list().validate().is_ok());
}
