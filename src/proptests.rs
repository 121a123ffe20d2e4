use super::*;

use proptest::prelude::*;
use proptest_derive::Arbitrary;

pub(crate) fn validate_tree<T>(t: &HandleTable<T>) {
    let Some(root) = t.root.as_deref() else {
        assert_eq!(t.len(), 0, "issued handles without a root");
        return;
    };
    assert_eq!(root.first, 0, "root must start at handle 0");
    if !t.is_empty() {
        assert!(root.covers(t.next_handle - 1), "root must cover the last handle");
    }

    let fan_out = t.fan_out as u64;
    let mut stored = 0usize;
    let mut stack: Vec<&TableNode<T>> = vec![root];
    while let Some(node) = stack.pop() {
        assert_eq!(node.slots.len(), t.fan_out, "fan-out must be uniform");

        let span = node.span();
        let mut rest = span;
        while rest > fan_out {
            assert_eq!(rest % fan_out, 0, "span {span} is not a power of {fan_out}");
            rest /= fan_out;
        }
        assert_eq!(rest, fan_out, "span {span} is not a power of {fan_out}");
        assert_eq!(node.first % span, 0, "node [{}, {}) is misaligned", node.first, node.limit);

        for (i, slot) in node.slots.iter().enumerate() {
            match slot {
                Slot::Empty => {}
                Slot::Leaf(_) => {
                    assert!(node.is_leaf(), "object stored in an internal node");
                    let handle = node.first + i as u64;
                    assert!(
                        handle != 0 && handle < t.next_handle,
                        "slot for unissued handle {handle} is occupied"
                    );
                    stored += 1;
                }
                Slot::Inner(child) => {
                    assert!(!node.is_leaf(), "child node stored in a leaf");
                    assert_eq!(
                        (child.first, child.limit),
                        node.slot_range(i),
                        "child must cover exactly its slot"
                    );
                    stack.push(&**child);
                }
            }
        }
    }

    assert_eq!(stored, t.len(), "stored objects must match issued handles");
}

#[derive(Debug)]
struct Obj {
    id: usize,
    cell: HandleCell,
}

impl Handled for Obj {
    fn handle_cell(&self) -> &HandleCell {
        &self.cell
    }
}

fn obj(id: usize) -> Arc<Obj> {
    Arc::new(Obj {
        id,
        cell: HandleCell::new(),
    })
}

const POOL: usize = 64;

#[derive(Clone, Debug, Arbitrary)]
enum Op {
    #[proptest(weight = 4)]
    Insert,
    #[proptest(weight = 2)]
    Assign(#[proptest(strategy = "0..POOL")] usize),
    #[proptest(weight = 3)]
    Lookup(#[proptest(strategy = "0u32..4096")] HandleId),
    Wire(#[proptest(strategy = "prop::collection::vec(any::<u8>(), 0..6)")] Vec<u8>),
}

fn fan_out_strategy() -> impl Strategy<Value = u32> {
    prop_oneof![4 => 2u32..=6, 1 => Just(DEFAULT_FAN_OUT)]
}

fn expect_lookup(
    t: &HandleTable<Obj>,
    model: &[Arc<Obj>],
    handle: HandleId,
) -> std::result::Result<(), TestCaseError> {
    let expected = (handle as usize).checked_sub(1).and_then(|i| model.get(i));
    match (t.lookup(handle), expected) {
        (Ok(got), Some(want)) => {
            prop_assert!(Arc::ptr_eq(&got, want), "handle {} resolved to the wrong object", handle);
        }
        (Err(HandleError::NotFound(h)), None) => {
            prop_assert_eq!(h, handle);
        }
        (got, want) => {
            prop_assert!(false, "handle {}: got {:?}, expected {:?}", handle, got, want);
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        max_shrink_iters: 10_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_matches_model(
        fan_out in fan_out_strategy(),
        ops in prop::collection::vec(any::<Op>(), 0..=600)
    ) {
        let mut t: HandleTable<Obj> = HandleTable::with_config(Config { fan_out }).unwrap();
        let pool: Vec<Arc<Obj>> = (0..POOL).map(|i| obj(usize::MAX - i)).collect();
        let mut model: Vec<Arc<Obj>> = Vec::new();

        for (step, op) in ops.into_iter().enumerate() {
            match op {
                Op::Insert => {
                    let o = obj(step);
                    let handle = t.insert(Arc::clone(&o)).unwrap();
                    model.push(o);
                    prop_assert_eq!(handle as usize, model.len());
                }
                Op::Assign(i) => {
                    let o = &pool[i];
                    let cached = o.cell.get();
                    let handle = t.assign(o).unwrap();
                    match cached {
                        Some(h) => {
                            prop_assert_eq!(handle, h);
                        }
                        None => {
                            model.push(Arc::clone(o));
                            prop_assert_eq!(handle as usize, model.len());
                        }
                    }
                    prop_assert_eq!(o.cell.get(), Some(handle));
                }
                Op::Lookup(handle) => expect_lookup(&t, &model, handle)?,
                Op::Wire(bytes) => match t.lookup_wire(WireHandle::Bytes(&bytes)) {
                    Err(HandleError::InvalidArgument(_)) => {
                        prop_assert_ne!(bytes.len(), WIRE_HANDLE_LEN);
                    }
                    _ => {
                        prop_assert_eq!(bytes.len(), WIRE_HANDLE_LEN);
                        let handle = decode_wire_handle(WireHandle::Bytes(&bytes)).unwrap();
                        expect_lookup(&t, &model, handle)?;
                    }
                },
            }
            prop_assert_eq!(t.len(), model.len());
        }

        validate_tree(&t);
        let got: Vec<(HandleId, usize)> = t.iter().map(|(h, o)| (h, o.id)).collect();
        let expected: Vec<(HandleId, usize)> = model
            .iter()
            .enumerate()
            .map(|(i, o)| ((i + 1) as HandleId, o.id))
            .collect();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn prop_gap_free_and_retrievable(fan_out in 2u32..=8, n in 0usize..=3000) {
        let mut t: HandleTable<usize> = HandleTable::with_config(Config { fan_out }).unwrap();
        for i in 1..=n {
            prop_assert_eq!(t.insert(Arc::new(i)).unwrap() as usize, i);
        }
        validate_tree(&t);
        for i in 1..=n {
            prop_assert_eq!(t.get(i as HandleId).map(|v| **v), Some(i));
        }
        prop_assert!(!t.contains(0));
        prop_assert!(!t.contains((n + 1) as HandleId));

        let stats = t.stats();
        prop_assert_eq!(stats.handles, n);
        prop_assert_eq!(stats.depth, t.depth());
    }
}

#[test]
fn depth_tracks_powers_of_fan_out() {
    for fan_out in [2u32, 3, 5, 120] {
        let mut t: HandleTable<()> = HandleTable::with_config(Config { fan_out }).unwrap();
        let f = fan_out as u64;
        // The root is the smallest power of the fan-out above the last handle.
        let last = f.pow(3).min(20_000);
        for _ in 1..last {
            t.insert(Arc::new(())).unwrap();
        }
        let mut span = f;
        let mut depth = 1;
        while span < last {
            span *= f;
            depth += 1;
        }
        assert_eq!(t.depth(), depth, "fan-out {fan_out}");
        validate_tree(&t);
    }
}
