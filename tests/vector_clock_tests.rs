// Vector clock property tests
// Ordering symmetry and merge laws over small agent sets

use concord::{ClockOrdering, VectorClock};
use proptest::prelude::*;

fn clock() -> impl Strategy<Value = VectorClock> {
    proptest::collection::btree_map(prop::sample::select(vec!["a", "b", "c", "d"]), 0u64..5, 0..4)
        .prop_map(VectorClock::from_entries)
}

fn flipped(ordering: ClockOrdering) -> ClockOrdering {
    match ordering {
        ClockOrdering::Before => ClockOrdering::After,
        ClockOrdering::After => ClockOrdering::Before,
        other => other,
    }
}

#[test]
fn test_reference_orderings() {
    let a = VectorClock::from_entries([("a", 1), ("b", 2)]);
    let b = VectorClock::from_entries([("a", 2), ("b", 2)]);
    let c = VectorClock::from_entries([("a", 1), ("b", 3)]);

    assert_eq!(a.compare(&b), ClockOrdering::Before);
    assert_eq!(b.compare(&a), ClockOrdering::After);
    assert_eq!(b.compare(&c), ClockOrdering::Concurrent);
    assert_eq!(a.compare(&a.clone()), ClockOrdering::Equal);
    assert_eq!(
        VectorClock::from_entries([("a", 0)]).compare(&VectorClock::new()),
        ClockOrdering::Equal
    );
}

proptest! {
    #[test]
    fn prop_compare_is_antisymmetric(x in clock(), y in clock()) {
        prop_assert_eq!(y.compare(&x), flipped(x.compare(&y)));
    }

    #[test]
    fn prop_merge_dominates_both_inputs(x in clock(), y in clock()) {
        let merged = x.merged(&y);
        prop_assert!(matches!(merged.compare(&x), ClockOrdering::After | ClockOrdering::Equal));
        prop_assert!(matches!(merged.compare(&y), ClockOrdering::After | ClockOrdering::Equal));
    }

    #[test]
    fn prop_merge_is_commutative(x in clock(), y in clock()) {
        prop_assert_eq!(x.merged(&y).compare(&y.merged(&x)), ClockOrdering::Equal);
    }

    #[test]
    fn prop_tick_moves_strictly_forward(x in clock(), agent in prop::sample::select(vec!["a", "b", "z"])) {
        let next = x.ticked(agent);
        prop_assert_eq!(next.compare(&x), ClockOrdering::After);
        prop_assert_eq!(next.get(agent), x.get(agent) + 1);
    }
}
