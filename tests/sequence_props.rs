//! Property tests for the sequence algebra and completion ordering.

use amqwire::{
    SequenceNumber,
    method::AcceptMode,
    sequence::SequenceSet,
};
use proptest::prelude::*;

mod common;
use common::{Harness, completed_sets, transfer_frameset};

proptest! {
    /// Inserting ids in any order yields a canonical, minimal range list.
    #[test]
    fn insertion_order_does_not_matter(mut ids in proptest::collection::vec(0u32..500, 1..64)) {
        let mut in_order = SequenceSet::new();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        for id in &sorted {
            in_order.add(SequenceNumber(*id));
        }

        ids.reverse();
        let mut shuffled = SequenceSet::new();
        for id in &ids {
            shuffled.add(SequenceNumber(*id));
        }
        prop_assert_eq!(&in_order, &shuffled);

        sorted.dedup();
        prop_assert_eq!(in_order.len(), sorted.len() as u64);
    }

    /// Removing everything that was added leaves the set empty.
    #[test]
    fn add_then_remove_round_trips(ids in proptest::collection::vec(0u32..200, 0..48)) {
        let mut set = SequenceSet::new();
        for id in &ids {
            set.add(SequenceNumber(*id));
        }
        for id in &ids {
            set.remove(SequenceNumber(*id));
        }
        prop_assert!(set.is_empty());
    }

    /// Membership matches the source id list exactly.
    #[test]
    fn contains_matches_membership(ids in proptest::collection::vec(0u32..128, 0..48)) {
        let mut set = SequenceSet::new();
        for id in &ids {
            set.add(SequenceNumber(*id));
        }
        for candidate in 0u32..128 {
            prop_assert_eq!(set.contains(SequenceNumber(candidate)), ids.contains(&candidate));
        }
    }

    /// Whatever order worker completions arrive in, the announced
    /// completion sets grow monotonically and end up covering every
    /// command, leaving nothing incomplete.
    #[test]
    fn completion_sets_grow_monotonically(order in proptest::sample::subsequence((0..8usize).collect::<Vec<_>>(), 8).prop_shuffle()) {
        let mut harness = Harness::new();
        let _ = harness.open_connection();
        let _ = harness.attach(1, "prop");

        for _ in 0..order.len() {
            for frame in transfer_frameset(1, "q", AcceptMode::None, true, b"x") {
                let _ = harness.feed(frame);
            }
        }

        let mut announced = Vec::new();
        let mut remaining: Vec<usize> = order.clone();
        while let Some(pick) = remaining.pop() {
            // Translate the command index into the handle's current slot.
            let slot = remaining.iter().filter(|left| **left < pick).count();
            harness.sink.take_handle(slot).complete();
            announced.extend(harness.pump_wakeups());
        }

        let sets = completed_sets(&announced, 1);
        prop_assert!(!sets.is_empty());
        for window in sets.windows(2) {
            for id in window[0].ids() {
                prop_assert!(window[1].contains(id));
            }
        }
        let last = sets.last().expect("at least one batch");
        for id in 0..order.len() {
            prop_assert!(last.contains(SequenceNumber(id as u32)));
        }
    }
}
