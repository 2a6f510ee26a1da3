//! Property-based tests for the acknowledgement watermark

use super::*;
use proptest::prelude::*;

proptest! {
    #[test]
    fn prop_watermark_never_moves_backwards(
        start in 0i64..1_000,
        ids in proptest::collection::vec(0i64..2_000, 0..100),
    ) {
        let mut watermark = Watermark::new(start);
        for id in ids {
            let before = watermark.next_offset();
            let admitted = watermark.admit(id);
            prop_assert_eq!(admitted, id >= before);
            prop_assert!(watermark.next_offset() >= before);
            if admitted {
                prop_assert_eq!(watermark.next_offset(), id + 1);
            }
        }
    }

    #[test]
    fn prop_admitted_ids_are_strictly_increasing(
        ids in proptest::collection::vec(0i64..500, 0..100),
    ) {
        let mut watermark = Watermark::new(0);
        let admitted: Vec<i64> = ids.into_iter().filter(|&id| watermark.admit(id)).collect();
        prop_assert!(admitted.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn prop_sorted_batch_ends_at_max_plus_one(
        ids in proptest::collection::btree_set(0i64..10_000, 1..50)
            .prop_map(|set| set.into_iter().collect::<Vec<_>>()),
    ) {
        let max = *ids.last().unwrap();
        let mut watermark = Watermark::new(0);
        for &id in &ids {
            prop_assert!(watermark.admit(id));
        }
        prop_assert_eq!(watermark.next_offset(), max + 1);

        // Replaying the same batch admits nothing
        for &id in &ids {
            prop_assert!(!watermark.admit(id));
        }
    }
}
