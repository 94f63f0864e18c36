//! Store-level property tests.

use crate::fixtures::TestStore;
use crate::generators::{change_list_strategy, workload_strategy, PropTestConfig};
use crate::invariants::{check_store, expected_contents};
use chunkdb_core::IndividualChange;
use proptest::prelude::*;

fn apply_one_by_one(store: &TestStore, changes: &[IndividualChange]) {
    for change in changes {
        store.apply_batch(vec![change.clone()]).unwrap();
    }
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn batch_matches_individual_changes(changes in change_list_strategy(1, 40)) {
        let batched = TestStore::new();
        batched.apply_batch(changes.clone()).unwrap();

        let single = TestStore::new();
        apply_one_by_one(&single, &changes);

        let model = expected_contents(&changes);
        prop_assert_eq!(batched.contents(), model.clone());
        prop_assert_eq!(single.contents(), model);
        check_store(&batched).unwrap();
        check_store(&single).unwrap();
    }

    #[test]
    fn rollups_do_not_change_contents(changes in workload_strategy(30)) {
        let store = TestStore::new();
        apply_one_by_one(&store, &changes);
        let before = store.contents();

        store.run_pending_rollups().unwrap();
        prop_assert_eq!(store.contents(), before.clone());
        prop_assert!(store.scheduled_rollups().is_empty());
        check_store(&store).unwrap();

        let store = store.reopen();
        prop_assert_eq!(store.contents(), before);
    }

    #[test]
    fn interleaved_rollups_keep_chunks_disjoint(
        first in workload_strategy(20),
        second in change_list_strategy(1, 20),
    ) {
        let store = TestStore::new();
        apply_one_by_one(&store, &first);
        store.run_pending_rollups().unwrap();
        store.apply_batch(second.clone()).unwrap();
        check_store(&store).unwrap();
        store.run_pending_rollups().unwrap();
        check_store(&store).unwrap();

        let model = expected_contents(first.iter().chain(second.iter()));
        prop_assert_eq!(store.contents(), model);
    }
}
