//! Property-based tests for batch claiming
//!
//! These tests use proptest to check the claim invariants of the
//! pending-queue consumer across random batch sizes and pending-set contents.

mod common;

use proptest::prelude::*;

use common::*;
use ferrite_changefeed::transport::memory::MemoryStore;
use ferrite_changefeed::Op;

// ============================================================================
// Test Strategies
// ============================================================================

/// A pending row: its key and the fields it holds (none means deleted).
fn rows_strategy() -> impl Strategy<Value = Vec<(String, Vec<(String, String)>)>> {
    prop::collection::btree_map(
        "[a-z0-9]{1,8}",
        prop::collection::vec(("[a-z]{1,4}", "[a-z0-9]{0,6}"), 0..4),
        0..40,
    )
    .prop_map(|rows| {
        rows.into_iter()
            .map(|(key, fields)| {
                // Field names are unique within a row.
                let mut seen = std::collections::HashSet::new();
                let fields = fields
                    .into_iter()
                    .filter(|(f, _)| seen.insert(f.clone()))
                    .collect();
                (key, fields)
            })
            .collect()
    })
}

fn seed(rows: &[(String, Vec<(String, String)>)]) -> MemoryStore {
    let store = MemoryStore::new();
    for (key, fields) in rows {
        let fields: Vec<(&str, &str)> = fields
            .iter()
            .map(|(f, v)| (f.as_str(), v.as_str()))
            .collect();
        produce(&store, "T", key, &fields);
    }
    store
}

// ============================================================================
// Claim Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: one batch returns at most min(N, M) records and removes
    /// exactly those keys from the pending set
    #[test]
    fn prop_batch_bounded_by_size(rows in rows_strategy(), batch in 1usize..20) {
        let store = seed(&rows);
        let total = rows.len();

        let claimed = runtime().block_on(async {
            let mut table = state_table(&store, "T", batch).await;
            let mut out = std::collections::VecDeque::new();
            table.pops(&mut out).await.unwrap();
            out
        });

        prop_assert_eq!(claimed.len(), batch.min(total));
        prop_assert_eq!(pending(&store, "T"), total - claimed.len());
        for record in &claimed {
            prop_assert!(!store.smembers("T_KEY_SET").contains(&record.key));
        }
    }

    /// Property: op is DEL exactly when a record has no fields, and the
    /// fields are the row as it was written
    #[test]
    fn prop_op_follows_fields(rows in rows_strategy(), batch in 1usize..20) {
        let store = seed(&rows);

        let records = runtime().block_on(async {
            let mut table = state_table(&store, "T", batch).await;
            drain(&mut table).await
        });

        prop_assert_eq!(records.len(), rows.len());
        for record in &records {
            prop_assert_eq!(record.op == Some(Op::Del), record.fields.is_empty());
            let (_, fields) = rows.iter().find(|(k, _)| *k == record.key).unwrap();
            prop_assert_eq!(&record.fields, fields);
        }
    }

    /// Property: draining with pop yields the same sequence as draining
    /// with pops
    #[test]
    fn prop_pop_matches_pops(rows in rows_strategy(), batch in 1usize..20) {
        let by_pop = seed(&rows);
        let by_pops = seed(&rows);

        let (popped, batched) = runtime().block_on(async {
            let mut a = state_table(&by_pop, "T", batch).await;
            let mut b = state_table(&by_pops, "T", batch).await;
            (drain(&mut a).await, drain_batches(&mut b).await)
        });

        prop_assert_eq!(popped, batched);
    }

    /// Property: queue depth is the pending-set size at start-up
    #[test]
    fn prop_queue_depth_is_cardinality(rows in rows_strategy()) {
        let store = seed(&rows);
        let depth = runtime().block_on(async {
            state_table(&store, "T", 1).await.queue_depth()
        });
        prop_assert_eq!(depth as usize, rows.len());
    }
}
