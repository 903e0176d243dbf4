#![allow(clippy::unwrap_used, clippy::expect_used)]

use proptest::prelude::*;
use snapgraph_core::diff::merge;
use snapgraph_core::model::{Row, Value};

const COLUMNS: [&str; 4] = ["A", "B", "C", "D"];

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        (0i64..4).prop_map(Value::Int),
        "[ab]{1,2}".prop_map(Value::Text),
    ]
}

fn row_strategy() -> impl Strategy<Value = Row> {
    proptest::collection::vec(value_strategy(), COLUMNS.len()).prop_map(|values| {
        COLUMNS
            .iter()
            .zip(values)
            .map(|(c, v)| (c.to_string(), v))
            .collect()
    })
}

fn pending_strategy() -> impl Strategy<Value = Row> {
    proptest::collection::vec(proptest::option::of(value_strategy()), COLUMNS.len()).prop_map(
        |values| {
            COLUMNS
                .iter()
                .zip(values)
                .filter_map(|(c, v)| v.map(|v| (c.to_string(), v)))
                .collect()
        },
    )
}

proptest! {
    #[test]
    fn prop_pending_values_always_win(
        before in row_strategy(),
        after in row_strategy(),
        pending in pending_strategy(),
    ) {
        let outcome = merge(Some(&before), &after, &pending);
        for (column, local) in &pending {
            prop_assert_eq!(outcome.values.get(column), Some(local));
        }
    }

    #[test]
    fn prop_untouched_columns_follow_upstream(
        before in row_strategy(),
        after in row_strategy(),
        pending in pending_strategy(),
    ) {
        let outcome = merge(Some(&before), &after, &pending);
        for (column, value) in &after {
            if !pending.contains_key(column) {
                prop_assert_eq!(outcome.values.get(column), Some(value));
            }
        }
    }

    #[test]
    fn prop_no_pending_means_upstream_verbatim(
        before in row_strategy(),
        after in row_strategy(),
    ) {
        let outcome = merge(Some(&before), &after, &Row::new());
        prop_assert_eq!(outcome.values, after);
        prop_assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn prop_unchanged_upstream_never_conflicts(
        base in row_strategy(),
        pending in pending_strategy(),
    ) {
        let outcome = merge(Some(&base), &base, &pending);
        prop_assert!(outcome.upstream_changed.is_empty());
        prop_assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn prop_conflicts_are_pending_columns_changed_upstream(
        before in row_strategy(),
        after in row_strategy(),
        pending in pending_strategy(),
    ) {
        let outcome = merge(Some(&before), &after, &pending);
        for column in &outcome.conflicts {
            prop_assert!(pending.contains_key(column));
            prop_assert!(outcome.upstream_changed.contains(column));
            prop_assert_ne!(after.get(column), pending.get(column));
        }
    }
}

#[test]
fn test_merge_without_before_treats_every_column_as_changed() {
    let after: Row = [("A".to_string(), Value::Int(1))].into_iter().collect();
    let pending: Row = [("A".to_string(), Value::Int(2))].into_iter().collect();

    let outcome = merge(None, &after, &pending);

    assert_eq!(outcome.values.get("A"), Some(&Value::Int(2)));
    assert!(outcome.upstream_changed.contains("A"));
    assert!(outcome.conflicts.contains("A"));
}
