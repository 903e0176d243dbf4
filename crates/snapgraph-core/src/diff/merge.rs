//! Three-way merge of upstream snapshot changes into local pending edits

use std::collections::BTreeSet;

use crate::model::{Row, Value};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MergeOutcome {
    /// Upstream row with local pending values on top
    pub values: Row,
    /// Pending columns that upstream also changed, to a different value
    pub conflicts: BTreeSet<String>,
    /// Columns whose value differs between `before` and `after`
    pub upstream_changed: BTreeSet<String>,
}

/// Merge `after` into a locally edited object whose base was `before`
///
/// Local pending values always win. With no `before` every column of
/// `after` counts as changed upstream.
pub fn merge(before: Option<&Row>, after: &Row, pending: &Row) -> MergeOutcome {
    let upstream_changed: BTreeSet<String> = match before {
        Some(before) => {
            let columns: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
            columns
                .into_iter()
                .filter(|c| {
                    before.get(*c).unwrap_or(&Value::Null) != after.get(*c).unwrap_or(&Value::Null)
                })
                .cloned()
                .collect()
        }
        None => after.keys().cloned().collect(),
    };

    let conflicts = pending
        .iter()
        .filter(|(column, local)| {
            upstream_changed.contains(*column) && after.get(*column).unwrap_or(&Value::Null) != *local
        })
        .map(|(column, _)| column.clone())
        .collect();

    let mut values = after.clone();
    for (column, local) in pending {
        values.insert(column.clone(), local.clone());
    }

    MergeOutcome {
        values,
        conflicts,
        upstream_changed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::row;

    #[test]
    fn test_disjoint_edits_combine() {
        let before = row([("NAME", Value::from("a")), ("DOB", Value::from(1))]);
        let after = row([("NAME", Value::from("a")), ("DOB", Value::from(2))]);
        let pending = row([("NAME", Value::from("local"))]);

        let outcome = merge(Some(&before), &after, &pending);

        assert_eq!(outcome.values.get("NAME"), Some(&Value::from("local")));
        assert_eq!(outcome.values.get("DOB"), Some(&Value::from(2)));
        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.upstream_changed.len(), 1);
    }

    #[test]
    fn test_overlapping_edit_is_a_conflict_and_local_wins() {
        let before = row([("NAME", Value::from("a"))]);
        let after = row([("NAME", Value::from("upstream"))]);
        let pending = row([("NAME", Value::from("local"))]);

        let outcome = merge(Some(&before), &after, &pending);

        assert_eq!(outcome.values.get("NAME"), Some(&Value::from("local")));
        assert!(outcome.conflicts.contains("NAME"));
    }

    #[test]
    fn test_same_value_on_both_sides_is_not_a_conflict() {
        let before = row([("NAME", Value::from("a"))]);
        let after = row([("NAME", Value::from("b"))]);
        let pending = row([("NAME", Value::from("b"))]);

        assert!(merge(Some(&before), &after, &pending).conflicts.is_empty());
    }
}
