use serde::{Deserialize, Serialize};

use crate::model::{Row, Value};

/// Cached flat row of one identity, as last observed from storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub values: Row,
    /// Store-assigned, increasing across the whole store
    pub version: u64,
    /// Version this snapshot superseded, if any
    pub replaces_version: Option<u64>,
}

impl Snapshot {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Columns whose values differ from `other`, including columns present
    /// on only one side
    pub fn changed_columns(&self, other: &Row) -> Vec<String> {
        let mut changed: Vec<String> = self
            .values
            .iter()
            .filter(|(column, value)| other.get(column.as_str()) != Some(*value))
            .map(|(column, _)| column.clone())
            .collect();
        for column in other.keys() {
            if !self.values.contains_key(column) {
                changed.push(column.clone());
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::row;

    #[test]
    fn test_changed_columns() {
        let snapshot = Snapshot {
            values: row([("A", Value::Int(1)), ("B", Value::Int(2))]),
            version: 1,
            replaces_version: None,
        };
        let other = row([("A", Value::Int(1)), ("B", Value::Int(3)), ("C", Value::Null)]);
        assert_eq!(snapshot.changed_columns(&other), vec!["B", "C"]);
    }
}
