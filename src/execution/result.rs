//! Query Result - rows returned by the datastore

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Row = Map<String, Value>;

/// Ordered rows of a query, each a JSON object keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    /// Column names in SELECT order
    pub columns: Vec<String>,

    pub rows: Vec<Row>,

    /// More rows existed than were fetched
    pub truncated: bool,
}

impl ResultSet {
    /// Build from fetched rows. `fetched` may hold one row beyond `max_rows`, which only
    /// signals truncation and is dropped.
    pub fn from_rows(mut fetched: Vec<Row>, max_rows: usize) -> Self {
        let truncated = fetched.len() > max_rows;
        fetched.truncate(max_rows);
        let columns = fetched
            .first()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default();
        Self {
            columns,
            rows: fetched,
            truncated,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_from_rows_keeps_column_order() {
        let rows = vec![row(json!({"vendor": "Amazon", "sum": 120.5}))];
        let result = ResultSet::from_rows(rows, 10);
        assert_eq!(result.columns, vec!["vendor", "sum"]);
        assert!(!result.truncated);
        assert_eq!(result.row_count(), 1);
    }

    #[test]
    fn test_extra_row_marks_truncation() {
        let rows = vec![row(json!({"n": 1})), row(json!({"n": 2})), row(json!({"n": 3}))];
        let result = ResultSet::from_rows(rows, 2);
        assert!(result.truncated);
        assert_eq!(result.row_count(), 2);
    }

    #[test]
    fn test_empty() {
        let result = ResultSet::from_rows(Vec::new(), 5);
        assert!(result.is_empty());
        assert!(result.columns.is_empty());
    }
}
