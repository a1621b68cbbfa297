use super::typing::{cell_f64, number_value};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Columns added by `add_row_statistics`. They are never aggregated; grouping
/// drops them and derives them afresh.
pub const STAT_COLUMNS: [&str; 11] = [
    "first",
    "second",
    "third",
    "majority",
    "last",
    "total",
    "count",
    "mean",
    "median",
    "first_label",
    "second_label",
];

pub fn is_stat_column(column: &str) -> bool {
    STAT_COLUMNS.contains(&column)
}

fn descending(a: &(&str, f64), b: &(&str, f64)) -> Ordering {
    b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal)
}

/// Top `k` values in descending order, by partial selection.
fn top_k<'a>(values: &[(&'a str, f64)], k: usize) -> Vec<(&'a str, f64)> {
    let mut scratch = values.to_vec();
    let k = k.min(scratch.len());
    if k == 0 {
        return Vec::new();
    }
    if k < scratch.len() {
        scratch.select_nth_unstable_by(k - 1, descending);
        scratch.truncate(k);
    }
    scratch.sort_by(descending);
    scratch
}

fn median(values: &[(&str, f64)]) -> f64 {
    let mut scratch: Vec<f64> = values.iter().map(|(_, v)| *v).collect();
    let mid = scratch.len() / 2;
    let by_value = |a: &f64, b: &f64| a.partial_cmp(b).unwrap_or(Ordering::Equal);
    let (lower, upper, _) = scratch.select_nth_unstable_by(mid, by_value);
    let upper = *upper;
    if values.len() % 2 == 1 {
        upper
    } else {
        let below = lower.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (below + upper) / 2.0
    }
}

/// Row summary over the given numeric columns. Null cells are ignored; a row
/// with no numeric values gets no statistics at all.
pub fn row_statistics(row: &Map<String, Value>, numeric_columns: &[String]) -> Map<String, Value> {
    let values: Vec<(&str, f64)> = numeric_columns
        .iter()
        .filter_map(|column| {
            row.get(column)
                .and_then(cell_f64)
                .map(|v| (column.as_str(), v))
        })
        .collect();

    let mut stats = Map::new();
    if values.is_empty() {
        return stats;
    }

    let top = top_k(&values, 3);
    let total: f64 = values.iter().map(|(_, v)| v).sum();
    let last = values.iter().map(|(_, v)| *v).fold(f64::INFINITY, f64::min);
    let count = values.len();

    stats.insert("first".into(), number_value(top[0].1));
    stats.insert("first_label".into(), Value::String(top[0].0.to_string()));
    if let Some((label, second)) = top.get(1) {
        stats.insert("second".into(), number_value(*second));
        stats.insert("second_label".into(), Value::String(label.to_string()));
        stats.insert("majority".into(), number_value(top[0].1 - second));
    }
    if let Some((_, third)) = top.get(2) {
        stats.insert("third".into(), number_value(*third));
    }
    stats.insert("last".into(), number_value(last));
    stats.insert("total".into(), number_value(total));
    stats.insert("count".into(), Value::from(count));
    stats.insert("mean".into(), number_value(total / count as f64));
    stats.insert("median".into(), number_value(median(&values)));
    stats
}

/// Replaces any existing statistics on every row with freshly derived ones.
pub fn add_row_statistics(rows: &mut [Map<String, Value>], numeric_columns: &[String]) {
    for row in rows.iter_mut() {
        row.retain(|column, _| !is_stat_column(column));
        let stats = row_statistics(row, numeric_columns);
        row.extend(stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_vote_share_row() {
        let row = json!({"lab": 40.0, "con": 35.0, "lib": 15.0, "grn": 10.0, "name": "x"});
        let stats = row_statistics(
            row.as_object().unwrap(),
            &columns(&["lab", "con", "lib", "grn"]),
        );
        assert_eq!(stats["first"], json!(40.0));
        assert_eq!(stats["second"], json!(35.0));
        assert_eq!(stats["third"], json!(15.0));
        assert_eq!(stats["majority"], json!(5.0));
        assert_eq!(stats["last"], json!(10.0));
        assert_eq!(stats["total"], json!(100.0));
        assert_eq!(stats["count"], json!(4));
        assert_eq!(stats["mean"], json!(25.0));
        assert_eq!(stats["median"], json!(25.0));
        assert_eq!(stats["first_label"], json!("lab"));
        assert_eq!(stats["second_label"], json!("con"));
    }

    #[test]
    fn test_single_column_has_no_majority() {
        let row = json!({"only": 7.0});
        let stats = row_statistics(row.as_object().unwrap(), &columns(&["only"]));
        assert_eq!(stats["first"], json!(7.0));
        assert_eq!(stats["median"], json!(7.0));
        assert!(!stats.contains_key("majority"));
        assert!(!stats.contains_key("second"));
        assert!(!stats.contains_key("third"));
    }

    #[test]
    fn test_nulls_are_ignored_and_stats_replaced() {
        let mut rows = vec![json!({"a": 1.0, "b": null, "c": 3.0, "first": 99.0})
            .as_object()
            .cloned()
            .unwrap()];
        add_row_statistics(&mut rows, &columns(&["a", "b", "c"]));
        assert_eq!(rows[0]["first"], json!(3.0));
        assert_eq!(rows[0]["count"], json!(2));
        assert_eq!(rows[0]["median"], json!(2.0));
    }

    #[test]
    fn test_all_null_row_gets_no_stats() {
        let row = json!({"a": null});
        assert!(row_statistics(row.as_object().unwrap(), &columns(&["a"])).is_empty());
    }
}
