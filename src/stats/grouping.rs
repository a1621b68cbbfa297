use super::typing::{cell_f64, number_value};
use super::AggregationOp;
use crate::models::ColumnType;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Picks the aggregation verb for a column: explicit per-column op, then the
/// calculated column's declared op, then the request default, then mean for
/// percentages and sum for everything else.
pub struct OpResolver<'a> {
    pub explicit: &'a BTreeMap<String, AggregationOp>,
    pub calculated: &'a HashMap<String, AggregationOp>,
    pub default: AggregationOp,
}

impl OpResolver<'_> {
    pub fn resolve(&self, column: &str, column_type: ColumnType) -> AggregationOp {
        [
            self.explicit.get(column).copied(),
            self.calculated.get(column).copied(),
            Some(self.default),
        ]
        .into_iter()
        .flatten()
        .find(|op| *op != AggregationOp::Guess)
        .unwrap_or(match column_type {
            ColumnType::Percentage => AggregationOp::Mean,
            _ => AggregationOp::Sum,
        })
    }
}

pub fn aggregate_numeric(values: &[f64], op: AggregationOp) -> Value {
    match op {
        AggregationOp::Count => Value::from(values.len()),
        _ if values.is_empty() => Value::Null,
        AggregationOp::Sum | AggregationOp::Guess => number_value(values.iter().sum()),
        AggregationOp::Mean => number_value(values.iter().sum::<f64>() / values.len() as f64),
        AggregationOp::Max => number_value(values.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
        AggregationOp::Min => number_value(values.iter().copied().fold(f64::INFINITY, f64::min)),
    }
}

/// Most frequent non-null value; ties go to the value seen first.
pub fn mode_of<'a>(values: impl IntoIterator<Item = &'a Value>) -> Value {
    let mut counts: Vec<(&Value, usize)> = Vec::new();
    for value in values.into_iter().filter(|v| !v.is_null()) {
        match counts.iter_mut().find(|(seen, _)| *seen == value) {
            Some((_, count)) => *count += 1,
            None => counts.push((value, 1)),
        }
    }
    let mut best: Option<(&Value, usize)> = None;
    for (value, count) in counts {
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value.clone()).unwrap_or(Value::Null)
}

/// Collapses a group of rows to one. Numeric columns use the resolved op,
/// text columns their mode. Returns the row and the op used per column.
pub fn aggregate_group(
    rows: &[&Map<String, Value>],
    column_types: &BTreeMap<String, ColumnType>,
    resolver: &OpResolver<'_>,
) -> (Map<String, Value>, BTreeMap<String, AggregationOp>) {
    let mut out = Map::new();
    let mut ops = BTreeMap::new();

    for (column, column_type) in column_types {
        match column_type {
            ColumnType::Text => {
                out.insert(
                    column.clone(),
                    mode_of(rows.iter().filter_map(|row| row.get(column))),
                );
            }
            ColumnType::Numeric | ColumnType::Percentage => {
                let op = resolver.resolve(column, *column_type);
                let values: Vec<f64> = rows
                    .iter()
                    .filter_map(|row| row.get(column).and_then(cell_f64))
                    .collect();
                out.insert(column.clone(), aggregate_numeric(&values, op));
                ops.insert(column.clone(), op);
            }
        }
    }

    (out, ops)
}

/// Partitions row indices by key, keeping groups in first-appearance order.
pub fn partition<K, F>(count: usize, mut key_of: F) -> Vec<(K, Vec<usize>)>
where
    K: Eq + Hash + Clone,
    F: FnMut(usize) -> Option<K>,
{
    let mut positions: HashMap<K, usize> = HashMap::new();
    let mut groups: Vec<(K, Vec<usize>)> = Vec::new();
    for index in 0..count {
        let Some(key) = key_of(index) else {
            continue;
        };
        match positions.get(&key) {
            Some(&position) => groups[position].1.push(index),
            None => {
                positions.insert(key.clone(), groups.len());
                groups.push((key, vec![index]));
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_guess_resolves_by_column_type() {
        let explicit = BTreeMap::new();
        let calculated = HashMap::new();
        let resolver = OpResolver {
            explicit: &explicit,
            calculated: &calculated,
            default: AggregationOp::Guess,
        };
        assert_eq!(
            resolver.resolve("turnout", ColumnType::Percentage),
            AggregationOp::Mean
        );
        assert_eq!(resolver.resolve("votes", ColumnType::Numeric), AggregationOp::Sum);
    }

    #[test]
    fn test_op_priority() {
        let explicit = BTreeMap::from([("a".to_string(), AggregationOp::Max)]);
        let calculated = HashMap::from([
            ("a".to_string(), AggregationOp::Min),
            ("b".to_string(), AggregationOp::Min),
            ("c".to_string(), AggregationOp::Guess),
        ]);
        let resolver = OpResolver {
            explicit: &explicit,
            calculated: &calculated,
            default: AggregationOp::Count,
        };
        assert_eq!(resolver.resolve("a", ColumnType::Numeric), AggregationOp::Max);
        assert_eq!(resolver.resolve("b", ColumnType::Numeric), AggregationOp::Min);
        assert_eq!(resolver.resolve("c", ColumnType::Percentage), AggregationOp::Count);
    }

    #[test]
    fn test_mode_prefers_first_seen_on_tie() {
        let values = [json!("lab"), json!("con"), json!(null), json!("con"), json!("lab")];
        assert_eq!(mode_of(values.iter()), json!("lab"));
        let values = [json!("grn"), json!("con"), json!("con")];
        assert_eq!(mode_of(values.iter()), json!("con"));
        assert_eq!(mode_of([json!(null)].iter()), Value::Null);
    }

    #[test]
    fn test_aggregate_numeric_verbs() {
        let values = [1.0, 2.0, 6.0];
        assert_eq!(aggregate_numeric(&values, AggregationOp::Sum), json!(9.0));
        assert_eq!(aggregate_numeric(&values, AggregationOp::Mean), json!(3.0));
        assert_eq!(aggregate_numeric(&values, AggregationOp::Max), json!(6.0));
        assert_eq!(aggregate_numeric(&values, AggregationOp::Min), json!(1.0));
        assert_eq!(aggregate_numeric(&values, AggregationOp::Count), json!(3));
        assert_eq!(aggregate_numeric(&[], AggregationOp::Mean), Value::Null);
        assert_eq!(aggregate_numeric(&[], AggregationOp::Count), json!(0));
    }

    #[test]
    fn test_partition_keeps_first_appearance_order() {
        let keys = ["b", "a", "b", "", "a"];
        let groups = partition(keys.len(), |i| {
            (!keys[i].is_empty()).then(|| keys[i].to_string())
        });
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], ("b".to_string(), vec![0, 2]));
        assert_eq!(groups[1], ("a".to_string(), vec![1, 4]));
    }
}
