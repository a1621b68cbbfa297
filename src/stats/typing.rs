//! Column type inference and coercion.
//!
//! A column is a percentage column when every non-null value looks like
//! `42%`, numeric when every non-null value is a number or a number-looking
//! string, and text otherwise. Percentages are stored as fractions of one.

use crate::models::ColumnType;
use regex::Regex;
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

static PERCENTAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([-+]?(?:\d+(?:\.\d*)?|\.\d+))\s*%\s*$").expect("valid percentage regex")
});
static NUMERIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-+]?(?:\d{1,3}(?:,\d{3})+|\d+)?(?:\.\d+)?(?:[eE][-+]?\d+)?\s*$")
        .expect("valid numeric regex")
});

/// Decimal places kept when rendering numbers back to text.
const DISPLAY_PRECISION: f64 = 1e10;

pub fn parse_percentage(raw: &str) -> Option<f64> {
    let captures = PERCENTAGE.captures(raw)?;
    captures[1].parse::<f64>().ok().map(|v| v / 100.0)
}

pub fn parse_numeric(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !NUMERIC.is_match(trimmed) {
        return None;
    }
    trimmed.replace(',', "").parse::<f64>().ok()
}

/// Wraps a float as JSON; NaN and infinities become null.
pub fn number_value(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

/// Reads a typed cell as a float. Null and non-numeric cells are `None`.
pub fn cell_f64(value: &Value) -> Option<f64> {
    value.as_f64().filter(|v| v.is_finite())
}

fn infer(values: &[&Value]) -> ColumnType {
    let present: Vec<&Value> = values.iter().copied().filter(|v| !v.is_null()).collect();
    if present.is_empty() {
        return ColumnType::Text;
    }
    let all_percent = present
        .iter()
        .all(|v| v.as_str().and_then(parse_percentage).is_some());
    if all_percent {
        return ColumnType::Percentage;
    }
    let all_numeric = present.iter().all(|v| match v {
        Value::Number(_) => true,
        Value::String(s) => parse_numeric(s).is_some(),
        _ => false,
    });
    if all_numeric {
        ColumnType::Numeric
    } else {
        ColumnType::Text
    }
}

fn coerce(value: &Value, column_type: ColumnType) -> Value {
    match (column_type, value) {
        (_, Value::Null) => Value::Null,
        (ColumnType::Percentage, Value::String(s)) => {
            parse_percentage(s).map(number_value).unwrap_or(Value::Null)
        }
        (ColumnType::Numeric, Value::String(s)) => {
            parse_numeric(s).map(number_value).unwrap_or(Value::Null)
        }
        (ColumnType::Numeric, Value::Number(n)) => n
            .as_f64()
            .map(number_value)
            .unwrap_or_else(|| value.clone()),
        _ => value.clone(),
    }
}

/// Types one record on its own.
pub fn parse_and_type_json(
    json: &Map<String, Value>,
) -> (Map<String, Value>, BTreeMap<String, ColumnType>) {
    let mut parsed = Map::new();
    let mut types = BTreeMap::new();
    for (column, value) in json {
        let column_type = infer(&[value]);
        parsed.insert(column.clone(), coerce(value, column_type));
        types.insert(column.clone(), column_type);
    }
    (parsed, types)
}

/// Types a whole table column by column. Every output row carries every
/// column, null where the source row lacked it.
pub fn type_rows(
    rows: &[Map<String, Value>],
) -> (Vec<Map<String, Value>>, BTreeMap<String, ColumnType>) {
    let columns: BTreeSet<&String> = rows.iter().flat_map(|row| row.keys()).collect();

    let types: BTreeMap<String, ColumnType> = columns
        .iter()
        .map(|column| {
            let values: Vec<&Value> = rows
                .iter()
                .map(|row| row.get(column.as_str()).unwrap_or(&Value::Null))
                .collect();
            ((*column).clone(), infer(&values))
        })
        .collect();

    let typed = rows
        .iter()
        .map(|row| {
            types
                .iter()
                .map(|(column, column_type)| {
                    let value = row.get(column).unwrap_or(&Value::Null);
                    (column.clone(), coerce(value, *column_type))
                })
                .collect()
        })
        .collect();

    (typed, types)
}

/// Renders a float the way a person would write it: at most ten decimal
/// places and no trailing zeros.
pub fn format_number(value: f64) -> String {
    let rounded = (value * DISPLAY_PRECISION).round() / DISPLAY_PRECISION;
    if rounded == 0.0 {
        return "0".to_string();
    }
    format!("{}", rounded)
}

/// Inverse of coercion: percentages become `"42%"`, numbers their plain
/// decimal form, text passes through.
pub fn format_value(value: &Value, column_type: ColumnType) -> Value {
    match (column_type, cell_f64(value)) {
        (ColumnType::Percentage, Some(v)) => Value::String(format!("{}%", format_number(v * 100.0))),
        (ColumnType::Numeric, Some(v)) => Value::String(format_number(v)),
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_percentage_round_trip() {
        let record = json!({"turnout": "42%"});
        let (parsed, types) = parse_and_type_json(record.as_object().unwrap());
        assert_eq!(types["turnout"], ColumnType::Percentage);
        assert_eq!(parsed["turnout"], json!(0.42));
        assert_eq!(
            format_value(&parsed["turnout"], ColumnType::Percentage),
            json!("42%")
        );
    }

    #[test]
    fn test_numeric_strings_are_coerced() {
        assert_eq!(parse_numeric("1,234.5"), Some(1234.5));
        assert_eq!(parse_numeric(" -7 "), Some(-7.0));
        assert_eq!(parse_numeric("1e3"), Some(1000.0));
        assert_eq!(parse_numeric("12a"), None);
        assert_eq!(parse_numeric(""), None);
        assert_eq!(parse_numeric("."), None);
        assert_eq!(parse_percentage("12.5 %"), Some(0.125));
        assert_eq!(parse_percentage("12.5"), None);
    }

    #[test]
    fn test_column_needs_every_value_to_qualify() {
        let rows: Vec<Map<String, Value>> = vec![
            json!({"a": "10%", "b": "3", "c": "x"}),
            json!({"a": "20%", "b": 4, "c": "5"}),
            json!({"a": null, "b": "n/a"}),
        ]
        .into_iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect();

        let (typed, types) = type_rows(&rows);
        assert_eq!(types["a"], ColumnType::Percentage);
        assert_eq!(types["b"], ColumnType::Text);
        assert_eq!(types["c"], ColumnType::Text);
        assert_eq!(typed[1]["a"], json!(0.2));
        assert_eq!(typed[2]["c"], Value::Null);
        assert_eq!(typed[0]["b"], json!("3"));
    }

    #[test]
    fn test_format_number_trims_float_noise() {
        assert_eq!(format_number(0.1 + 0.2), "0.3");
        assert_eq!(format_number(42.0), "42");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(number_value(f64::NAN), Value::Null);
    }
}
