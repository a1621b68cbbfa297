//! Statistics aggregation over enriched records.
//!
//! One request runs these passes in order:
//! select → type → row statistics → calculated columns → group → shape.
//! Everything after selection is pure and works on an in-memory table of
//! JSON rows, see [`compute_from_records`].

pub mod expression;
pub mod grouping;
pub mod row_stats;
pub mod selection;
pub mod typing;

use crate::area_store::AreaLookup;
use crate::db_storage::RecordStore;
use crate::errors::AppError;
use crate::geometry::BoundingBox;
use crate::loaders::Backends;
use crate::models::{AnalyticalAreaType, AreaTypeFilter, Area, ColumnType, EnrichedRecord};
use grouping::{aggregate_group, mode_of, partition, OpResolver};
use row_stats::{add_row_statistics, is_stat_column, STAT_COLUMNS};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use typing::{cell_f64, format_value, number_value, type_rows};

pub type Row = Map<String, Value>;

/// Primitive aggregation verbs plus `Guess`, which defers to the column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum AggregationOp {
    Count,
    Sum,
    Mean,
    Max,
    Min,
    #[default]
    Guess,
}

impl FromStr for AggregationOp {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "count" => Ok(Self::Count),
            "sum" => Ok(Self::Sum),
            "mean" | "avg" | "average" => Ok(Self::Mean),
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            "guess" => Ok(Self::Guess),
            other => Err(format!("unknown aggregation operation '{}'", other)),
        }
    }
}

impl TryFrom<String> for AggregationOp {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpatialMode {
    PointsWithin,
    Area,
    AreaOrChildren,
    AreaOrParents,
    Overlapping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculatedColumn {
    pub name: String,
    pub expression: String,
    #[serde(default)]
    pub aggregation_operation: Option<AggregationOp>,
    #[serde(default)]
    pub is_percentage: bool,
}

/// Requests a choropleth-style wrapper around the result rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresentationRequest {
    pub value_column: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationRequest {
    pub source_ids: Vec<String>,
    /// Target areas for the spatial mode, by GSS code.
    pub area_gss: Vec<String>,
    pub mode: Option<SpatialMode>,
    pub bounding_box: Option<BoundingBox>,
    pub calculated_columns: Vec<CalculatedColumn>,
    /// LIH area-type code to group by, e.g. `WMC23`.
    pub group_by_area: Option<String>,
    pub group_absolutely: bool,
    pub group_by_columns: Vec<String>,
    pub column_operations: BTreeMap<String, AggregationOp>,
    pub aggregation_operation: AggregationOp,
    pub return_numeric_columns_only: bool,
    pub return_columns: Vec<String>,
    pub label_column: Option<String>,
    pub presentation: Option<PresentationRequest>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Grouping<'a> {
    None,
    ByArea(AnalyticalAreaType, &'a str),
    Absolute,
    ByColumns(&'a [String]),
}

impl AggregationRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.source_ids.is_empty() {
            return Err(AppError::BadRequest(
                "at least one source id is required".to_string(),
            ));
        }
        if self.mode.is_some() && self.area_gss.is_empty() {
            return Err(AppError::BadRequest(
                "a spatial mode needs at least one area_gss target".to_string(),
            ));
        }
        self.grouping().map(|_| ())
    }

    fn grouping(&self) -> Result<Grouping<'_>, AppError> {
        let by_columns = !self.group_by_columns.is_empty();
        match (self.group_by_area.as_deref(), self.group_absolutely, by_columns) {
            (None, false, false) => Ok(Grouping::None),
            (Some(code), false, false) => AnalyticalAreaType::from_area_type_code(code)
                .map(|area_type| Grouping::ByArea(area_type, code))
                .ok_or_else(|| {
                    AppError::BadRequest(format!("cannot group by area type '{}'", code))
                }),
            (None, true, false) => Ok(Grouping::Absolute),
            (None, false, true) => Ok(Grouping::ByColumns(&self.group_by_columns)),
            _ => Err(AppError::BadRequest(
                "group_by_area, group_absolutely and group_by_columns are mutually exclusive"
                    .to_string(),
            )),
        }
    }
}

/// One entry of the presentation wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoroplethDatum {
    pub key: String,
    pub label: String,
    pub value: Option<f64>,
    pub is_percentage: bool,
    /// Human-readable value, e.g. `"42%"`.
    pub formatted: Option<String>,
    /// Column holding the row's largest value, when row statistics exist.
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsOutput {
    pub rows: Vec<Row>,
    pub column_types: BTreeMap<String, ColumnType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presentation: Option<Vec<ChoroplethDatum>>,
}

/// Working table: rows plus a stable key and label per row.
struct Table {
    rows: Vec<Row>,
    keys: Vec<String>,
    labels: Vec<Option<String>>,
    column_types: BTreeMap<String, ColumnType>,
}

const GSS_COLUMN: &str = "gss";
const LABEL_COLUMN: &str = "label";

fn value_columns(column_types: &BTreeMap<String, ColumnType>) -> Vec<String> {
    column_types
        .iter()
        .filter(|(column, t)| **t != ColumnType::Text && !is_stat_column(column))
        .map(|(column, _)| column.clone())
        .collect()
}

fn key_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Recomputes row statistics and registers their column types.
fn derive_row_statistics(table: &mut Table) {
    let numeric = value_columns(&table.column_types);
    if numeric.is_empty() {
        return;
    }
    add_row_statistics(&mut table.rows, &numeric);

    let all_percent = numeric
        .iter()
        .all(|c| table.column_types.get(c) == Some(&ColumnType::Percentage));
    for stat in STAT_COLUMNS {
        let stat_type = match stat {
            "first_label" | "second_label" => ColumnType::Text,
            "count" => ColumnType::Numeric,
            _ if all_percent => ColumnType::Percentage,
            _ => ColumnType::Numeric,
        };
        table.column_types.insert(stat.to_string(), stat_type);
    }
}

fn apply_calculated_columns(
    table: &mut Table,
    columns: &[CalculatedColumn],
) -> Result<(), AppError> {
    for calculated in columns {
        for row in table.rows.iter_mut() {
            let value = expression::evaluate(&calculated.expression, row)?;
            row.insert(
                calculated.name.clone(),
                value.map(number_value).unwrap_or(Value::Null),
            );
        }
        let column_type = if calculated.is_percentage {
            ColumnType::Percentage
        } else {
            ColumnType::Numeric
        };
        table.column_types.insert(calculated.name.clone(), column_type);
    }
    Ok(())
}

fn aggregatable_types(column_types: &BTreeMap<String, ColumnType>) -> BTreeMap<String, ColumnType> {
    column_types
        .iter()
        .filter(|(column, _)| !is_stat_column(column))
        .map(|(column, t)| (column.clone(), *t))
        .collect()
}

fn group_table(
    table: Table,
    groups: Vec<(String, Vec<usize>)>,
    resolver: &OpResolver<'_>,
    group_labels: impl Fn(&[usize], &Table) -> Option<String>,
) -> Table {
    let types = aggregatable_types(&table.column_types);
    let mut rows = Vec::with_capacity(groups.len());
    let mut keys = Vec::with_capacity(groups.len());
    let mut labels = Vec::with_capacity(groups.len());
    let mut used_ops: BTreeMap<String, AggregationOp> = BTreeMap::new();

    for (key, members) in groups {
        let member_rows: Vec<&Row> = members.iter().map(|&i| &table.rows[i]).collect();
        let (row, ops) = aggregate_group(&member_rows, &types, resolver);
        used_ops.extend(ops);
        labels.push(group_labels(&members, &table));
        keys.push(key);
        rows.push(row);
    }

    let mut column_types = types;
    for (column, op) in used_ops {
        if op == AggregationOp::Count {
            column_types.insert(column, ColumnType::Numeric);
        }
    }

    Table {
        rows,
        keys,
        labels,
        column_types,
    }
}

fn area_key(
    record: &EnrichedRecord,
    area_type: AnalyticalAreaType,
    code: &str,
) -> Option<(String, Option<String>)> {
    if let Some(data) = record.postcode_data.as_ref() {
        if let Some(gss) = area_type.code_in(data) {
            return Some((gss.to_string(), area_type.label_in(data).map(str::to_string)));
        }
    }
    record
        .area
        .as_ref()
        .filter(|area| area.area_type == code)
        .and_then(|area| area.gss.clone().map(|gss| (gss, Some(area.name.clone()))))
}

fn shape_rows(table: &mut Table, request: &AggregationRequest) {
    let mut identity: Vec<&str> = vec![GSS_COLUMN, LABEL_COLUMN];
    identity.extend(request.group_by_columns.iter().map(String::as_str));

    let keep: Option<Vec<String>> = if request.return_numeric_columns_only {
        Some(
            table
                .column_types
                .iter()
                .filter(|(_, t)| **t != ColumnType::Text)
                .map(|(c, _)| c.clone())
                .collect(),
        )
    } else if !request.return_columns.is_empty() {
        Some(request.return_columns.clone())
    } else {
        None
    };

    if let Some(keep) = keep {
        let retained = |column: &str| keep.iter().any(|k| k == column) || identity.contains(&column);
        for row in table.rows.iter_mut() {
            row.retain(|column, _| retained(column.as_str()));
        }
        table.column_types.retain(|column, _| retained(column.as_str()));
    }
}

fn present(table: &Table, request: &PresentationRequest) -> Result<Vec<ChoroplethDatum>, AppError> {
    let column_type = table
        .column_types
        .get(&request.value_column)
        .copied()
        .ok_or_else(|| {
            AppError::BadRequest(format!(
                "presentation column '{}' is not in the result",
                request.value_column
            ))
        })?;

    Ok(table
        .rows
        .iter()
        .zip(table.keys.iter().zip(table.labels.iter()))
        .map(|(row, (key, label))| {
            let cell = row.get(&request.value_column).unwrap_or(&Value::Null);
            let formatted = match format_value(cell, column_type) {
                Value::String(s) => Some(s),
                Value::Null => None,
                other => Some(other.to_string()),
            };
            ChoroplethDatum {
                key: key.clone(),
                label: label.clone().unwrap_or_else(|| key.clone()),
                value: cell_f64(cell),
                is_percentage: column_type == ColumnType::Percentage,
                formatted,
                category: row
                    .get("first_label")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }
        })
        .collect())
}

/// Runs every pass after loading. `targets` are the resolved `area_gss`
/// areas; `records` are all candidate rows for the request's sources.
pub fn compute_from_records(
    request: &AggregationRequest,
    records: &[EnrichedRecord],
    targets: &[Area],
) -> Result<StatsOutput, AppError> {
    let grouping = request.grouping()?;

    let selected: Vec<&EnrichedRecord> = if request.area_gss.is_empty() {
        records.iter().collect()
    } else {
        let mode = request.mode.unwrap_or(SpatialMode::Area);
        selection::select_records(records, mode, targets)
    };
    tracing::debug!(
        "Selected {} of {} record(s) for aggregation",
        selected.len(),
        records.len()
    );

    let raw: Vec<Row> = selected.iter().map(|r| r.json.clone()).collect();
    let (mut rows, mut column_types) = type_rows(&raw);
    for row in rows.iter_mut() {
        row.retain(|column, _| !is_stat_column(column));
    }
    column_types.retain(|column, _| !is_stat_column(column));

    let mut table = Table {
        rows,
        keys: selected.iter().map(|r| r.id.clone()).collect(),
        labels: vec![None; selected.len()],
        column_types,
    };
    derive_row_statistics(&mut table);

    if !request.calculated_columns.is_empty() {
        apply_calculated_columns(&mut table, &request.calculated_columns)?;
        derive_row_statistics(&mut table);
    }

    let calculated_ops: HashMap<String, AggregationOp> = request
        .calculated_columns
        .iter()
        .filter_map(|c| c.aggregation_operation.map(|op| (c.name.clone(), op)))
        .collect();
    let resolver = OpResolver {
        explicit: &request.column_operations,
        calculated: &calculated_ops,
        default: request.aggregation_operation,
    };

    table = match grouping {
        Grouping::None => table,
        Grouping::Absolute => {
            let members: Vec<usize> = (0..table.rows.len()).collect();
            let groups = if members.is_empty() {
                Vec::new()
            } else {
                vec![("all".to_string(), members)]
            };
            group_table(table, groups, &resolver, |_, _| None)
        }
        Grouping::ByColumns(columns) => {
            let groups = partition(table.rows.len(), |i| {
                let parts: Vec<String> = columns
                    .iter()
                    .map(|c| key_text(table.rows[i].get(c).unwrap_or(&Value::Null)))
                    .collect();
                Some(parts.join(", "))
            });
            // Group columns keep their own value rather than an aggregate.
            let group_values: Vec<Vec<(String, Value)>> = groups
                .iter()
                .map(|(_, members)| {
                    columns
                        .iter()
                        .map(|c| {
                            let value = table.rows[members[0]].get(c).cloned();
                            (c.clone(), value.unwrap_or(Value::Null))
                        })
                        .collect()
                })
                .collect();
            let label_column = request.label_column.as_deref();
            let mut grouped = group_table(table, groups, &resolver, |members, table| {
                let column = label_column?;
                match mode_of(members.iter().filter_map(|&i| table.rows[i].get(column))) {
                    Value::Null => None,
                    value => Some(key_text(&value)),
                }
            });
            for ((row, values), (key, label)) in grouped
                .rows
                .iter_mut()
                .zip(group_values)
                .zip(grouped.keys.iter().zip(grouped.labels.iter_mut()))
            {
                row.extend(values);
                let label = label.get_or_insert_with(|| key.clone());
                row.insert(LABEL_COLUMN.to_string(), Value::String(label.clone()));
            }
            grouped
                .column_types
                .insert(LABEL_COLUMN.to_string(), ColumnType::Text);
            grouped
        }
        Grouping::ByArea(area_type, code) => {
            let area_keys: Vec<Option<(String, Option<String>)>> = selected
                .iter()
                .map(|record| area_key(record, area_type, code))
                .collect();
            let groups = partition(table.rows.len(), |i| {
                area_keys[i].as_ref().map(|(gss, _)| gss.clone())
            });
            let mut grouped = group_table(table, groups, &resolver, |members, _| {
                let labels: Vec<Value> = members
                    .iter()
                    .filter_map(|&i| area_keys[i].as_ref().and_then(|(_, l)| l.clone()))
                    .map(Value::String)
                    .collect();
                match mode_of(labels.iter()) {
                    Value::String(label) => Some(label),
                    _ => None,
                }
            });
            for ((row, key), label) in grouped
                .rows
                .iter_mut()
                .zip(grouped.keys.iter())
                .zip(grouped.labels.iter())
            {
                row.insert(GSS_COLUMN.to_string(), Value::String(key.clone()));
                row.insert(
                    LABEL_COLUMN.to_string(),
                    label.clone().map(Value::String).unwrap_or(Value::Null),
                );
            }
            grouped.column_types.insert(GSS_COLUMN.to_string(), ColumnType::Text);
            grouped
                .column_types
                .insert(LABEL_COLUMN.to_string(), ColumnType::Text);
            grouped
        }
    };

    if grouping != Grouping::None {
        derive_row_statistics(&mut table);
    }

    shape_rows(&mut table, request);

    let presentation = request
        .presentation
        .as_ref()
        .map(|p| present(&table, p))
        .transpose()?;

    Ok(StatsOutput {
        rows: table.rows,
        column_types: table.column_types,
        presentation,
    })
}

pub struct StatsEngine {
    areas: Arc<dyn AreaLookup>,
    records: Arc<dyn RecordStore>,
}

impl StatsEngine {
    pub fn new(areas: Arc<dyn AreaLookup>, records: Arc<dyn RecordStore>) -> Self {
        Self { areas, records }
    }

    pub fn from_backends(backends: &Backends) -> Self {
        Self::new(backends.areas.clone(), backends.records.clone())
    }

    pub async fn compute(&self, request: &AggregationRequest) -> Result<StatsOutput, AppError> {
        request.validate()?;

        let mut targets = Vec::with_capacity(request.area_gss.len());
        for gss in &request.area_gss {
            match self.areas.find_by_code(gss, &AreaTypeFilter::default()).await? {
                Some(area) => targets.push(area),
                None => tracing::warn!("Aggregation target area {} not found", gss),
            }
        }
        if !request.area_gss.is_empty() && targets.is_empty() {
            return Err(AppError::NotFound(format!(
                "no target area matches {}",
                request.area_gss.join(", ")
            )));
        }

        // Widen the box to whole areas so group totals are not clipped.
        let bbox = match (request.bounding_box, request.group_by_area.as_deref()) {
            (Some(bbox), Some(area_type)) => {
                let covering = self.areas.find_intersecting(area_type, &bbox).await?;
                Some(bbox.expand_to_cover(&covering))
            }
            (bbox, _) => bbox,
        };

        let records = self
            .records
            .records_for_sources(&request.source_ids, bbox.as_ref())
            .await?;

        let output = compute_from_records(request, &records, &targets)?;
        tracing::info!(
            "Aggregated {} record(s) into {} row(s)",
            records.len(),
            output.rows.len()
        );
        Ok(output)
    }
}
