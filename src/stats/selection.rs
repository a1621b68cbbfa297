use super::SpatialMode;
use crate::geometry::{polygon_contains_point, polygon_within};
use crate::models::{AnalyticalAreaType, Area, EnrichedRecord};

fn gss_eq(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

fn assigned_to(record: &EnrichedRecord, target: &Area) -> bool {
    gss_eq(
        record.area.as_ref().and_then(|a| a.gss.as_deref()),
        target.gss.as_deref(),
    )
}

/// The record's cached postcode-level code for the target's area type
/// equals the target's code.
fn cached_code_matches(record: &EnrichedRecord, target: &Area) -> bool {
    let cached = AnalyticalAreaType::from_area_type_code(&target.area_type)
        .zip(record.postcode_data.as_ref())
        .and_then(|(area_type, data)| area_type.code_in(data));
    gss_eq(cached, target.gss.as_deref())
}

fn area_within_target(record: &EnrichedRecord, target: &Area) -> bool {
    match (
        record.area.as_ref().and_then(|a| a.polygon.as_ref()),
        target.polygon.as_ref(),
    ) {
        (Some(own), Some(target_polygon)) => polygon_within(own, target_polygon),
        _ => false,
    }
}

fn target_within_area(record: &EnrichedRecord, target: &Area) -> bool {
    match (
        record.area.as_ref().and_then(|a| a.polygon.as_ref()),
        target.polygon.as_ref(),
    ) {
        (Some(own), Some(target_polygon)) => polygon_within(target_polygon, own),
        _ => false,
    }
}

fn point_within(record: &EnrichedRecord, target: &Area) -> bool {
    record.area.is_none()
        && match (record.point, target.polygon.as_ref()) {
            (Some(point), Some(polygon)) => polygon_contains_point(polygon, point),
            _ => false,
        }
}

pub fn matches(record: &EnrichedRecord, target: &Area, mode: SpatialMode) -> bool {
    match mode {
        SpatialMode::PointsWithin => point_within(record, target),
        SpatialMode::Area => assigned_to(record, target),
        SpatialMode::AreaOrChildren => {
            assigned_to(record, target)
                || (cached_code_matches(record, target) && area_within_target(record, target))
        }
        SpatialMode::AreaOrParents => {
            assigned_to(record, target)
                || (cached_code_matches(record, target) && target_within_area(record, target))
        }
        SpatialMode::Overlapping => {
            assigned_to(record, target)
                || cached_code_matches(record, target)
                || area_within_target(record, target)
                || target_within_area(record, target)
        }
    }
}

/// Records that satisfy `mode` for at least one target.
pub fn select_records<'a>(
    records: &'a [EnrichedRecord],
    mode: SpatialMode,
    targets: &[Area],
) -> Vec<&'a EnrichedRecord> {
    records
        .iter()
        .filter(|record| targets.iter().any(|target| matches(record, target, mode)))
        .collect()
}
