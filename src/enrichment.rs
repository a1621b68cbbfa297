//! Postcode-level enrichment chain.
//!
//! Backends are tried in strict priority order and the first hit wins:
//! 1. Primary reverse lookup of the point (postcodes.io)
//! 2. Bulk reverse lookup with a wider radius
//! 3. Tertiary example postcode for the area's GSS code, forward resolved
//! 4. Tertiary nearest postcode to the point, forward resolved
//!
//! Every backend call appends one `Step`. Failures are soft: logged, recorded
//! and followed by the next stage.

use crate::errors::AppError;
use crate::loaders::Loaders;
use crate::models::{Area, Coordinates, PostcodeData, Step};
use serde_json::{json, Value};

fn postcode_summary(data: &PostcodeData) -> Value {
    json!({
        "postcode": data.postcode,
        "admin_district": data.admin_district,
        "parliamentary_constituency_2024": data.parliamentary_constituency_2024,
    })
}

fn point_term(point: Coordinates) -> Value {
    json!({ "lat": point.lat, "lng": point.lng })
}

/// Turns one backend outcome into a `Step`, passing the hit through.
fn record_attempt<T>(
    steps: &mut Vec<Step>,
    step_type: &str,
    service: &str,
    search_term: Value,
    outcome: Result<Option<T>, AppError>,
    describe: impl FnOnce(&T) -> Value,
) -> Option<T> {
    match outcome {
        Ok(Some(found)) => {
            steps.push(Step::success(
                step_type,
                service,
                Some(search_term),
                Some(describe(&found)),
            ));
            Some(found)
        }
        Ok(None) => {
            tracing::debug!("{} via {}: no result for {}", step_type, service, search_term);
            steps.push(Step::failed(step_type, service, Some(search_term), None));
            None
        }
        Err(e) => {
            tracing::warn!("{} via {} failed for {}: {}", step_type, service, search_term, e);
            steps.push(Step::failed(
                step_type,
                service,
                Some(search_term),
                Some(json!({ "error": e.to_string() })),
            ));
            None
        }
    }
}

/// Forward-resolves a postcode through the primary service.
pub async fn resolve_postcode(
    postcode: &str,
    loaders: &Loaders,
    steps: &mut Vec<Step>,
) -> Option<PostcodeData> {
    let service = loaders.backends().postcodes.service_name();
    let outcome = loaders.postcode(postcode).await;
    record_attempt(
        steps,
        "postcode_lookup",
        service,
        json!(postcode),
        outcome,
        postcode_summary,
    )
}

async fn primary_reverse(
    point: Coordinates,
    loaders: &Loaders,
    steps: &mut Vec<Step>,
) -> Option<PostcodeData> {
    let service = loaders.backends().postcodes.service_name();
    let outcome = loaders.reverse_point(point).await;
    record_attempt(
        steps,
        "reverse_geocode",
        service,
        point_term(point),
        outcome,
        postcode_summary,
    )
}

async fn bulk_reverse(
    point: Coordinates,
    loaders: &Loaders,
    steps: &mut Vec<Step>,
) -> Option<PostcodeData> {
    let service = loaders.backends().bulk_reverse.service_name();
    let outcome = loaders.bulk_reverse(point).await;
    record_attempt(
        steps,
        "bulk_reverse_geocode",
        service,
        point_term(point),
        outcome,
        postcode_summary,
    )
}

async fn example_postcode(
    gss: &str,
    loaders: &Loaders,
    steps: &mut Vec<Step>,
) -> Option<PostcodeData> {
    let service = loaders.backends().postcode_finder.service_name();
    let outcome = loaders.example_postcode(gss).await;
    let postcode = record_attempt(
        steps,
        "example_postcode",
        service,
        json!(gss),
        outcome,
        |p: &String| json!({ "postcode": p }),
    )?;
    resolve_postcode(&postcode, loaders, steps).await
}

async fn nearest_postcode(
    point: Coordinates,
    loaders: &Loaders,
    steps: &mut Vec<Step>,
) -> Option<PostcodeData> {
    let service = loaders.backends().postcode_finder.service_name();
    let outcome = loaders.nearest_postcode(point).await;
    let postcode = record_attempt(
        steps,
        "nearest_postcode",
        service,
        point_term(point),
        outcome,
        |p: &String| json!({ "postcode": p }),
    )?;
    resolve_postcode(&postcode, loaders, steps).await
}

/// Full four-stage chain for a resolved area. Stages that need a point or a
/// GSS code the area lacks are not attempted.
pub async fn postcode_data_for_area(
    area: &Area,
    loaders: &Loaders,
    steps: &mut Vec<Step>,
) -> Option<PostcodeData> {
    let point = area.sample_point();

    if let Some(point) = point {
        if let Some(data) = primary_reverse(point, loaders, steps).await {
            return Some(data);
        }
        if let Some(data) = bulk_reverse(point, loaders, steps).await {
            return Some(data);
        }
    }

    if let Some(gss) = area.gss.as_deref() {
        if let Some(data) = example_postcode(gss, loaders, steps).await {
            return Some(data);
        }
    }

    if let Some(point) = point {
        if let Some(data) = nearest_postcode(point, loaders, steps).await {
            return Some(data);
        }
    }

    tracing::info!(
        "No postcode data for area {} ({:?}) after {} attempt(s)",
        area.name,
        area.gss,
        steps.len()
    );
    None
}

/// Chain for a bare point: bulk reverse, then tertiary nearest postcode.
pub async fn postcode_data_for_point(
    point: Coordinates,
    loaders: &Loaders,
    steps: &mut Vec<Step>,
) -> Option<PostcodeData> {
    if let Some(data) = bulk_reverse(point, loaders, steps).await {
        return Some(data);
    }
    if let Some(data) = nearest_postcode(point, loaders, steps).await {
        return Some(data);
    }

    tracing::info!("No postcode data for point {}", point.cache_key());
    None
}
