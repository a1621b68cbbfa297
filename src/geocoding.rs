//! Geocoder dispatcher.
//!
//! Chooses a strategy from the source's geocoding config, skips records whose
//! relevant inputs are unchanged since the last run, and otherwise produces a
//! fresh `GeocodeResult`. Backend failures never escape: the caller always
//! gets a result, with the attempts recorded in `geocode_data.steps`.

use crate::area_resolver::{resolve_area_chain, resolve_area_code};
use crate::enrichment::{postcode_data_for_area, postcode_data_for_point, resolve_postcode};
use crate::errors::AppError;
use crate::geocoding_config::{ComponentType, GeocodingConfig, GeographyType};
use crate::loaders::Loaders;
use crate::models::{
    Area, Coordinates, GeocodeData, GeocodeResult, PostcodeData, RecordedComponent, SourceRecord,
    Step,
};
use crate::stats::typing::parse_and_type_json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

/// Version tag per strategy. Bumping one invalidates every stored result
/// produced by that strategy on the next run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeocoderVersions {
    pub area_name: String,
    pub area_code: String,
    pub address: String,
    pub coordinates: String,
}

impl Default for GeocoderVersions {
    fn default() -> Self {
        Self {
            area_name: "V2".to_string(),
            area_code: "V1".to_string(),
            address: "V1".to_string(),
            coordinates: "V1".to_string(),
        }
    }
}

impl GeocoderVersions {
    /// Label stamped on results, e.g. `AREA_GEOCODER_V2`.
    pub fn label(&self, strategy: Strategy) -> String {
        let version = match strategy {
            Strategy::AreaName => &self.area_name,
            Strategy::AreaCode => &self.area_code,
            Strategy::Address => &self.address,
            Strategy::Coordinates => &self.coordinates,
        };
        format!("{}_{}", strategy.prefix(), version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    AreaCode,
    AreaName,
    Address,
    Coordinates,
}

impl Strategy {
    pub fn select(config: &GeocodingConfig) -> Self {
        match config.geography_type {
            GeographyType::Area => {
                let area_codes = config.components_of(ComponentType::AreaCode).count();
                if area_codes == 1 {
                    Strategy::AreaCode
                } else {
                    Strategy::AreaName
                }
            }
            GeographyType::Address => Strategy::Address,
            GeographyType::Coordinates => Strategy::Coordinates,
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Strategy::AreaCode => "AREA_CODE_GEOCODER",
            Strategy::AreaName => "AREA_GEOCODER",
            Strategy::Address => "ADDRESS_GEOCODER",
            Strategy::Coordinates => "COORDINATE_GEOCODER",
        }
    }
}

/// What a strategy found.
#[derive(Default)]
struct Resolution {
    postcode_data: Option<PostcodeData>,
    area: Option<Area>,
    point: Option<Coordinates>,
}

fn value_set(components: &[RecordedComponent]) -> BTreeSet<String> {
    components.iter().map(|c| c.value.to_string()).collect()
}

/// Splits a `countries` datum into hints: a comma-separated string or a list.
pub fn country_hints(value: &Value) -> Vec<String> {
    let raw: Vec<&str> = match value {
        Value::String(s) => s.split(',').collect(),
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    raw.into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses one coordinate; anything unparsable or non-finite is absent.
pub fn parse_coordinate(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

pub struct Geocoder {
    versions: GeocoderVersions,
}

impl Geocoder {
    pub fn new(versions: GeocoderVersions) -> Self {
        Self { versions }
    }

    pub fn versions(&self) -> &GeocoderVersions {
        &self.versions
    }

    /// Parses a raw `geocoding_config` and geocodes the record with it.
    pub async fn geocode_with_raw_config(
        &self,
        record: &SourceRecord,
        raw_config: &Value,
        loaders: &Loaders,
    ) -> Result<GeocodeResult, AppError> {
        let config = GeocodingConfig::from_value(raw_config)?;
        self.geocode_record(record, &config, loaders).await
    }

    pub async fn geocode_record(
        &self,
        record: &SourceRecord,
        config: &GeocodingConfig,
        loaders: &Loaders,
    ) -> Result<GeocodeResult, AppError> {
        let strategy = Strategy::select(config);
        let label = self.versions.label(strategy);
        let components = config.record_components(&record.json);
        let (parsed_json, column_types) = parse_and_type_json(&record.json);

        if let Some(mut previous) = self
            .unchanged_previous(record, config, &label, &components, loaders)
            .await
        {
            tracing::debug!("Record {} unchanged since last run; skipping", record.id);
            previous.geocode_data.skipped = true;
            previous.json = record.json.clone();
            previous.parsed_json = parsed_json;
            previous.column_types = column_types;
            return Ok(previous);
        }

        let mut steps = Vec::new();
        let resolution = match strategy {
            Strategy::AreaName => {
                let area = resolve_area_chain(config, &record.json, loaders, &mut steps).await;
                Self::from_area(area, loaders, &mut steps).await
            }
            Strategy::AreaCode => {
                let area = match config.component(ComponentType::AreaCode) {
                    Some(component) => {
                        resolve_area_code(component, &record.json, loaders, &mut steps).await
                    }
                    None => None,
                };
                Self::from_area(area, loaders, &mut steps).await
            }
            Strategy::Address => geocode_address(config, &record.json, loaders, &mut steps).await,
            Strategy::Coordinates => {
                geocode_coordinates(config, &record.json, loaders, &mut steps).await
            }
        };

        tracing::info!(
            "Geocoded record {} with {}: postcode {}, {} step(s)",
            record.id,
            label,
            resolution
                .postcode_data
                .as_ref()
                .map(|p| p.postcode.as_str())
                .unwrap_or("none"),
            steps.len()
        );

        Ok(GeocodeResult {
            geocoder: Some(label),
            geocode_data: GeocodeData {
                config: config.snapshot().clone(),
                components,
                steps,
                skipped: false,
            },
            postcode_data: resolution.postcode_data,
            area: resolution.area,
            point: resolution.point,
            json: record.json.clone(),
            parsed_json,
            column_types,
        })
    }

    /// The stored result, if nothing that feeds geocoding has changed.
    async fn unchanged_previous(
        &self,
        record: &SourceRecord,
        config: &GeocodingConfig,
        label: &str,
        components: &[RecordedComponent],
        loaders: &Loaders,
    ) -> Option<GeocodeResult> {
        let previous = match loaders.previous_result(&record.id).await {
            Ok(previous) => previous?,
            Err(e) => {
                tracing::warn!(
                    "Could not load previous result for record {}, recomputing: {}",
                    record.id,
                    e
                );
                return None;
            }
        };

        let unchanged = previous.postcode_data.is_some()
            && previous.geocode_data.config == *config.snapshot()
            && previous.geocoder.as_deref() == Some(label)
            && value_set(&previous.geocode_data.components) == value_set(components);
        unchanged.then_some(previous)
    }

    async fn from_area(
        area: Option<Area>,
        loaders: &Loaders,
        steps: &mut Vec<Step>,
    ) -> Resolution {
        let Some(area) = area else {
            return Resolution::default();
        };
        let postcode_data = postcode_data_for_area(&area, loaders, steps).await;
        Resolution {
            postcode_data,
            point: area.sample_point(),
            area: Some(area),
        }
    }
}

async fn geocode_address(
    config: &GeocodingConfig,
    record: &Map<String, Value>,
    loaders: &Loaders,
    steps: &mut Vec<Step>,
) -> Resolution {
    let text_of = |component_type| {
        config
            .component(component_type)
            .and_then(|c| c.text_value(record))
    };
    let place = text_of(ComponentType::PlaceName);
    let street = text_of(ComponentType::StreetAddress);
    let area_name = text_of(ComponentType::AreaName);
    let dynamic_place = place.is_some()
        && config
            .component(ComponentType::PlaceName)
            .is_some_and(|c| c.is_dynamic());

    // A literal place name alone would geocode the same string for every row.
    if street.is_none() && !dynamic_place {
        tracing::debug!("No street address or per-record place name; not geocoding");
        return Resolution::default();
    }

    let query = [place, street, area_name]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(", ");
    let hints: Vec<String> = config
        .components_of(ComponentType::Countries)
        .flat_map(|c| country_hints(&c.raw_value(record)))
        .collect();

    let service = loaders.backends().address.service_name();
    let search_term = json!({ "query": query, "countries": hints });
    let found = match loaders.address(&query, &hints).await {
        Ok(Some(found)) => {
            steps.push(Step::success(
                "address_geocode",
                service,
                Some(search_term),
                Some(json!({
                    "formatted_address": found.formatted_address,
                    "postal_code": found.postal_code,
                    "point": found.coordinates,
                })),
            ));
            found
        }
        Ok(None) => {
            steps.push(Step::failed("address_geocode", service, Some(search_term), None));
            return Resolution::default();
        }
        Err(e) => {
            tracing::warn!("Address geocoding failed for '{}': {}", query, e);
            steps.push(Step::failed(
                "address_geocode",
                service,
                Some(search_term),
                Some(json!({ "error": e.to_string() })),
            ));
            return Resolution::default();
        }
    };

    if let Some(postal_code) = found.postal_code.as_deref() {
        if let Some(data) = resolve_postcode(postal_code, loaders, steps).await {
            let point = found.coordinates.or_else(|| data.coordinates());
            return Resolution {
                postcode_data: Some(data),
                area: None,
                point,
            };
        }
    }

    match found.coordinates {
        Some(point) => Resolution {
            postcode_data: postcode_data_for_point(point, loaders, steps).await,
            area: None,
            point: Some(point),
        },
        None => Resolution::default(),
    }
}

async fn geocode_coordinates(
    config: &GeocodingConfig,
    record: &Map<String, Value>,
    loaders: &Loaders,
    steps: &mut Vec<Step>,
) -> Resolution {
    let read = |component_type| {
        config
            .component(component_type)
            .and_then(|c| parse_coordinate(&c.raw_value(record)))
    };
    let lat = read(ComponentType::Latitude).filter(|v| (-90.0..=90.0).contains(v));
    let lng = read(ComponentType::Longitude).filter(|v| (-180.0..=180.0).contains(v));

    let (Some(lat), Some(lng)) = (lat, lng) else {
        tracing::debug!("Record has no usable coordinates");
        return Resolution::default();
    };
    let point = Coordinates::new(lat, lng);
    Resolution {
        postcode_data: postcode_data_for_point(point, loaders, steps).await,
        area: None,
        point: Some(point),
    }
}
