mod common;

use civic_geo_hub::db_storage::{InMemoryRecordStore, RecordStore};
use civic_geo_hub::errors::AppError;
use civic_geo_hub::geocoding::{Geocoder, GeocoderVersions};
use civic_geo_hub::geocoding_config::GeocodingConfig;
use civic_geo_hub::loaders::Loaders;
use civic_geo_hub::models::{ColumnType, Coordinates, SourceRecord};
use civic_geo_hub::services::AddressResult;
use common::{record, s70, BrokenReadStore, MockAddress, MockBulkReverse, Mocks};
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn area_config() -> Value {
    json!({
        "type": "area",
        "components": [
            {"field": "council", "area_type": ["STC", "DIS"]},
            {"field": "ward", "area_type": ["WD23"]}
        ]
    })
}

fn barnsley_record() -> SourceRecord {
    record(
        "rec-1",
        json!({"council": "Barnsley", "ward": "St Helens", "turnout": "42%", "votes": "1,204"}),
    )
}

async fn geocode_and_save(
    geocoder: &Geocoder,
    mocks: &Mocks,
    source: &SourceRecord,
    raw_config: &Value,
) -> civic_geo_hub::models::GeocodeResult {
    let loaders = Loaders::new(mocks.backends());
    let result = geocoder
        .geocode_with_raw_config(source, raw_config, &loaders)
        .await
        .unwrap();
    mocks.records.save_result(source, &result).await.unwrap();
    result
}

#[tokio::test]
async fn test_area_record_end_to_end() {
    let mocks = Mocks::healthy();
    let geocoder = Geocoder::new(GeocoderVersions::default());

    let result = geocode_and_save(&geocoder, &mocks, &barnsley_record(), &area_config()).await;

    assert_eq!(result.geocoder.as_deref(), Some("AREA_GEOCODER_V2"));
    assert_eq!(result.area.as_ref().unwrap().gss.as_deref(), Some("E05000993"));
    assert_eq!(result.postcode_data.as_ref().unwrap().postcode, "S70 2TA");
    assert!(result.point.is_some());
    assert!(!result.geocode_data.skipped);
    assert_eq!(result.geocode_data.config, area_config());
    assert_eq!(result.geocode_data.steps.len(), 3);
    assert_eq!(result.geocode_data.steps[2].step_type, "reverse_geocode");
    assert_eq!(result.geocode_data.components.len(), 2);
    assert_eq!(result.parsed_json["votes"], json!(1204.0));
    assert_eq!(result.column_types["turnout"], ColumnType::Percentage);
}

#[tokio::test]
async fn test_unchanged_record_is_skipped() {
    let mocks = Mocks::healthy();
    let geocoder = Geocoder::new(GeocoderVersions::default());
    let first = geocode_and_save(&geocoder, &mocks, &barnsley_record(), &area_config()).await;
    let calls = mocks.postcodes.reverse_calls.load(Ordering::SeqCst);

    let loaders = Loaders::new(mocks.backends());
    let second = geocoder
        .geocode_with_raw_config(&barnsley_record(), &area_config(), &loaders)
        .await
        .unwrap();

    assert!(second.geocode_data.skipped);
    assert_eq!(second.postcode_data, first.postcode_data);
    assert_eq!(second.geocode_data.steps, first.geocode_data.steps);
    assert_eq!(mocks.postcodes.reverse_calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn test_changed_component_value_recomputes() {
    let mocks = Mocks::healthy();
    let geocoder = Geocoder::new(GeocoderVersions::default());
    geocode_and_save(&geocoder, &mocks, &barnsley_record(), &area_config()).await;

    let moved = record("rec-1", json!({"council": "Ryedale", "ward": "Amotherby & Ampleforth"}));
    let loaders = Loaders::new(mocks.backends());
    let rerun = geocoder
        .geocode_with_raw_config(&moved, &area_config(), &loaders)
        .await
        .unwrap();

    assert!(!rerun.geocode_data.skipped);
    assert_eq!(rerun.area.unwrap().gss.as_deref(), Some("E05014252"));
}

#[tokio::test]
async fn test_non_geographic_change_still_skips() {
    let mocks = Mocks::healthy();
    let geocoder = Geocoder::new(GeocoderVersions::default());
    geocode_and_save(&geocoder, &mocks, &barnsley_record(), &area_config()).await;

    let edited = record(
        "rec-1",
        json!({"council": "Barnsley", "ward": "St Helens", "turnout": "51%"}),
    );
    let loaders = Loaders::new(mocks.backends());
    let rerun = geocoder
        .geocode_with_raw_config(&edited, &area_config(), &loaders)
        .await
        .unwrap();

    assert!(rerun.geocode_data.skipped);
    assert_eq!(rerun.json["turnout"], "51%");
    assert_eq!(rerun.parsed_json["turnout"], json!(0.51));
}

#[tokio::test]
async fn test_version_bump_recomputes() {
    let mocks = Mocks::healthy();
    let v2 = Geocoder::new(GeocoderVersions::default());
    geocode_and_save(&v2, &mocks, &barnsley_record(), &area_config()).await;

    let v3 = Geocoder::new(GeocoderVersions {
        area_name: "V3".into(),
        ..GeocoderVersions::default()
    });
    let loaders = Loaders::new(mocks.backends());
    let rerun = v3
        .geocode_with_raw_config(&barnsley_record(), &area_config(), &loaders)
        .await
        .unwrap();

    assert!(!rerun.geocode_data.skipped);
    assert_eq!(rerun.geocoder.as_deref(), Some("AREA_GEOCODER_V3"));
}

#[tokio::test]
async fn test_config_change_recomputes() {
    let mocks = Mocks::healthy();
    let geocoder = Geocoder::new(GeocoderVersions::default());
    geocode_and_save(&geocoder, &mocks, &barnsley_record(), &area_config()).await;

    let ward_only = json!({
        "type": "area",
        "components": [{"field": "ward", "area_type": ["WD23"]}]
    });
    let loaders = Loaders::new(mocks.backends());
    let rerun = geocoder
        .geocode_with_raw_config(&barnsley_record(), &ward_only, &loaders)
        .await
        .unwrap();

    assert!(!rerun.geocode_data.skipped);
    assert_eq!(rerun.geocode_data.config, ward_only);
}

#[tokio::test]
async fn test_previous_result_without_postcode_data_recomputes() {
    let mocks = Mocks::healthy();
    let geocoder = Geocoder::new(GeocoderVersions::default());
    let empty = record("rec-2", json!({"council": null, "ward": null}));
    let first = geocode_and_save(&geocoder, &mocks, &empty, &area_config()).await;
    assert!(first.postcode_data.is_none());

    let loaders = Loaders::new(mocks.backends());
    let rerun = geocoder
        .geocode_with_raw_config(&empty, &area_config(), &loaders)
        .await
        .unwrap();
    assert!(!rerun.geocode_data.skipped);
}

#[tokio::test]
async fn test_empty_area_record_yields_null_postcode_data() {
    let mocks = Mocks::healthy();
    let geocoder = Geocoder::new(GeocoderVersions::default());
    let loaders = Loaders::new(mocks.backends());

    let result = geocoder
        .geocode_with_raw_config(
            &record("rec-3", json!({"council": null, "ward": null})),
            &area_config(),
            &loaders,
        )
        .await
        .unwrap();

    assert!(result.postcode_data.is_none());
    assert!(result.area.is_none());
    assert!(result.geocode_data.steps.is_empty());
    assert_eq!(mocks.postcodes.reverse_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_config_type_is_fatal() {
    let mocks = Mocks::healthy();
    let geocoder = Geocoder::new(GeocoderVersions::default());
    let loaders = Loaders::new(mocks.backends());

    let err = geocoder
        .geocode_with_raw_config(&barnsley_record(), &json!({"type": "shape"}), &loaders)
        .await
        .unwrap_err();

    assert!(err.is_configuration());
    assert_eq!(
        err.to_string(),
        "Configuration error: geocoding_config is not a valid type"
    );
    assert!(matches!(GeocodingConfig::from_value(&json!({})), Err(AppError::Configuration(_))));
}

#[tokio::test]
async fn test_store_read_failure_recomputes() {
    let mocks = Mocks {
        records: Arc::new(BrokenReadStore::default()),
        ..Mocks::healthy()
    };
    let geocoder = Geocoder::new(GeocoderVersions::default());
    let loaders = Loaders::new(mocks.backends());

    let result = geocoder
        .geocode_with_raw_config(&barnsley_record(), &area_config(), &loaders)
        .await
        .unwrap();

    assert!(!result.geocode_data.skipped);
    assert!(result.postcode_data.is_some());
}

#[tokio::test]
async fn test_address_strategy_resolves_returned_postcode() {
    let address = Arc::new(MockAddress {
        result: Some(AddressResult {
            formatted_address: Some("1 Church St, Barnsley S70 2TA, UK".into()),
            postal_code: Some("S70 2TA".into()),
            coordinates: Some(Coordinates::new(53.553, -1.481)),
        }),
        ..Default::default()
    });
    let mocks = Mocks {
        address: address.clone(),
        ..Mocks::healthy()
    };
    let geocoder = Geocoder::new(GeocoderVersions::default());
    let loaders = Loaders::new(mocks.backends());
    let config = json!({
        "type": "address",
        "components": [
            {"type": "place_name", "field": "branch"},
            {"type": "street_address", "field": "street"},
            {"type": "area_name", "value": "Barnsley"},
            {"type": "countries", "value": ["GB"]}
        ]
    });

    let result = geocoder
        .geocode_with_raw_config(
            &record("shop-1", json!({"branch": "Barclays", "street": "1 Church St"})),
            &config,
            &loaders,
        )
        .await
        .unwrap();

    assert_eq!(result.geocoder.as_deref(), Some("ADDRESS_GEOCODER_V1"));
    assert_eq!(result.postcode_data.unwrap().postcode, "S70 2TA");
    assert_eq!(result.point, Some(Coordinates::new(53.553, -1.481)));
    let queries = address.queries.lock().unwrap();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].0, "Barclays, 1 Church St, Barnsley");
    assert_eq!(queries[0].1, vec!["GB".to_string()]);
}

#[tokio::test]
async fn test_literal_place_name_alone_is_not_geocoded() {
    let mocks = Mocks::healthy();
    let geocoder = Geocoder::new(GeocoderVersions::default());
    let loaders = Loaders::new(mocks.backends());
    let config = json!({
        "type": "address",
        "components": [{"type": "place_name", "value": "Barclays"}]
    });

    let result = geocoder
        .geocode_with_raw_config(&record("shop-2", json!({})), &config, &loaders)
        .await
        .unwrap();

    assert!(result.postcode_data.is_none());
    assert!(result.geocode_data.steps.is_empty());
    assert!(mocks.address.queries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_coordinate_strategy_uses_bulk_reverse() {
    let mocks = Mocks {
        bulk: Arc::new(MockBulkReverse {
            result: Some(s70()),
            ..Default::default()
        }),
        records: Arc::new(InMemoryRecordStore::new()),
        ..Mocks::healthy()
    };
    let geocoder = Geocoder::new(GeocoderVersions::default());
    let loaders = Loaders::new(mocks.backends());
    let config = json!({
        "type": "coordinates",
        "components": [
            {"type": "latitude", "field": "lat"},
            {"type": "longitude", "field": "lng"}
        ]
    });

    let result = geocoder
        .geocode_with_raw_config(
            &record("pt-1", json!({"lat": "53.55", "lng": -1.48})),
            &config,
            &loaders,
        )
        .await
        .unwrap();
    assert_eq!(result.geocoder.as_deref(), Some("COORDINATE_GEOCODER_V1"));
    assert_eq!(result.point, Some(Coordinates::new(53.55, -1.48)));
    assert_eq!(result.postcode_data.unwrap().postcode, "S70 2TA");
    assert_eq!(mocks.postcodes.reverse_calls.load(Ordering::SeqCst), 0);

    let out_of_range = geocoder
        .geocode_with_raw_config(
            &record("pt-2", json!({"lat": 123.0, "lng": -1.48})),
            &config,
            &loaders,
        )
        .await
        .unwrap();
    assert!(out_of_range.point.is_none());
    assert!(out_of_range.geocode_data.steps.is_empty());
}
