mod common;

use civic_geo_hub::area_store::InMemoryAreaIndex;
use civic_geo_hub::db_storage::InMemoryRecordStore;
use civic_geo_hub::enrichment::{postcode_data_for_area, postcode_data_for_point};
use civic_geo_hub::loaders::{Backends, Loaders};
use civic_geo_hub::models::Coordinates;
use civic_geo_hub::services::{
    http_client, AddressGeocoder, BulkReverseService, GoogleGeocodingService, MapItService,
    PostcodeDataService, PostcodesIoService,
};
use common::{fixture_areas, st_helens_barnsley, MockAddress};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn live_backends(server: &MockServer) -> Backends {
    let client = http_client(Duration::from_secs(5)).unwrap();
    Backends {
        areas: Arc::new(InMemoryAreaIndex::new(fixture_areas())),
        postcodes: Arc::new(PostcodesIoService::new(client.clone(), server.uri())),
        bulk_reverse: Arc::new(BulkReverseService::new(client.clone(), server.uri(), 2000)),
        postcode_finder: Arc::new(MapItService::new(client, server.uri(), None)),
        address: Arc::new(MockAddress::default()),
        records: Arc::new(InMemoryRecordStore::new()),
    }
}

fn postcode_body() -> serde_json::Value {
    json!({
        "status": 200,
        "result": {
            "postcode": "S70 2TA",
            "longitude": -1.481,
            "latitude": 53.553,
            "country": "England",
            "admin_district": "Barnsley",
            "admin_ward": "St Helens",
            "parliamentary_constituency_2024": "Barnsley North",
            "codes": {
                "admin_district": "E08000016",
                "admin_ward": "E05000993",
                "parliamentary_constituency_2024": "E14001073"
            }
        }
    })
}

async fn mount_failing_reverse(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/postcodes"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/postcodes"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_fallback_reaches_example_postcode() {
    let server = MockServer::start().await;
    mount_failing_reverse(&server).await;
    Mock::given(method("GET"))
        .and(path("/code/gss/E05000993"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 8834})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/area/8834/example_postcode"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!("S70 2TA")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/postcodes/S70(%20| )2TA$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(postcode_body()))
        .mount(&server)
        .await;

    let loaders = Loaders::new(live_backends(&server));
    let ward = st_helens_barnsley();
    let mut steps = Vec::new();

    let data = postcode_data_for_area(&ward, &loaders, &mut steps)
        .await
        .unwrap();

    assert_eq!(data.postcode, "S70 2TA");
    assert_eq!(data.codes.admin_ward.as_deref(), Some("E05000993"));
    let kinds: Vec<&str> = steps.iter().map(|s| s.step_type.as_str()).collect();
    assert_eq!(
        kinds,
        vec![
            "reverse_geocode",
            "bulk_reverse_geocode",
            "example_postcode",
            "postcode_lookup"
        ]
    );
    assert!(!steps[0].is_success() && !steps[1].is_success());
    assert!(steps[2].is_success() && steps[3].is_success());
    assert_eq!(steps[2].service, "mapit");

    // Same batch, same area: served from the batch cache.
    let mut again = Vec::new();
    let cached = postcode_data_for_area(&ward, &loaders, &mut again).await;
    assert_eq!(cached, Some(data));
}

#[tokio::test]
async fn test_every_backend_failing_yields_none() {
    let server = MockServer::start().await;
    mount_failing_reverse(&server).await;

    let loaders = Loaders::new(live_backends(&server));
    let mut steps = Vec::new();

    let data = postcode_data_for_area(&st_helens_barnsley(), &loaders, &mut steps).await;

    assert!(data.is_none());
    assert_eq!(steps.len(), 4);
    assert!(steps.iter().all(|s| !s.is_success()));
    assert_eq!(steps[3].step_type, "nearest_postcode");
}

#[tokio::test]
async fn test_bulk_reverse_answers_for_point() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/postcodes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": 200,
            "result": [{
                "query": {"longitude": -1.48, "latitude": 53.55},
                "result": [postcode_body()["result"].clone()]
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let loaders = Loaders::new(live_backends(&server));
    let mut steps = Vec::new();

    let data = postcode_data_for_point(Coordinates::new(53.55, -1.48), &loaders, &mut steps)
        .await
        .unwrap();

    assert_eq!(data.admin_district.as_deref(), Some("Barnsley"));
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].step_type, "bulk_reverse_geocode");
}

#[tokio::test]
async fn test_primary_reverse_sends_lon_lat() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/postcodes"))
        .and(query_param("limit", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": 200,
            "result": [postcode_body()["result"].clone()]
        })))
        .mount(&server)
        .await;

    let service = PostcodesIoService::new(http_client(Duration::from_secs(5)).unwrap(), server.uri());
    let data = service
        .reverse(Coordinates::new(53.553, -1.481))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data.postcode, "S70 2TA");
}

#[tokio::test]
async fn test_unknown_postcode_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/postcodes/.+$"))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_json(json!({"status": 404, "error": "Postcode not found"})),
        )
        .mount(&server)
        .await;

    let service = PostcodesIoService::new(http_client(Duration::from_secs(5)).unwrap(), server.uri());
    assert_eq!(service.resolve("ZZ99 9ZZ").await.unwrap(), None);
}

#[tokio::test]
async fn test_google_zero_results_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/maps/api/geocode/json"))
        .and(query_param("components", "country:GB"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"status": "ZERO_RESULTS", "results": []})),
        )
        .mount(&server)
        .await;

    let service = GoogleGeocodingService::new(
        http_client(Duration::from_secs(5)).unwrap(),
        server.uri(),
        Some("test-key".into()),
    );
    let found = service
        .geocode("Nowhere Lane", &["GB".to_string()])
        .await
        .unwrap();
    assert!(found.is_none());
}

#[tokio::test]
async fn test_google_extracts_postal_code_and_location() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/maps/api/geocode/json"))
        .and(query_param("key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "OK",
            "results": [{
                "formatted_address": "1 Church St, Barnsley S70 2TA, UK",
                "address_components": [
                    {"long_name": "Barnsley", "types": ["postal_town"]},
                    {"long_name": "S70 2TA", "types": ["postal_code"]}
                ],
                "geometry": {"location": {"lat": 53.553, "lng": -1.481}}
            }]
        })))
        .mount(&server)
        .await;

    let service = GoogleGeocodingService::new(
        http_client(Duration::from_secs(5)).unwrap(),
        server.uri(),
        Some("test-key".into()),
    );
    let found = service.geocode("1 Church St", &[]).await.unwrap().unwrap();
    assert_eq!(found.postal_code.as_deref(), Some("S70 2TA"));
    assert_eq!(found.coordinates, Some(Coordinates::new(53.553, -1.481)));
}

#[tokio::test]
async fn test_google_denied_is_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/maps/api/geocode/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "REQUEST_DENIED",
            "error_message": "The provided API key is invalid."
        })))
        .mount(&server)
        .await;

    let service = GoogleGeocodingService::new(
        http_client(Duration::from_secs(5)).unwrap(),
        server.uri(),
        Some("bad".into()),
    );
    let err = service.geocode("1 Church St", &[]).await.unwrap_err();
    assert!(err.to_string().contains("REQUEST_DENIED"));

    let unconfigured = GoogleGeocodingService::new(
        http_client(Duration::from_secs(5)).unwrap(),
        server.uri(),
        None,
    );
    assert!(unconfigured.geocode("1 Church St", &[]).await.is_err());
}
