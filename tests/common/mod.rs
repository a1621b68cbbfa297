#![allow(dead_code)]

use async_trait::async_trait;
use civic_geo_hub::area_store::InMemoryAreaIndex;
use civic_geo_hub::db_storage::{InMemoryRecordStore, RecordStore};
use civic_geo_hub::errors::AppError;
use civic_geo_hub::geometry::BoundingBox;
use civic_geo_hub::loaders::Backends;
use civic_geo_hub::models::{
    Area, Coordinates, EnrichedRecord, GeocodeResult, PostcodeCodes, PostcodeData, SourceRecord,
};
use civic_geo_hub::services::{
    AddressGeocoder, AddressResult, PostcodeDataService, PostcodeFinder, ReverseGeocoder,
};
use geo::{polygon, MultiPolygon};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub fn square(lng: f64, lat: f64, size: f64) -> MultiPolygon<f64> {
    MultiPolygon(vec![polygon![
        (x: lng, y: lat),
        (x: lng + size, y: lat),
        (x: lng + size, y: lat + size),
        (x: lng, y: lat + size),
        (x: lng, y: lat),
    ]])
}

pub fn area(
    id: i64,
    gss: &str,
    name: &str,
    area_type: &str,
    generation_high: i32,
    polygon: MultiPolygon<f64>,
) -> Area {
    Area {
        id,
        gss: Some(gss.to_string()),
        name: name.to_string(),
        area_type: area_type.to_string(),
        mapit_type: None,
        mapit_generation_low: Some(1),
        mapit_generation_high: Some(generation_high),
        polygon: Some(polygon),
        point: None,
    }
}

pub fn barnsley() -> Area {
    area(1, "E08000016", "Barnsley Council", "STC", 50, square(-1.6, 53.5, 0.2))
}

pub fn st_helens_barnsley() -> Area {
    area(2, "E05000993", "St Helens", "WD23", 50, square(-1.55, 53.52, 0.05))
}

/// Same-named ward in Merseyside, outside Barnsley.
pub fn st_helens_merseyside() -> Area {
    area(3, "E05000999", "St Helens", "WD23", 50, square(-2.8, 53.4, 0.1))
}

/// Abolished council; its boundary only exists in an old generation.
pub fn ryedale() -> Area {
    area(4, "E07000167", "Ryedale", "DIS", 40, square(-1.1, 54.1, 0.4))
}

pub fn amotherby() -> Area {
    area(
        5,
        "E05014252",
        "Amotherby & Ampleforth",
        "WD23",
        55,
        square(-1.0, 54.15, 0.1),
    )
}

pub fn amotherby_decoy() -> Area {
    area(
        6,
        "E05099999",
        "Amotherby & Ampleforth",
        "WD23",
        60,
        square(1.0, 52.0, 0.1),
    )
}

pub fn fixture_areas() -> Vec<Area> {
    vec![
        barnsley(),
        st_helens_barnsley(),
        st_helens_merseyside(),
        ryedale(),
        amotherby(),
        amotherby_decoy(),
    ]
}

pub fn postcode(code: &str, district: &str, district_gss: &str, ward_gss: &str) -> PostcodeData {
    PostcodeData {
        postcode: code.to_string(),
        latitude: Some(53.55),
        longitude: Some(-1.52),
        country: Some("England".to_string()),
        admin_district: Some(district.to_string()),
        codes: PostcodeCodes {
            admin_district: Some(district_gss.to_string()),
            admin_ward: Some(ward_gss.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn s70() -> PostcodeData {
    postcode("S70 2TA", "Barnsley", "E08000016", "E05000993")
}

pub fn record(id: &str, json: Value) -> SourceRecord {
    SourceRecord {
        id: id.to_string(),
        source_id: Some("source-1".to_string()),
        json: json.as_object().cloned().unwrap_or_else(Map::new),
    }
}

// ============ Mock backends ============

/// Primary service: forward lookups from a table, reverse lookups fixed.
#[derive(Default)]
pub struct MockPostcodes {
    pub table: HashMap<String, PostcodeData>,
    pub reverse_result: Option<PostcodeData>,
    pub fail_reverse: bool,
    pub resolve_calls: AtomicUsize,
    pub reverse_calls: AtomicUsize,
}

impl MockPostcodes {
    pub fn with(entries: Vec<PostcodeData>) -> Self {
        Self {
            table: entries
                .into_iter()
                .map(|p| (p.postcode.replace(' ', "").to_uppercase(), p))
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PostcodeDataService for MockPostcodes {
    fn service_name(&self) -> &'static str {
        "mock postcodes"
    }

    async fn resolve(&self, postcode: &str) -> Result<Option<PostcodeData>, AppError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .table
            .get(&postcode.replace(' ', "").to_uppercase())
            .cloned())
    }

    async fn reverse(&self, _point: Coordinates) -> Result<Option<PostcodeData>, AppError> {
        self.reverse_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_reverse {
            return Err(AppError::ExternalApiError("primary reverse down".into()));
        }
        Ok(self.reverse_result.clone())
    }
}

#[derive(Default)]
pub struct MockBulkReverse {
    pub result: Option<PostcodeData>,
    pub fail: bool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl ReverseGeocoder for MockBulkReverse {
    fn service_name(&self) -> &'static str {
        "mock bulk"
    }

    async fn reverse(&self, _point: Coordinates) -> Result<Option<PostcodeData>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AppError::ExternalApiError("bulk reverse down".into()));
        }
        Ok(self.result.clone())
    }
}

#[derive(Default)]
pub struct MockFinder {
    pub examples: HashMap<String, String>,
    pub nearest: Option<String>,
    pub calls: AtomicUsize,
}

#[async_trait]
impl PostcodeFinder for MockFinder {
    fn service_name(&self) -> &'static str {
        "mock finder"
    }

    async fn example_postcode_for_area(&self, gss: &str) -> Result<Option<String>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.examples.get(gss).cloned())
    }

    async fn postcode_for_point(&self, _point: Coordinates) -> Result<Option<String>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.nearest.clone())
    }
}

#[derive(Default)]
pub struct MockAddress {
    pub result: Option<AddressResult>,
    pub queries: std::sync::Mutex<Vec<(String, Vec<String>)>>,
}

#[async_trait]
impl AddressGeocoder for MockAddress {
    fn service_name(&self) -> &'static str {
        "mock address"
    }

    async fn geocode(
        &self,
        query: &str,
        country_hints: &[String],
    ) -> Result<Option<AddressResult>, AppError> {
        if let Ok(mut queries) = self.queries.lock() {
            queries.push((query.to_string(), country_hints.to_vec()));
        }
        Ok(self.result.clone())
    }
}

/// Record store whose reads always fail.
#[derive(Default)]
pub struct BrokenReadStore {
    pub inner: InMemoryRecordStore,
}

#[async_trait]
impl RecordStore for BrokenReadStore {
    async fn get_previous_result(
        &self,
        _record_id: &str,
    ) -> Result<Option<GeocodeResult>, AppError> {
        Err(AppError::InternalError("store unavailable".into()))
    }

    async fn save_result(
        &self,
        record: &SourceRecord,
        result: &GeocodeResult,
    ) -> Result<(), AppError> {
        self.inner.save_result(record, result).await
    }

    async fn records_for_sources(
        &self,
        source_ids: &[String],
        bbox: Option<&BoundingBox>,
    ) -> Result<Vec<EnrichedRecord>, AppError> {
        self.inner.records_for_sources(source_ids, bbox).await
    }
}

/// Store whose writes always fail.
#[derive(Default)]
pub struct BrokenWriteStore {
    pub inner: InMemoryRecordStore,
}

#[async_trait]
impl RecordStore for BrokenWriteStore {
    async fn get_previous_result(
        &self,
        record_id: &str,
    ) -> Result<Option<GeocodeResult>, AppError> {
        self.inner.get_previous_result(record_id).await
    }

    async fn save_result(
        &self,
        _record: &SourceRecord,
        _result: &GeocodeResult,
    ) -> Result<(), AppError> {
        Err(AppError::InternalError("disk full".into()))
    }

    async fn records_for_sources(
        &self,
        source_ids: &[String],
        bbox: Option<&BoundingBox>,
    ) -> Result<Vec<EnrichedRecord>, AppError> {
        self.inner.records_for_sources(source_ids, bbox).await
    }
}

/// Handles on every mock so tests can assert on call counts.
pub struct Mocks {
    pub postcodes: Arc<MockPostcodes>,
    pub bulk: Arc<MockBulkReverse>,
    pub finder: Arc<MockFinder>,
    pub address: Arc<MockAddress>,
    pub records: Arc<dyn RecordStore>,
}

impl Mocks {
    /// Primary reverse answers with S70 2TA for every point.
    pub fn healthy() -> Self {
        Self {
            postcodes: Arc::new(MockPostcodes {
                reverse_result: Some(s70()),
                ..MockPostcodes::with(vec![s70()])
            }),
            bulk: Arc::new(MockBulkReverse::default()),
            finder: Arc::new(MockFinder::default()),
            address: Arc::new(MockAddress::default()),
            records: Arc::new(InMemoryRecordStore::new()),
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            areas: Arc::new(InMemoryAreaIndex::new(fixture_areas())),
            postcodes: self.postcodes.clone(),
            bulk_reverse: self.bulk.clone(),
            postcode_finder: self.finder.clone(),
            address: self.address.clone(),
            records: self.records.clone(),
        }
    }
}
