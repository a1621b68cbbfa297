//! Per-batch memoising context.
//!
//! A `Loaders` value is created at the start of one batch, passed by reference
//! to every `geocode_record` call in that batch and dropped at the end.
//! Concurrent requests for the same key share a single backend call. Errors are
//! never cached, so a failed lookup is retried by the next record that asks.

use crate::area_store::{AreaLookup, AreaQuery, PgAreaStore};
use crate::config::Config;
use crate::db_storage::{PgRecordStore, RecordStore};
use crate::errors::AppError;
use crate::models::{Area, AreaTypeFilter, Coordinates, GeocodeResult, PostcodeData};
use crate::services::{
    http_client, AddressGeocoder, AddressResult, BulkReverseService, GoogleGeocodingService,
    MapItService, PostcodeDataService, PostcodeFinder, PostcodesIoService, ReverseGeocoder,
};
use moka::future::Cache;
use sqlx::PgPool;
use std::sync::Arc;

const BATCH_CACHE_CAPACITY: u64 = 10_000;

/// The collaborators a batch talks to.
#[derive(Clone)]
pub struct Backends {
    pub areas: Arc<dyn AreaLookup>,
    pub postcodes: Arc<dyn PostcodeDataService>,
    pub bulk_reverse: Arc<dyn ReverseGeocoder>,
    pub postcode_finder: Arc<dyn PostcodeFinder>,
    pub address: Arc<dyn AddressGeocoder>,
    pub records: Arc<dyn RecordStore>,
}

impl Backends {
    /// Production wiring: Postgres stores plus the public HTTP services.
    pub fn from_config(config: &Config, pool: PgPool) -> Result<Self, AppError> {
        let client = http_client(config.http_timeout())?;
        Ok(Self {
            areas: Arc::new(PgAreaStore::new(pool.clone())),
            postcodes: Arc::new(PostcodesIoService::from_config(client.clone(), config)),
            bulk_reverse: Arc::new(BulkReverseService::from_config(client.clone(), config)),
            postcode_finder: Arc::new(MapItService::from_config(client.clone(), config)),
            address: Arc::new(GoogleGeocodingService::from_config(client, config)),
            records: Arc::new(PgRecordStore::new(pool)),
        })
    }
}

fn unshare(error: Arc<AppError>) -> AppError {
    (*error).clone()
}

pub struct Loaders {
    backends: Backends,
    postcodes: Cache<String, Option<PostcodeData>>,
    point_reverse: Cache<String, Option<PostcodeData>>,
    bulk_reverse: Cache<String, Option<PostcodeData>>,
    example_postcodes: Cache<String, Option<String>>,
    nearest_postcodes: Cache<String, Option<String>>,
    areas_by_code: Cache<String, Option<Area>>,
    areas_by_name: Cache<String, Option<Area>>,
    addresses: Cache<String, Option<AddressResult>>,
}

impl Loaders {
    pub fn new(backends: Backends) -> Self {
        Self {
            backends,
            postcodes: Cache::new(BATCH_CACHE_CAPACITY),
            point_reverse: Cache::new(BATCH_CACHE_CAPACITY),
            bulk_reverse: Cache::new(BATCH_CACHE_CAPACITY),
            example_postcodes: Cache::new(BATCH_CACHE_CAPACITY),
            nearest_postcodes: Cache::new(BATCH_CACHE_CAPACITY),
            areas_by_code: Cache::new(BATCH_CACHE_CAPACITY),
            areas_by_name: Cache::new(BATCH_CACHE_CAPACITY),
            addresses: Cache::new(BATCH_CACHE_CAPACITY),
        }
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// Forward resolution through the primary postcode service.
    pub async fn postcode(&self, postcode: &str) -> Result<Option<PostcodeData>, AppError> {
        let key = postcode.trim().to_ascii_uppercase().replace(' ', "");
        let service = self.backends.postcodes.clone();
        let postcode = postcode.trim().to_string();
        self.postcodes
            .try_get_with(key, async move { service.resolve(&postcode).await })
            .await
            .map_err(unshare)
    }

    /// Primary service's nearest-postcode lookup.
    pub async fn reverse_point(&self, point: Coordinates) -> Result<Option<PostcodeData>, AppError> {
        let service = self.backends.postcodes.clone();
        self.point_reverse
            .try_get_with(point.cache_key(), async move { service.reverse(point).await })
            .await
            .map_err(unshare)
    }

    pub async fn bulk_reverse(&self, point: Coordinates) -> Result<Option<PostcodeData>, AppError> {
        let service = self.backends.bulk_reverse.clone();
        self.bulk_reverse
            .try_get_with(point.cache_key(), async move { service.reverse(point).await })
            .await
            .map_err(unshare)
    }

    pub async fn example_postcode(&self, gss: &str) -> Result<Option<String>, AppError> {
        let service = self.backends.postcode_finder.clone();
        let gss = gss.trim().to_string();
        self.example_postcodes
            .try_get_with(gss.to_ascii_uppercase(), async move {
                service.example_postcode_for_area(&gss).await
            })
            .await
            .map_err(unshare)
    }

    pub async fn nearest_postcode(&self, point: Coordinates) -> Result<Option<String>, AppError> {
        let service = self.backends.postcode_finder.clone();
        self.nearest_postcodes
            .try_get_with(point.cache_key(), async move {
                service.postcode_for_point(point).await
            })
            .await
            .map_err(unshare)
    }

    pub async fn area_by_code(
        &self,
        code: &str,
        area_types: &AreaTypeFilter,
    ) -> Result<Option<Area>, AppError> {
        let key = format!("{}#{}", code.trim().to_lowercase(), area_types.cache_key());
        let areas = self.backends.areas.clone();
        let code = code.to_string();
        let area_types = area_types.clone();
        self.areas_by_code
            .try_get_with(key, async move { areas.find_by_code(&code, &area_types).await })
            .await
            .map_err(unshare)
    }

    pub async fn area_by_name(&self, query: &AreaQuery<'_>) -> Result<Option<Area>, AppError> {
        self.areas_by_name
            .try_get_with(query.cache_key(), self.backends.areas.find_by_name_fuzzy(query))
            .await
            .map_err(unshare)
    }

    pub async fn address(
        &self,
        query: &str,
        country_hints: &[String],
    ) -> Result<Option<AddressResult>, AppError> {
        let key = format!("{}#{}", query.to_lowercase(), country_hints.join(","));
        self.addresses
            .try_get_with(key, self.backends.address.geocode(query, country_hints))
            .await
            .map_err(unshare)
    }

    /// Previous stored result for change detection. Not memoised: each record
    /// is read once per batch.
    pub async fn previous_result(
        &self,
        record_id: &str,
    ) -> Result<Option<GeocodeResult>, AppError> {
        self.backends.records.get_previous_result(record_id).await
    }
}
