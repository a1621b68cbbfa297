use crate::config::Config;
use crate::errors::AppError;
use crate::geocoding::Geocoder;
use crate::geocoding_config::GeocodingConfig;
use crate::loaders::{Backends, Loaders};
use crate::models::{GeocodeResult, SourceRecord};
use crate::stats::{AggregationRequest, StatsEngine, StatsOutput};
use axum::{extract::State, http::StatusCode, Json};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Shared application state injected into handlers.
pub struct AppState {
    pub config: Config,
    pub backends: Backends,
    pub geocoder: Geocoder,
    pub stats: StatsEngine,
}

impl AppState {
    pub fn new(config: Config, backends: Backends) -> Self {
        let geocoder = Geocoder::new(config.geocoder_versions.clone());
        let stats = StatsEngine::from_backends(&backends);
        Self {
            config,
            backends,
            geocoder,
            stats,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GeocodeBatchRequest {
    pub geocoding_config: Value,
    pub records: Vec<SourceRecord>,
}

/// Outcome for one record of a batch. A result that could not be saved is
/// returned together with the save error.
#[derive(Debug, Serialize)]
pub struct RecordOutcome {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<GeocodeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GeocodeBatchResponse {
    pub batch_id: Uuid,
    pub geocoded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub records: Vec<RecordOutcome>,
}

/// Health check endpoint.
pub async fn health() -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "civic-geo-hub",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// POST /api/v1/geocode
///
/// Geocodes a batch of records sharing one `geocoding_config`. All records
/// share a single memoising context, so repeated names, codes and postcodes
/// hit the external services once per batch. Each result is persisted as
/// soon as it is produced.
pub async fn geocode_batch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GeocodeBatchRequest>,
) -> Result<Json<GeocodeBatchResponse>, AppError> {
    let batch_id = Uuid::new_v4();
    let config = GeocodingConfig::from_value(&request.geocoding_config)?;
    tracing::info!(
        "Geocode batch {} started: {} record(s)",
        batch_id,
        request.records.len()
    );

    let loaders = Loaders::new(state.backends.clone());
    let concurrency = state.config.geocode_concurrency.max(1);

    let futures: Vec<_> = request
        .records
        .iter()
        .map(|record| geocode_and_save(&state, record, &config, &loaders))
        .collect();
    let records: Vec<RecordOutcome> = stream::iter(futures)
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let skipped = records
        .iter()
        .filter(|r| r.result.as_ref().is_some_and(|res| res.geocode_data.skipped))
        .count();
    let failed = records.iter().filter(|r| r.error.is_some()).count();
    let geocoded = records.len() - skipped - failed;

    tracing::info!(
        "Geocode batch {} finished: {} geocoded, {} skipped, {} failed",
        batch_id,
        geocoded,
        skipped,
        failed
    );

    Ok(Json(GeocodeBatchResponse {
        batch_id,
        geocoded,
        skipped,
        failed,
        records,
    }))
}

async fn geocode_and_save(
    state: &AppState,
    record: &SourceRecord,
    config: &GeocodingConfig,
    loaders: &Loaders,
) -> RecordOutcome {
    let result = match state.geocoder.geocode_record(record, config, loaders).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("Failed to geocode record {}: {}", record.id, e);
            return RecordOutcome {
                id: record.id.clone(),
                result: None,
                error: Some(e.to_string()),
            };
        }
    };

    let error = if result.geocode_data.skipped {
        None
    } else {
        match state.backends.records.save_result(record, &result).await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(
                    "Failed to save geocode result for record {} (geocoder {:?}, area {:?}, postcode {:?}): {}",
                    record.id,
                    result.geocoder,
                    result.area.as_ref().and_then(|a| a.gss.as_deref()),
                    result.postcode_data.as_ref().map(|p| p.postcode.as_str()),
                    e
                );
                Some(format!("failed to save result: {}", e))
            }
        }
    };

    RecordOutcome {
        id: record.id.clone(),
        result: Some(result),
        error,
    }
}

/// POST /api/v1/statistics
pub async fn statistics(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AggregationRequest>,
) -> Result<Json<StatsOutput>, AppError> {
    tracing::info!(
        "POST /statistics - {} source(s), {} target area(s)",
        request.source_ids.len(),
        request.area_gss.len()
    );
    let output = state.stats.compute(&request).await?;
    Ok(Json(output))
}
