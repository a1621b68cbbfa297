use crate::errors::{AppError, ResultExt};
use crate::geometry::BoundingBox;
use crate::models::{EnrichedRecord, GeocodeResult, SourceRecord};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Persisted geocoding results, keyed by record id.
///
/// The geocoding core only reads from the store (for change detection); the
/// batch caller writes the result back once `geocode_record` returns.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_previous_result(&self, record_id: &str)
        -> Result<Option<GeocodeResult>, AppError>;

    async fn save_result(
        &self,
        record: &SourceRecord,
        result: &GeocodeResult,
    ) -> Result<(), AppError>;

    /// Every enriched record of the given sources, optionally limited to
    /// records whose point falls inside `bbox`.
    async fn records_for_sources(
        &self,
        source_ids: &[String],
        bbox: Option<&BoundingBox>,
    ) -> Result<Vec<EnrichedRecord>, AppError>;
}

fn in_bbox(record: &EnrichedRecord, bbox: Option<&BoundingBox>) -> bool {
    match bbox {
        None => true,
        Some(bbox) => record.point.is_some_and(|p| bbox.contains(p)),
    }
}

// ============ Postgres ============

/// Postgres-backed store.
///
/// Table: `geocoded_records(id text primary key, source_id text not null,
/// json jsonb not null, geocode_result jsonb not null, point_lat double
/// precision, point_lng double precision, updated_at timestamptz not null)`.
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn get_previous_result(
        &self,
        record_id: &str,
    ) -> Result<Option<GeocodeResult>, AppError> {
        let row = sqlx::query("SELECT geocode_result FROM geocoded_records WHERE id = $1")
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load previous geocode result")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let stored: Value = row.try_get("geocode_result")?;
        Ok(Some(serde_json::from_value(stored)?))
    }

    async fn save_result(
        &self,
        record: &SourceRecord,
        result: &GeocodeResult,
    ) -> Result<(), AppError> {
        let source_id = record.source_id.as_deref().ok_or_else(|| {
            AppError::BadRequest(format!("record {} has no source_id", record.id))
        })?;
        let stored = serde_json::to_value(result)?;

        sqlx::query(
            r#"
            INSERT INTO geocoded_records
                (id, source_id, json, geocode_result, point_lat, point_lng, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                source_id = EXCLUDED.source_id,
                json = EXCLUDED.json,
                geocode_result = EXCLUDED.geocode_result,
                point_lat = EXCLUDED.point_lat,
                point_lng = EXCLUDED.point_lng,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.id)
        .bind(source_id)
        .bind(Value::Object(record.json.clone()))
        .bind(stored)
        .bind(result.point.map(|p| p.lat))
        .bind(result.point.map(|p| p.lng))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save geocode result for record {}", record.id))?;

        tracing::debug!("Saved geocode result for record {}", record.id);
        Ok(())
    }

    async fn records_for_sources(
        &self,
        source_ids: &[String],
        bbox: Option<&BoundingBox>,
    ) -> Result<Vec<EnrichedRecord>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_id, geocode_result
            FROM geocoded_records
            WHERE source_id = ANY($1)
              AND ($2::float8 IS NULL OR point_lng BETWEEN $2 AND $4)
              AND ($3::float8 IS NULL OR point_lat BETWEEN $3 AND $5)
            ORDER BY id
            "#,
        )
        .bind(source_ids)
        .bind(bbox.map(|b| b.west))
        .bind(bbox.map(|b| b.south))
        .bind(bbox.map(|b| b.east))
        .bind(bbox.map(|b| b.north))
        .fetch_all(&self.pool)
        .await
        .context("Failed to load records for statistics")?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let source_id: String = row.try_get("source_id")?;
            let stored: Value = row.try_get("geocode_result")?;
            let result: GeocodeResult = serde_json::from_value(stored)
                .map_err(AppError::from)
                .with_context(|| format!("Stored result for record {} is unreadable", id))?;
            records.push(EnrichedRecord::from_result(id, source_id, &result));
        }

        tracing::info!(
            "Loaded {} records from {} source(s)",
            records.len(),
            source_ids.len()
        );
        Ok(records)
    }
}

// ============ In-memory ============

/// Process-local store for tests and single-shot batch runs.
#[derive(Default)]
pub struct InMemoryRecordStore {
    results: RwLock<HashMap<String, (Option<String>, GeocodeResult)>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get_previous_result(
        &self,
        record_id: &str,
    ) -> Result<Option<GeocodeResult>, AppError> {
        Ok(self
            .results
            .read()
            .await
            .get(record_id)
            .map(|(_, result)| result.clone()))
    }

    async fn save_result(
        &self,
        record: &SourceRecord,
        result: &GeocodeResult,
    ) -> Result<(), AppError> {
        self.results.write().await.insert(
            record.id.clone(),
            (record.source_id.clone(), result.clone()),
        );
        Ok(())
    }

    async fn records_for_sources(
        &self,
        source_ids: &[String],
        bbox: Option<&BoundingBox>,
    ) -> Result<Vec<EnrichedRecord>, AppError> {
        let results = self.results.read().await;
        let mut records: Vec<EnrichedRecord> = results
            .iter()
            .filter_map(|(id, (source_id, result))| {
                let source_id = source_id.as_ref()?;
                source_ids
                    .contains(source_id)
                    .then(|| EnrichedRecord::from_result(id.clone(), source_id.clone(), result))
            })
            .filter(|record| in_bbox(record, bbox))
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}
