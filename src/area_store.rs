use crate::area_resolver::{match_key, rank_matches, AreaMatch, SIMILARITY_THRESHOLD};
use crate::errors::{AppError, ResultExt};
use crate::geometry::{multipolygon_from_geojson, point_from_geojson, polygons_intersect, BoundingBox};
use crate::models::{Area, AreaTypeFilter};
use async_trait::async_trait;
use sqlx::{PgPool, Row};

/// One fuzzy area search.
#[derive(Debug, Clone, Copy)]
pub struct AreaQuery<'a> {
    /// Raw value plus its normalised and suffixed variants.
    pub candidates: &'a [String],
    pub area_types: &'a AreaTypeFilter,
    /// Previous hop's match; results must intersect its polygon.
    pub parent: Option<&'a Area>,
}

impl AreaQuery<'_> {
    pub fn cache_key(&self) -> String {
        format!(
            "{}#{}#{}",
            self.candidates.join("|"),
            self.area_types.cache_key(),
            self.parent.map(|p| p.id.to_string()).unwrap_or_default()
        )
    }
}

/// Area lookup collaborator.
#[async_trait]
pub trait AreaLookup: Send + Sync {
    /// Exact, case-insensitive GSS match; the most recent generation wins.
    async fn find_by_code(
        &self,
        code: &str,
        area_types: &AreaTypeFilter,
    ) -> Result<Option<Area>, AppError>;

    /// Best match ranked by `rank_matches`.
    async fn find_by_name_fuzzy(&self, query: &AreaQuery<'_>) -> Result<Option<Area>, AppError>;

    /// Areas of one LIH type whose polygon touches the box.
    async fn find_intersecting(
        &self,
        area_type: &str,
        bbox: &BoundingBox,
    ) -> Result<Vec<Area>, AppError>;
}

// ============ In-memory ============

/// Area index held in memory, for small boundary sets and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAreaIndex {
    areas: Vec<Area>,
}

impl InMemoryAreaIndex {
    pub fn new(areas: Vec<Area>) -> Self {
        Self { areas }
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    fn within_parent(area: &Area, parent: Option<&Area>) -> bool {
        match (parent.and_then(|p| p.polygon.as_ref()), area.polygon.as_ref()) {
            (Some(parent_polygon), Some(polygon)) => polygons_intersect(polygon, parent_polygon),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

#[async_trait]
impl AreaLookup for InMemoryAreaIndex {
    async fn find_by_code(
        &self,
        code: &str,
        area_types: &AreaTypeFilter,
    ) -> Result<Option<Area>, AppError> {
        let code = code.trim();
        Ok(self
            .areas
            .iter()
            .filter(|a| area_types.accepts(a))
            .filter(|a| a.gss.as_deref().is_some_and(|g| g.eq_ignore_ascii_case(code)))
            .max_by_key(|a| a.mapit_generation_high)
            .cloned())
    }

    async fn find_by_name_fuzzy(&self, query: &AreaQuery<'_>) -> Result<Option<Area>, AppError> {
        let matches: Vec<AreaMatch> = self
            .areas
            .iter()
            .filter(|a| query.area_types.accepts(a))
            .filter(|a| Self::within_parent(a, query.parent))
            .filter_map(|a| AreaMatch::score(a, query.candidates))
            .collect();

        Ok(rank_matches(matches).into_iter().next().map(|m| m.area))
    }

    async fn find_intersecting(
        &self,
        area_type: &str,
        bbox: &BoundingBox,
    ) -> Result<Vec<Area>, AppError> {
        Ok(self
            .areas
            .iter()
            .filter(|a| a.area_type == area_type)
            .filter(|a| a.polygon.as_ref().is_some_and(|p| bbox.intersects_polygon(p)))
            .cloned()
            .collect())
    }
}

// ============ Postgres ============

/// Areas table backed by PostGIS, pg_trgm and unaccent.
///
/// Expected shape: `areas(id bigint, gss text, name text, area_type text,
/// mapit_type text, mapit_generation_low int, mapit_generation_high int,
/// polygon geometry(MultiPolygon, 4326), point geometry(Point, 4326))`.
#[derive(Clone)]
pub struct PgAreaStore {
    pool: PgPool,
}

const AREA_COLUMNS: &str = "a.id, a.gss, a.name, a.area_type, a.mapit_type, \
     a.mapit_generation_low, a.mapit_generation_high, \
     ST_AsGeoJSON(a.polygon) AS polygon, ST_AsGeoJSON(a.point) AS point";

const TYPE_FILTER: &str = "((cardinality($1::text[]) = 0 AND cardinality($2::text[]) = 0) \
     OR a.area_type = ANY($1) OR a.mapit_type = ANY($2))";

/// Fuzzy candidates ordered strongest first; the row cap applies after ordering.
fn fuzzy_name_sql() -> String {
    let similarity = "(SELECT COALESCE(MAX(similarity(unaccent(LOWER(a.name)), c)), 0) \
                      FROM UNNEST($4::text[]) AS c)";
    format!(
        "SELECT {AREA_COLUMNS}, {similarity} AS name_similarity FROM areas a \
         WHERE {TYPE_FILTER} \
           AND (LOWER(a.gss) = ANY($3) \
                OR unaccent(LOWER(a.name)) = ANY($4) \
                OR EXISTS (SELECT 1 FROM UNNEST($4::text[]) AS c \
                           WHERE unaccent(LOWER(a.name)) % c \
                             AND similarity(unaccent(LOWER(a.name)), c) > {SIMILARITY_THRESHOLD})) \
           AND ($5::bigint IS NULL \
                OR ST_Intersects(a.polygon, (SELECT p.polygon FROM areas p WHERE p.id = $5))) \
         ORDER BY (LOWER(a.gss) = ANY($3)) DESC NULLS LAST, \
                  name_similarity DESC, \
                  a.mapit_generation_high DESC NULLS LAST \
         LIMIT 100"
    )
}

impl PgAreaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn area_from_row(row: &sqlx::postgres::PgRow) -> Result<Area, AppError> {
        let polygon: Option<String> = row.try_get("polygon")?;
        let point: Option<String> = row.try_get("point")?;
        Ok(Area {
            id: row.try_get("id")?,
            gss: row.try_get("gss")?,
            name: row.try_get("name")?,
            area_type: row.try_get("area_type")?,
            mapit_type: row.try_get("mapit_type")?,
            mapit_generation_low: row.try_get("mapit_generation_low")?,
            mapit_generation_high: row.try_get("mapit_generation_high")?,
            polygon: polygon.as_deref().map(multipolygon_from_geojson).transpose()?,
            point: point.as_deref().map(point_from_geojson).transpose()?,
        })
    }
}

#[async_trait]
impl AreaLookup for PgAreaStore {
    async fn find_by_code(
        &self,
        code: &str,
        area_types: &AreaTypeFilter,
    ) -> Result<Option<Area>, AppError> {
        let sql = format!(
            "SELECT {AREA_COLUMNS} FROM areas a \
             WHERE {TYPE_FILTER} AND LOWER(a.gss) = LOWER($3) \
             ORDER BY a.mapit_generation_high DESC NULLS LAST \
             LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(&area_types.lih_codes)
            .bind(&area_types.mapit_types)
            .bind(code.trim())
            .fetch_optional(&self.pool)
            .await
            .context("area code lookup")?;

        row.as_ref().map(Self::area_from_row).transpose()
    }

    async fn find_by_name_fuzzy(&self, query: &AreaQuery<'_>) -> Result<Option<Area>, AppError> {
        let lowered: Vec<String> = query
            .candidates
            .iter()
            .map(|c| c.trim().to_lowercase())
            .collect();
        let keys: Vec<String> = query.candidates.iter().map(|c| match_key(c)).collect();

        let sql = fuzzy_name_sql();
        let rows = sqlx::query(&sql)
            .bind(&query.area_types.lih_codes)
            .bind(&query.area_types.mapit_types)
            .bind(&lowered)
            .bind(&keys)
            .bind(query.parent.map(|p| p.id))
            .fetch_all(&self.pool)
            .await
            .context("fuzzy area name lookup")?;

        // Final ranking is shared with the in-memory store.
        let mut matches = Vec::with_capacity(rows.len());
        for row in &rows {
            let area = Self::area_from_row(row)?;
            if let Some(scored) = AreaMatch::score(&area, query.candidates) {
                matches.push(scored);
            }
        }
        Ok(rank_matches(matches).into_iter().next().map(|m| m.area))
    }

    async fn find_intersecting(
        &self,
        area_type: &str,
        bbox: &BoundingBox,
    ) -> Result<Vec<Area>, AppError> {
        let sql = format!(
            "SELECT {AREA_COLUMNS} FROM areas a \
             WHERE a.area_type = $1 \
               AND a.polygon && ST_MakeEnvelope($2, $3, $4, $5, 4326)"
        );
        let rows = sqlx::query(&sql)
            .bind(area_type)
            .bind(bbox.west)
            .bind(bbox.south)
            .bind(bbox.east)
            .bind(bbox.north)
            .fetch_all(&self.pool)
            .await
            .context("areas in bounding box")?;

        rows.iter().map(Self::area_from_row).collect()
    }
}
