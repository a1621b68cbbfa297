//! Spatial helpers over `geo` types, shared by the area stores and the
//! statistics selection modes.

use crate::errors::AppError;
use crate::models::{Area, Coordinates};
use geo::{coord, BoundingRect, Contains, MultiPolygon, Polygon, LineString, Rect, Relate};
use serde::{Deserialize, Serialize};

/// WGS84 bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub fn contains(&self, point: Coordinates) -> bool {
        point.lng >= self.west
            && point.lng <= self.east
            && point.lat >= self.south
            && point.lat <= self.north
    }

    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            coord! { x: self.west, y: self.south },
            coord! { x: self.east, y: self.north },
        )
    }

    fn from_rect(rect: Rect<f64>) -> Self {
        Self {
            west: rect.min().x,
            south: rect.min().y,
            east: rect.max().x,
            north: rect.max().y,
        }
    }

    /// Smallest box covering this one and the bounds of every area given.
    pub fn expand_to_cover(&self, areas: &[Area]) -> Self {
        areas
            .iter()
            .filter_map(|area| area.polygon.as_ref().and_then(|p| p.bounding_rect()))
            .map(Self::from_rect)
            .fold(*self, |acc, other| Self {
                west: acc.west.min(other.west),
                south: acc.south.min(other.south),
                east: acc.east.max(other.east),
                north: acc.north.max(other.north),
            })
    }

    pub fn intersects_polygon(&self, polygon: &MultiPolygon<f64>) -> bool {
        self.to_rect().to_polygon().relate(polygon).is_intersects()
    }
}

pub fn polygons_intersect(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> bool {
    a.relate(b).is_intersects()
}

/// True when `inner` lies wholly within `outer`.
pub fn polygon_within(inner: &MultiPolygon<f64>, outer: &MultiPolygon<f64>) -> bool {
    inner.relate(outer).is_within()
}

pub fn polygon_contains_point(polygon: &MultiPolygon<f64>, point: Coordinates) -> bool {
    polygon.contains(&point.to_point())
}

// ============ GeoJSON (from ST_AsGeoJSON) ============

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum GeoJsonGeometry {
    Point { coordinates: Vec<f64> },
    Polygon { coordinates: Vec<Vec<Vec<f64>>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Vec<f64>>>> },
}

fn ring(positions: &[Vec<f64>]) -> Result<LineString<f64>, AppError> {
    positions
        .iter()
        .map(|p| match p.as_slice() {
            [x, y, ..] => Ok(coord! { x: *x, y: *y }),
            _ => Err(AppError::InternalError(
                "GeoJSON position needs two ordinates".to_string(),
            )),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(LineString::new)
}

fn polygon(rings: &[Vec<Vec<f64>>]) -> Result<Polygon<f64>, AppError> {
    let mut rings = rings.iter().map(|r| ring(r));
    let exterior = rings
        .next()
        .ok_or_else(|| AppError::InternalError("GeoJSON polygon has no rings".to_string()))??;
    let interiors = rings.collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

/// Parses a Polygon or MultiPolygon GeoJSON geometry into a `MultiPolygon`.
pub fn multipolygon_from_geojson(raw: &str) -> Result<MultiPolygon<f64>, AppError> {
    match serde_json::from_str::<GeoJsonGeometry>(raw)? {
        GeoJsonGeometry::Polygon { coordinates } => Ok(MultiPolygon(vec![polygon(&coordinates)?])),
        GeoJsonGeometry::MultiPolygon { coordinates } => coordinates
            .iter()
            .map(|p| polygon(p))
            .collect::<Result<Vec<_>, _>>()
            .map(MultiPolygon),
        GeoJsonGeometry::Point { .. } => Err(AppError::InternalError(
            "expected a polygon geometry, found a point".to_string(),
        )),
    }
}

pub fn point_from_geojson(raw: &str) -> Result<Coordinates, AppError> {
    match serde_json::from_str::<GeoJsonGeometry>(raw)? {
        GeoJsonGeometry::Point { coordinates } => match coordinates.as_slice() {
            [lng, lat, ..] => Ok(Coordinates::new(*lat, *lng)),
            _ => Err(AppError::InternalError(
                "GeoJSON point needs two ordinates".to_string(),
            )),
        },
        _ => Err(AppError::InternalError(
            "expected a point geometry".to_string(),
        )),
    }
}
