//! Typed view of a source's `geocoding_config`.
//!
//! The declarative JSON is validated once, up front, so the strategies never
//! have to dig through unchecked nested maps:
//!
//! ```json
//! {
//!   "type": "area",
//!   "components": [
//!     {"field": "council", "metadata": {"lih_area_type__code": ["STC", "DIS"]}},
//!     {"field": "ward", "area_type": "WD23"}
//!   ]
//! }
//! ```

use crate::errors::AppError;
use crate::models::{AreaTypeFilter, RecordedComponent};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How a source expresses the geography of its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeographyType {
    Area,
    Address,
    Coordinates,
}

impl GeographyType {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "area" => Some(Self::Area),
            "address" => Some(Self::Address),
            "coordinates" => Some(Self::Coordinates),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    AreaCode,
    AreaName,
    PlaceName,
    StreetAddress,
    Countries,
    Latitude,
    Longitude,
}

impl ComponentType {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "area_code" => Some(Self::AreaCode),
            "area_name" => Some(Self::AreaName),
            "place_name" => Some(Self::PlaceName),
            "street_address" => Some(Self::StreetAddress),
            "countries" => Some(Self::Countries),
            "latitude" => Some(Self::Latitude),
            "longitude" => Some(Self::Longitude),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AreaCode => "area_code",
            Self::AreaName => "area_name",
            Self::PlaceName => "place_name",
            Self::StreetAddress => "street_address",
            Self::Countries => "countries",
            Self::Latitude => "latitude",
            Self::Longitude => "longitude",
        }
    }
}

/// Where a component's datum comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentSource {
    /// Column read from each record.
    Field(String),
    /// Literal applied to every record.
    Value(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodingComponent {
    pub component_type: ComponentType,
    pub source: ComponentSource,
    pub area_types: AreaTypeFilter,
}

impl GeocodingComponent {
    /// The datum for this record, `Value::Null` when the column is absent.
    pub fn raw_value(&self, record: &Map<String, Value>) -> Value {
        match &self.source {
            ComponentSource::Field(field) => record.get(field).cloned().unwrap_or(Value::Null),
            ComponentSource::Value(value) => value.clone(),
        }
    }

    /// The datum as trimmed, non-empty text.
    pub fn text_value(&self, record: &Map<String, Value>) -> Option<String> {
        value_as_text(&self.raw_value(record))
    }

    /// True when the datum varies per record.
    pub fn is_dynamic(&self) -> bool {
        matches!(self.source, ComponentSource::Field(_))
    }

    pub fn field(&self) -> Option<&str> {
        match &self.source {
            ComponentSource::Field(field) => Some(field),
            ComponentSource::Value(_) => None,
        }
    }
}

/// Renders scalar JSON as text; null, empty strings and containers yield `None`.
pub fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A validated geocoding configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct GeocodingConfig {
    pub geography_type: GeographyType,
    pub components: Vec<GeocodingComponent>,
    snapshot: Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Deserialize, Default)]
struct RawMetadata {
    #[serde(default, rename = "lih_area_type__code")]
    lih_area_type_code: Option<OneOrMany>,
    #[serde(default)]
    mapit_type: Option<OneOrMany>,
}

#[derive(Deserialize)]
struct RawComponent {
    #[serde(default, rename = "type")]
    component_type: Option<String>,
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    metadata: Option<RawMetadata>,
    #[serde(default)]
    area_type: Option<OneOrMany>,
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default, rename = "type")]
    geography_type: Option<String>,
    #[serde(default)]
    components: Vec<RawComponent>,
}

impl GeocodingConfig {
    /// Parses and validates a `geocoding_config` JSON document.
    pub fn from_value(value: &Value) -> Result<Self, AppError> {
        let raw: RawConfig = serde_json::from_value(value.clone()).map_err(|e| {
            AppError::Configuration(format!("geocoding_config is malformed: {}", e))
        })?;

        let geography_type = raw
            .geography_type
            .as_deref()
            .and_then(GeographyType::parse)
            .ok_or_else(|| {
                AppError::Configuration("geocoding_config is not a valid type".to_string())
            })?;

        let components = raw
            .components
            .into_iter()
            .enumerate()
            .map(|(index, component)| parse_component(index, component, geography_type))
            .collect::<Result<Vec<_>, _>>()?;

        let config = Self {
            geography_type,
            components,
            snapshot: value.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        let allowed: &[ComponentType] = match self.geography_type {
            GeographyType::Area => &[ComponentType::AreaCode, ComponentType::AreaName],
            GeographyType::Address => &[
                ComponentType::PlaceName,
                ComponentType::StreetAddress,
                ComponentType::AreaName,
                ComponentType::Countries,
            ],
            GeographyType::Coordinates => &[ComponentType::Latitude, ComponentType::Longitude],
        };

        if let Some(bad) = self
            .components
            .iter()
            .find(|c| !allowed.contains(&c.component_type))
        {
            return Err(AppError::Configuration(format!(
                "component type '{}' is not allowed for {:?} geocoding",
                bad.component_type.as_str(),
                self.geography_type
            )));
        }

        match self.geography_type {
            GeographyType::Area if self.components.is_empty() => Err(AppError::Configuration(
                "area geocoding requires at least one component".to_string(),
            )),
            GeographyType::Address
                if self.component(ComponentType::StreetAddress).is_none()
                    && self.component(ComponentType::PlaceName).is_none() =>
            {
                Err(AppError::Configuration(
                    "address geocoding requires a street_address or place_name component"
                        .to_string(),
                ))
            }
            GeographyType::Coordinates
                if self.component(ComponentType::Latitude).is_none()
                    || self.component(ComponentType::Longitude).is_none() =>
            {
                Err(AppError::Configuration(
                    "coordinate geocoding requires latitude and longitude components".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// The config exactly as supplied, persisted for change detection.
    pub fn snapshot(&self) -> &Value {
        &self.snapshot
    }

    pub fn component(&self, component_type: ComponentType) -> Option<&GeocodingComponent> {
        self.components
            .iter()
            .find(|c| c.component_type == component_type)
    }

    pub fn components_of(
        &self,
        component_type: ComponentType,
    ) -> impl Iterator<Item = &GeocodingComponent> {
        self.components
            .iter()
            .filter(move |c| c.component_type == component_type)
    }

    /// Raw values read from `record` for every component, in config order.
    pub fn record_components(&self, record: &Map<String, Value>) -> Vec<RecordedComponent> {
        self.components
            .iter()
            .map(|c| RecordedComponent {
                component_type: c.component_type.as_str().to_string(),
                field: c.field().map(str::to_string),
                value: c.raw_value(record),
            })
            .collect()
    }
}

fn parse_component(
    index: usize,
    raw: RawComponent,
    geography_type: GeographyType,
) -> Result<GeocodingComponent, AppError> {
    let component_type = match raw.component_type.as_deref() {
        Some(t) => ComponentType::parse(t).ok_or_else(|| {
            AppError::Configuration(format!(
                "component {} has unknown type '{}'",
                index, t
            ))
        })?,
        None if geography_type == GeographyType::Area => ComponentType::AreaName,
        None => {
            return Err(AppError::Configuration(format!(
                "component {} is missing a type",
                index
            )))
        }
    };

    let field = raw.field.filter(|f| !f.trim().is_empty());
    let source = match (field, raw.value) {
        (Some(field), None) => ComponentSource::Field(field),
        (None, Some(value)) => ComponentSource::Value(value),
        (Some(_), Some(_)) => {
            return Err(AppError::Configuration(format!(
                "component {} sets both field and value",
                index
            )))
        }
        (None, None) => {
            return Err(AppError::Configuration(format!(
                "component {} needs a field or a value",
                index
            )))
        }
    };

    let metadata = raw.metadata.unwrap_or_default();
    let mut lih_codes = metadata
        .lih_area_type_code
        .map(OneOrMany::into_vec)
        .unwrap_or_default();
    if let Some(shorthand) = raw.area_type {
        for code in shorthand.into_vec() {
            if !lih_codes.contains(&code) {
                lih_codes.push(code);
            }
        }
    }
    let mapit_types = metadata
        .mapit_type
        .map(OneOrMany::into_vec)
        .unwrap_or_default();

    Ok(GeocodingComponent {
        component_type,
        source,
        area_types: AreaTypeFilter {
            lih_codes,
            mapit_types,
        },
    })
}
