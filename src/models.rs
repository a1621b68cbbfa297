use geo::{Centroid, MultiPolygon, Point};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

// ============ Geography ============

/// WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Stable key used by the per-batch loaders (~10cm precision).
    pub fn cache_key(&self) -> String {
        format!("{:.6},{:.6}", self.lat, self.lng)
    }

    pub fn to_point(self) -> Point<f64> {
        Point::new(self.lng, self.lat)
    }

    pub fn from_point(point: Point<f64>) -> Self {
        Self {
            lat: point.y(),
            lng: point.x(),
        }
    }
}

/// An administrative or statistical boundary.
///
/// Several rows may share a name across boundary generations; they are told
/// apart by `gss`, by polygon containment, or by `mapit_generation_high`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Area {
    pub id: i64,
    /// Government Statistical Service code. Null for some historical rows.
    pub gss: Option<String>,
    pub name: String,
    /// LIH area-type code, e.g. `WD23`, `STC`, `DIS`, `WMC23`.
    pub area_type: String,
    /// MapIt boundary classification, e.g. `UTA`, `MTW`.
    #[serde(default)]
    pub mapit_type: Option<String>,
    #[serde(default)]
    pub mapit_generation_low: Option<i32>,
    #[serde(default)]
    pub mapit_generation_high: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polygon: Option<MultiPolygon<f64>>,
    #[serde(default)]
    pub point: Option<Coordinates>,
}

impl Area {
    /// Representative point: the stored point, else the polygon centroid.
    pub fn sample_point(&self) -> Option<Coordinates> {
        self.point.or_else(|| {
            self.polygon
                .as_ref()
                .and_then(|polygon| polygon.centroid())
                .map(Coordinates::from_point)
        })
    }
}

/// Area-type restriction applied to an area search.
///
/// An area passes if its LIH code is in `lih_codes` or its MapIt type is in
/// `mapit_types`. An empty filter accepts every area.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AreaTypeFilter {
    pub lih_codes: Vec<String>,
    pub mapit_types: Vec<String>,
}

impl AreaTypeFilter {
    pub fn is_empty(&self) -> bool {
        self.lih_codes.is_empty() && self.mapit_types.is_empty()
    }

    pub fn accepts(&self, area: &Area) -> bool {
        if self.is_empty() {
            return true;
        }
        self.lih_codes.iter().any(|code| code == &area.area_type)
            || area
                .mapit_type
                .as_ref()
                .is_some_and(|mapit| self.mapit_types.iter().any(|t| t == mapit))
    }

    pub fn cache_key(&self) -> String {
        format!("{}|{}", self.lih_codes.join(","), self.mapit_types.join(","))
    }
}

// ============ Postcode-level data ============

/// GSS codes attached to a postcode, as returned by postcodes.io.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostcodeCodes {
    #[serde(default)]
    pub admin_district: Option<String>,
    #[serde(default)]
    pub admin_county: Option<String>,
    #[serde(default)]
    pub admin_ward: Option<String>,
    #[serde(default)]
    pub parish: Option<String>,
    #[serde(default)]
    pub parliamentary_constituency: Option<String>,
    #[serde(default)]
    pub parliamentary_constituency_2024: Option<String>,
    #[serde(default)]
    pub ced: Option<String>,
    #[serde(default)]
    pub lsoa: Option<String>,
    #[serde(default)]
    pub msoa: Option<String>,
}

/// Canonical bundle of administrative and electoral data for one postcode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostcodeData {
    pub postcode: String,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub admin_district: Option<String>,
    #[serde(default)]
    pub admin_county: Option<String>,
    #[serde(default)]
    pub admin_ward: Option<String>,
    #[serde(default)]
    pub parish: Option<String>,
    #[serde(default)]
    pub parliamentary_constituency: Option<String>,
    #[serde(default)]
    pub parliamentary_constituency_2024: Option<String>,
    #[serde(default)]
    pub european_electoral_region: Option<String>,
    #[serde(default)]
    pub lsoa: Option<String>,
    #[serde(default)]
    pub msoa: Option<String>,
    #[serde(default)]
    pub codes: PostcodeCodes,
}

impl PostcodeData {
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => Some(Coordinates::new(lat, lng)),
            _ => None,
        }
    }
}

/// Area types that can be read straight out of cached postcode data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalyticalAreaType {
    ParliamentaryConstituency2024,
    ParliamentaryConstituency,
    AdminWard,
    AdminDistrict,
    AdminCounty,
    Lsoa,
    Msoa,
}

impl AnalyticalAreaType {
    /// Maps an LIH area-type code onto the postcode data field holding it.
    pub fn from_area_type_code(code: &str) -> Option<Self> {
        match code {
            "WMC23" => Some(Self::ParliamentaryConstituency2024),
            "WMC" => Some(Self::ParliamentaryConstituency),
            "WD23" => Some(Self::AdminWard),
            "STC" | "DIS" => Some(Self::AdminDistrict),
            "CTY" => Some(Self::AdminCounty),
            "LSOA" => Some(Self::Lsoa),
            "MSOA" => Some(Self::Msoa),
            _ => None,
        }
    }

    pub fn code_in<'a>(&self, data: &'a PostcodeData) -> Option<&'a str> {
        let codes = &data.codes;
        match self {
            Self::ParliamentaryConstituency2024 => codes.parliamentary_constituency_2024.as_deref(),
            Self::ParliamentaryConstituency => codes.parliamentary_constituency.as_deref(),
            Self::AdminWard => codes.admin_ward.as_deref(),
            Self::AdminDistrict => codes.admin_district.as_deref(),
            Self::AdminCounty => codes.admin_county.as_deref(),
            Self::Lsoa => codes.lsoa.as_deref(),
            Self::Msoa => codes.msoa.as_deref(),
        }
    }

    pub fn label_in<'a>(&self, data: &'a PostcodeData) -> Option<&'a str> {
        match self {
            Self::ParliamentaryConstituency2024 => data.parliamentary_constituency_2024.as_deref(),
            Self::ParliamentaryConstituency => data.parliamentary_constituency.as_deref(),
            Self::AdminWard => data.admin_ward.as_deref(),
            Self::AdminDistrict => data.admin_district.as_deref(),
            Self::AdminCounty => data.admin_county.as_deref(),
            Self::Lsoa => data.lsoa.as_deref(),
            Self::Msoa => data.msoa.as_deref(),
        }
    }
}

// ============ Audit trail ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepResult {
    Success,
    Failed,
}

/// One attempted operation in a geocoding run, in the order it was tried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(rename = "type")]
    pub step_type: String,
    pub service: String,
    pub result: StepResult,
    pub search_term: Option<Value>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl Step {
    pub fn success(
        step_type: impl Into<String>,
        service: impl Into<String>,
        search_term: Option<Value>,
        data: Option<Value>,
    ) -> Self {
        Self {
            step_type: step_type.into(),
            service: service.into(),
            result: StepResult::Success,
            search_term,
            data,
        }
    }

    pub fn failed(
        step_type: impl Into<String>,
        service: impl Into<String>,
        search_term: Option<Value>,
        data: Option<Value>,
    ) -> Self {
        Self {
            step_type: step_type.into(),
            service: service.into(),
            result: StepResult::Failed,
            search_term,
            data,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == StepResult::Success
    }
}

/// Raw value read for one geocoding component on one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedComponent {
    #[serde(rename = "type")]
    pub component_type: String,
    #[serde(default)]
    pub field: Option<String>,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeData {
    /// Snapshot of the geocoding config in force when this result was produced.
    pub config: Value,
    #[serde(default)]
    pub components: Vec<RecordedComponent>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub skipped: bool,
}

// ============ Records & results ============

/// Column classification produced by `stats::typing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Percentage,
    Numeric,
    Text,
}

/// A row imported from an external source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    #[serde(default)]
    pub source_id: Option<String>,
    pub json: Map<String, Value>,
}

impl SourceRecord {
    pub fn new(id: impl Into<String>, json: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            source_id: None,
            json,
        }
    }
}

/// Output of one geocoding invocation for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResult {
    /// Strategy label including its version, e.g. `AREA_GEOCODER_V2`.
    pub geocoder: Option<String>,
    pub geocode_data: GeocodeData,
    pub postcode_data: Option<PostcodeData>,
    pub area: Option<Area>,
    pub point: Option<Coordinates>,
    pub json: Map<String, Value>,
    pub parsed_json: Map<String, Value>,
    pub column_types: BTreeMap<String, ColumnType>,
}

/// A persisted record together with its geocoding output, as read by the
/// statistics engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub id: String,
    pub source_id: String,
    pub json: Map<String, Value>,
    #[serde(default)]
    pub point: Option<Coordinates>,
    #[serde(default)]
    pub area: Option<Area>,
    #[serde(default)]
    pub postcode_data: Option<PostcodeData>,
}

impl EnrichedRecord {
    pub fn from_result(id: String, source_id: String, result: &GeocodeResult) -> Self {
        Self {
            id,
            source_id,
            json: result.json.clone(),
            point: result.point,
            area: result.area.clone(),
            postcode_data: result.postcode_data.clone(),
        }
    }
}
