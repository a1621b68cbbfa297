use crate::config::Config;
use crate::errors::AppError;
use crate::models::{Coordinates, PostcodeData};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

// ============ Backend seams ============
//
// `Ok(None)` means the backend answered but had nothing for the query;
// `Err(_)` means the call itself failed (timeout, non-2xx, malformed body).
// Both are soft failures for the enrichment chain.

/// Primary postcode data service: forward resolution and nearest-postcode lookup.
#[async_trait]
pub trait PostcodeDataService: Send + Sync {
    fn service_name(&self) -> &'static str;

    async fn resolve(&self, postcode: &str) -> Result<Option<PostcodeData>, AppError>;

    async fn reverse(&self, point: Coordinates) -> Result<Option<PostcodeData>, AppError>;
}

/// Secondary reverse geocoder.
#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    fn service_name(&self) -> &'static str;

    async fn reverse(&self, point: Coordinates) -> Result<Option<PostcodeData>, AppError>;
}

/// Tertiary backend that only knows postcodes, which are then resolved
/// through the primary service.
#[async_trait]
pub trait PostcodeFinder: Send + Sync {
    fn service_name(&self) -> &'static str;

    /// A representative postcode lying inside the area with this GSS code.
    async fn example_postcode_for_area(&self, gss: &str) -> Result<Option<String>, AppError>;

    async fn postcode_for_point(&self, point: Coordinates) -> Result<Option<String>, AppError>;
}

/// Top match from a free-text address search.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressResult {
    pub formatted_address: Option<String>,
    pub postal_code: Option<String>,
    pub coordinates: Option<Coordinates>,
}

#[async_trait]
pub trait AddressGeocoder: Send + Sync {
    fn service_name(&self) -> &'static str;

    async fn geocode(
        &self,
        query: &str,
        country_hints: &[String],
    ) -> Result<Option<AddressResult>, AppError>;
}

/// Builds the shared reqwest client every backend uses.
pub fn http_client(timeout: Duration) -> Result<Client, AppError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("civic-geo-hub/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| AppError::ExternalApiError(format!("Failed to create HTTP client: {}", e)))
}

fn endpoint(base_url: &str, segments: &[&str]) -> Result<Url, AppError> {
    let mut url = Url::parse(base_url)
        .map_err(|e| AppError::ExternalApiError(format!("Invalid base URL {}: {}", base_url, e)))?;
    url.path_segments_mut()
        .map_err(|_| AppError::ExternalApiError(format!("Base URL {} cannot be a base", base_url)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn error_for_status(service: &str, response: reqwest::Response) -> AppError {
    let status = response.status();
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    AppError::ExternalApiError(format!("{} returned {}: {}", service, status, error_text))
}

// ============ postcodes.io ============

#[derive(Debug, Deserialize)]
struct PostcodesIoEnvelope<T> {
    #[serde(default)]
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct BulkReverseItem {
    #[serde(default)]
    result: Option<Vec<PostcodeData>>,
}

pub struct PostcodesIoService {
    client: Client,
    base_url: String,
}

impl PostcodesIoService {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn from_config(client: Client, config: &Config) -> Self {
        Self::new(client, config.postcodes_io_base_url.clone())
    }
}

#[async_trait]
impl PostcodeDataService for PostcodesIoService {
    fn service_name(&self) -> &'static str {
        "postcodes.io"
    }

    async fn resolve(&self, postcode: &str) -> Result<Option<PostcodeData>, AppError> {
        let url = endpoint(&self.base_url, &["postcodes", postcode.trim()])?;
        tracing::debug!("postcodes.io: resolving postcode {}", postcode);

        let response = self.client.get(url).send().await.map_err(|e| {
            AppError::ExternalApiError(format!("postcodes.io request failed: {}", e))
        })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(error_for_status("postcodes.io", response).await);
        }

        let envelope: PostcodesIoEnvelope<PostcodeData> = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse postcodes.io response: {}", e))
        })?;
        Ok(envelope.result)
    }

    async fn reverse(&self, point: Coordinates) -> Result<Option<PostcodeData>, AppError> {
        let mut url = endpoint(&self.base_url, &["postcodes"])?;
        url.query_pairs_mut()
            .append_pair("lon", &point.lng.to_string())
            .append_pair("lat", &point.lat.to_string())
            .append_pair("limit", "1");
        tracing::debug!("postcodes.io: reverse geocoding {}", point.cache_key());

        let response = self.client.get(url).send().await.map_err(|e| {
            AppError::ExternalApiError(format!("postcodes.io request failed: {}", e))
        })?;

        if !response.status().is_success() {
            return Err(error_for_status("postcodes.io", response).await);
        }

        let envelope: PostcodesIoEnvelope<Vec<PostcodeData>> =
            response.json().await.map_err(|e| {
                AppError::ExternalApiError(format!("Failed to parse postcodes.io response: {}", e))
            })?;
        Ok(envelope.result.and_then(|results| results.into_iter().next()))
    }
}

/// Bulk reverse geocoding (`POST /postcodes`) with a wider search radius than
/// the single-point lookup.
pub struct BulkReverseService {
    client: Client,
    base_url: String,
    radius_metres: u32,
}

impl BulkReverseService {
    pub fn new(client: Client, base_url: impl Into<String>, radius_metres: u32) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            radius_metres,
        }
    }

    pub fn from_config(client: Client, config: &Config) -> Self {
        Self::new(
            client,
            config.bulk_reverse_base_url.clone(),
            config.bulk_reverse_radius_metres,
        )
    }
}

#[async_trait]
impl ReverseGeocoder for BulkReverseService {
    fn service_name(&self) -> &'static str {
        "postcodes.io bulk"
    }

    async fn reverse(&self, point: Coordinates) -> Result<Option<PostcodeData>, AppError> {
        let url = endpoint(&self.base_url, &["postcodes"])?;
        let body = json!({
            "geolocations": [{
                "longitude": point.lng,
                "latitude": point.lat,
                "radius": self.radius_metres,
                "limit": 1
            }]
        });

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                AppError::ExternalApiError(format!("Bulk reverse request failed: {}", e))
            })?;

        if !response.status().is_success() {
            return Err(error_for_status("postcodes.io bulk", response).await);
        }

        let envelope: PostcodesIoEnvelope<Vec<BulkReverseItem>> =
            response.json().await.map_err(|e| {
                AppError::ExternalApiError(format!("Failed to parse bulk reverse response: {}", e))
            })?;

        Ok(envelope
            .result
            .and_then(|items| items.into_iter().next())
            .and_then(|item| item.result)
            .and_then(|results| results.into_iter().next()))
    }
}

// ============ MapIt ============

#[derive(Debug, Deserialize)]
struct MapItArea {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct MapItNearest {
    postcode: Option<MapItPostcode>,
}

#[derive(Debug, Deserialize)]
struct MapItPostcode {
    postcode: String,
}

pub struct MapItService {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl MapItService {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key,
        }
    }

    pub fn from_config(client: Client, config: &Config) -> Self {
        Self::new(
            client,
            config.mapit_base_url.clone(),
            config.mapit_api_key.clone(),
        )
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        segments: &[&str],
    ) -> Result<Option<T>, AppError> {
        let mut url = endpoint(&self.base_url, segments)?;
        if let Some(key) = &self.api_key {
            url.query_pairs_mut().append_pair("api_key", key);
        }

        let response =
            self.client.get(url).send().await.map_err(|e| {
                AppError::ExternalApiError(format!("MapIt request failed: {}", e))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(error_for_status("MapIt", response).await);
        }

        let parsed = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse MapIt response: {}", e))
        })?;
        Ok(Some(parsed))
    }
}

#[async_trait]
impl PostcodeFinder for MapItService {
    fn service_name(&self) -> &'static str {
        "mapit"
    }

    async fn example_postcode_for_area(&self, gss: &str) -> Result<Option<String>, AppError> {
        let Some(area) = self.get_json::<MapItArea>(&["code", "gss", gss]).await? else {
            return Ok(None);
        };
        let area_id = area.id.to_string();
        let postcode: Option<Value> = self
            .get_json(&["area", area_id.as_str(), "example_postcode"])
            .await?;
        Ok(postcode
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn postcode_for_point(&self, point: Coordinates) -> Result<Option<String>, AppError> {
        let location = format!("{},{}", point.lng, point.lat);
        let nearest: Option<MapItNearest> =
            self.get_json(&["nearest", "4326", location.as_str()]).await?;
        Ok(nearest
            .and_then(|n| n.postcode)
            .map(|p| p.postcode))
    }
}

// ============ Google Geocoding ============

#[derive(Debug, Deserialize)]
struct GoogleResponse {
    status: String,
    #[serde(default)]
    results: Vec<GooglePlace>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GooglePlace {
    #[serde(default)]
    formatted_address: Option<String>,
    #[serde(default)]
    address_components: Vec<GoogleAddressComponent>,
    geometry: Option<GoogleGeometry>,
}

#[derive(Debug, Deserialize)]
struct GoogleAddressComponent {
    long_name: String,
    #[serde(default)]
    types: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleGeometry {
    location: Coordinates,
}

pub struct GoogleGeocodingService {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl GoogleGeocodingService {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key,
        }
    }

    pub fn from_config(client: Client, config: &Config) -> Self {
        Self::new(
            client,
            config.google_geocoding_base_url.clone(),
            config.google_maps_api_key.clone(),
        )
    }
}

#[async_trait]
impl AddressGeocoder for GoogleGeocodingService {
    fn service_name(&self) -> &'static str {
        "google"
    }

    async fn geocode(
        &self,
        query: &str,
        country_hints: &[String],
    ) -> Result<Option<AddressResult>, AppError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            AppError::ExternalApiError("GOOGLE_MAPS_API_KEY is not configured".to_string())
        })?;

        let mut url = endpoint(&self.base_url, &["maps", "api", "geocode", "json"])?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("address", query);
            if !country_hints.is_empty() {
                let components = country_hints
                    .iter()
                    .map(|c| format!("country:{}", c))
                    .collect::<Vec<_>>()
                    .join("|");
                pairs.append_pair("components", &components);
            }
            pairs.append_pair("key", api_key);
        }

        tracing::info!("Google: geocoding address query '{}'", query);

        let response =
            self.client.get(url).send().await.map_err(|e| {
                AppError::ExternalApiError(format!("Google geocoding request failed: {}", e))
            })?;

        if !response.status().is_success() {
            return Err(error_for_status("Google geocoding", response).await);
        }

        let body: GoogleResponse = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse Google geocoding response: {}", e))
        })?;

        match body.status.as_str() {
            "OK" => {}
            "ZERO_RESULTS" => return Ok(None),
            other => {
                return Err(AppError::ExternalApiError(format!(
                    "Google geocoding returned status {}: {}",
                    other,
                    body.error_message.unwrap_or_default()
                )))
            }
        }

        Ok(body.results.into_iter().next().map(|place| {
            let postal_code = place
                .address_components
                .iter()
                .find(|c| c.types.iter().any(|t| t == "postal_code"))
                .map(|c| c.long_name.clone());
            AddressResult {
                formatted_address: place.formatted_address,
                postal_code,
                coordinates: place.geometry.map(|g| g.location),
            }
        }))
    }
}
