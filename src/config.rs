use crate::geocoding::GeocoderVersions;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub postcodes_io_base_url: String,
    pub bulk_reverse_base_url: String,
    pub bulk_reverse_radius_metres: u32,
    pub mapit_base_url: String,
    pub mapit_api_key: Option<String>,
    pub google_geocoding_base_url: String,
    pub google_maps_api_key: Option<String>,
    pub http_timeout_secs: u64,
    pub geocode_concurrency: usize,
    pub geocoder_versions: GeocoderVersions,
}

fn http_url(name: &str, default: &str) -> anyhow::Result<String> {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    if raw.trim().is_empty() {
        anyhow::bail!("{} cannot be empty", name);
    }
    let parsed =
        url::Url::parse(&raw).map_err(|e| anyhow::anyhow!("{} is not a valid URL: {}", name, e))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        anyhow::bail!("{} must start with http:// or https://", name);
    }
    Ok(raw.trim_end_matches('/').to_string())
}

fn parsed_or<T: std::str::FromStr>(name: &str, default: T, hint: &str) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be {}", name, hint)),
        Err(_) => Ok(default),
    }
}

fn optional_secret(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn version_or(name: &str, default: &str) -> anyhow::Result<String> {
    let version = std::env::var(name).unwrap_or_else(|_| default.to_string());
    if version.trim().is_empty() {
        anyhow::bail!("{} cannot be empty", name);
    }
    Ok(version.trim().to_ascii_uppercase())
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = GeocoderVersions::default();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .or_else(|_| std::env::var("DB_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DATABASE_URL or DB_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DATABASE_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DATABASE_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: parsed_or("PORT", 3000, "a valid number between 1-65535")?,
            postcodes_io_base_url: http_url("POSTCODES_IO_BASE_URL", "https://api.postcodes.io")?,
            bulk_reverse_base_url: http_url("BULK_REVERSE_BASE_URL", "https://api.postcodes.io")?,
            bulk_reverse_radius_metres: parsed_or(
                "BULK_REVERSE_RADIUS_METRES",
                2000,
                "a whole number of metres",
            )?,
            mapit_base_url: http_url("MAPIT_BASE_URL", "https://mapit.mysociety.org")?,
            mapit_api_key: optional_secret("MAPIT_API_KEY"),
            google_geocoding_base_url: http_url(
                "GOOGLE_GEOCODING_BASE_URL",
                "https://maps.googleapis.com",
            )?,
            google_maps_api_key: optional_secret("GOOGLE_MAPS_API_KEY"),
            http_timeout_secs: parsed_or("HTTP_TIMEOUT_SECS", 10, "a whole number of seconds")?,
            geocode_concurrency: parsed_or("GEOCODE_CONCURRENCY", 8, "a positive number")?,
            geocoder_versions: GeocoderVersions {
                area_name: version_or("AREA_GEOCODER_VERSION", &defaults.area_name)?,
                area_code: version_or("AREA_CODE_GEOCODER_VERSION", &defaults.area_code)?,
                address: version_or("ADDRESS_GEOCODER_VERSION", &defaults.address)?,
                coordinates: version_or("COORDINATE_GEOCODER_VERSION", &defaults.coordinates)?,
            },
        };

        if config.geocode_concurrency == 0 {
            anyhow::bail!("GEOCODE_CONCURRENCY must be a positive number");
        }
        if config.http_timeout_secs == 0 {
            anyhow::bail!("HTTP_TIMEOUT_SECS must be at least 1");
        }

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        tracing::debug!("postcodes.io base URL: {}", config.postcodes_io_base_url);
        tracing::debug!("Bulk reverse base URL: {}", config.bulk_reverse_base_url);
        tracing::debug!("MapIt base URL: {}", config.mapit_base_url);
        if config.google_maps_api_key.is_none() {
            tracing::warn!("GOOGLE_MAPS_API_KEY not set; address geocoding will fail softly");
        }
        tracing::debug!("Geocoder versions: {:?}", config.geocoder_versions);
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
