//! Civic Geo Hub Library
//!
//! Geocoding for UK civic source data and a statistics engine over the
//! geocoded records.
//!
//! # Modules
//!
//! - `area_resolver`: Hierarchical area-name matching and area-code lookup.
//! - `area_store`: Area lookups against Postgres/PostGIS or an in-memory index.
//! - `config`: Configuration management.
//! - `db`: Database connection and pool management.
//! - `db_storage`: Persistence of geocoding results.
//! - `enrichment`: Postcode resolution chain with fallbacks.
//! - `errors`: Error handling types.
//! - `geocoding`: Strategy dispatch, change detection and versioning.
//! - `geocoding_config`: Parsed `geocoding_config` components.
//! - `geometry`: Polygon and bounding-box helpers.
//! - `handlers`: HTTP request handlers.
//! - `loaders`: Per-batch memoised access to every backend.
//! - `models`: Core data models.
//! - `services`: External postcode, area and address clients.
//! - `stats`: Typing, row statistics, expressions and aggregation.

pub mod area_resolver;
pub mod area_store;
pub mod config;
pub mod db;
pub mod db_storage;
pub mod enrichment;
pub mod errors;
pub mod geocoding;
pub mod geocoding_config;
pub mod geometry;
pub mod handlers;
pub mod loaders;
pub mod models;
pub mod services;
pub mod stats;
