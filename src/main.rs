use axum::{
    routing::{get, post},
    Router,
};
use civic_geo_hub::config::Config;
use civic_geo_hub::db::Database;
use civic_geo_hub::handlers::{self, AppState};
use civic_geo_hub::loaders::Backends;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Main entry point.
///
/// Initializes tracing, loads configuration, connects to Postgres, wires the
/// external geocoding services and starts the Axum server.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "civic_geo_hub=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established");

    let backends = Backends::from_config(&config, db.pool.clone())?;
    tracing::info!(
        "Geocoder versions: area name {}, area code {}, address {}, coordinates {}",
        config.geocoder_versions.area_name,
        config.geocoder_versions.area_code,
        config.geocoder_versions.address,
        config.geocoder_versions.coordinates
    );

    let port = config.port;
    let app_state = Arc::new(AppState::new(config, backends));

    // 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limiter configuration"))?,
    );

    let protected_routes = Router::new()
        .route("/api/v1/geocode", post(handlers::geocode_batch))
        .route("/api/v1/statistics", post(handlers::statistics))
        .layer(
            ServiceBuilder::new()
                // Batches can be large: 20MB max payload
                .layer(RequestBodyLimitLayer::new(20 * 1024 * 1024))
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Health check bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
