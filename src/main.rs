pub mod api;
mod config;
mod directory;
mod geo;
mod tracking;

use std::sync::Arc;

use axum::{Router, routing::get};
use sqlx::SqlitePool;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[cfg(feature = "dev-tools")]
use axum_sql_viewer::SqlViewerLayer;
#[cfg(feature = "dev-tools")]
use tracing_web_console::TracingLayer;

use config::Config;
use tracking::TrackingEngine;

#[derive(OpenApi)]
#[openapi(
    info(title = "Live Bus Trip API", version = "0.2.0"),
    paths(
        api::routes::upsert_route,
        api::routes::get_route,
        api::trips::control::select_route,
        api::trips::control::change_destination,
        api::trips::control::start_trip,
        api::trips::control::cancel_trip,
        api::trips::control::publish_location,
        api::trips::control::get_trip,
        api::trips::search::search_trips,
        api::health::health_check,
    ),
    components(schemas(
        api::ErrorResponse,
        api::routes::RouteUpsertRequest,
        api::trips::control::TripRequest,
        api::trips::control::DestinationOptionsResponse,
        api::trips::control::ChangeDestinationRequest,
        api::trips::control::TripActionResponse,
        api::trips::control::LocationFixRequest,
        api::trips::control::LocationFixResponse,
        api::trips::search::TripSearchRequest,
        api::trips::search::TripSearchResponse,
        api::health::HealthResponse,
        geo::Waypoint,
        directory::Direction,
        directory::Route,
        directory::ActiveTrip,
        tracking::TripStatus,
        tracking::LocationSample,
        tracking::TripView,
    )),
    tags(
        (name = "routes", description = "Route metadata endpoints"),
        (name = "trips", description = "Trip lifecycle, live location and search"),
        (name = "health", description = "Service health check")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info,sqlx=warn".into()),
        )
        .init();

    // Load config
    let config = Config::load("config.yaml").expect("Failed to load config");
    config.tracking.validate();
    tracing::info!(
        recheck_secs = config.tracking.city_recheck_interval_secs,
        offline_secs = config.tracking.offline_after_secs,
        "Loaded configuration"
    );

    // Build CORS layer based on config
    let cors_layer = if config.cors_permissive {
        tracing::warn!("CORS: Permissive mode explicitly enabled (all origins allowed) - DO NOT USE IN PRODUCTION");
        CorsLayer::permissive()
    } else if !config.cors_origins.is_empty() {
        tracing::info!(origins = ?config.cors_origins, "CORS: Restricting to configured origins");
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::OPTIONS,
            ])
            .allow_headers([axum::http::header::CONTENT_TYPE])
    } else {
        panic!("CORS configuration error: Either set 'cors_origins' with allowed origins, or set 'cors_permissive: true' for development");
    };

    // Initialize SQLite database
    let cwd = std::env::current_dir().expect("Failed to get current directory");
    let db_path = cwd.join("database");
    if let Err(e) = std::fs::create_dir_all(&db_path) {
        tracing::warn!("Could not create database directory: {}", e);
    }
    let db_file = db_path.join("data.db");
    tracing::info!("Database path: {}, exists: {}", db_file.display(), db_file.exists());
    let db_url = format!("sqlite:{}?mode=rwc", db_file.display());
    let pool = SqlitePool::connect(&db_url)
        .await
        .expect("Failed to connect to SQLite database");

    // Run migrations
    let migrator = sqlx::migrate!("./migrations");
    tracing::info!(migrations = migrator.migrations.len(), "Found migrations");
    migrator
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    tracing::info!("Database migrations completed");

    // Start the tracking engine in background
    let engine = Arc::new(TrackingEngine::new(pool.clone(), config.tracking.clone()));
    let engine_clone = engine.clone();
    tokio::spawn(async move {
        engine_clone.start().await;
    });

    // Build the app
    #[allow(unused_mut)] // mut needed when dev-tools feature is enabled
    let mut app = Router::new()
        .route("/", get(root))
        .nest("/api", api::router(pool.clone(), engine))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer);

    // Add dev tools only when feature is enabled
    #[cfg(feature = "dev-tools")]
    {
        let tracing_layer = TracingLayer::new("/tracing");
        app = app
            .merge(SqlViewerLayer::sqlite("/sql-viewer", pool.clone()).into_router())
            .merge(tracing_layer.into_router());
        tracing::warn!("Dev tools enabled: SQL Viewer and Tracing Console are accessible");
    }

    // Start server
    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000")
        .await
        .expect("Failed to bind to port 3000");

    tracing::info!("Server running on http://localhost:3000");
    tracing::info!("Swagger UI: http://localhost:3000/swagger-ui");
    #[cfg(feature = "dev-tools")]
    {
        tracing::info!("SQL Viewer: http://localhost:3000/sql-viewer");
        tracing::info!("Tracing Console: http://localhost:3000/tracing");
    }

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}

async fn root() -> &'static str {
    "Live Bus Trip API"
}
