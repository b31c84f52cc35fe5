// Weather Journal v0.1
use std::path::{Path, PathBuf};
use std::time::Instant;

use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod cache;
mod config;
mod db;
mod errors;
mod helpers;
mod http;
mod providers;
mod routes;
mod services;

use config::AppConfig;
use errors::AppError;
use routes::AppState;
use services::catalog::CityCatalog;
use services::collector::Collector;

/// Maximum number of connections in the database pool. Matches the
/// collector's session-permit ceiling so a full fan-out never starves on
/// pool checkout.
const DB_POOL_MAX_CONNECTIONS: u32 = 50;
/// Minimum number of connections kept alive in the database pool.
const DB_POOL_MIN_CONNECTIONS: u32 = 2;

#[derive(Parser)]
#[command(
    name = "weather-journal",
    version,
    about = "Historical-weather collection pipeline and read API"
)]
struct Cli {
    /// Path to the YAML or JSON config file
    #[arg(long, default_value = "./config/dev.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Populate the city catalog and collect historical weather (default)
    Run {
        /// Actually perform the full collection run
        #[arg(long)]
        initial: bool,
    },
    /// Serve the read API over the journal
    Serve,
}

/// Weather Journal OpenAPI specification.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Weather Journal API",
        version = "0.1.0",
        description = "Read API over the historical-weather journal: per-hour \
            observations collected from multiple providers, averaged across \
            data sources per city and hour.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Health", description = "Service health check"),
        (name = "Cities", description = "City catalog search"),
        (name = "Weather", description = "Averaged historical weather"),
    ),
    paths(
        routes::health::health_check,
        routes::cities::search_cities,
        routes::weather::get_weather,
    ),
    components(
        schemas(
            routes::health::HealthResponse,
            routes::cities::CitiesSearchResponse,
            routes::weather::WeatherResponse,
            db::models::CityEntry,
            db::models::AveragedWeather,
            errors::ErrorResponse,
        )
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weather_journal=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run { initial: false });

    if let Err(err) = run(&cli.config, command).await {
        tracing::error!("{}", err);
        std::process::exit(err.exit_code());
    }
}

async fn run(config_path: &Path, command: Command) -> Result<(), AppError> {
    let config = AppConfig::load(config_path)?;

    let pool = PgPoolOptions::new()
        .max_connections(DB_POOL_MAX_CONNECTIONS)
        .min_connections(DB_POOL_MIN_CONNECTIONS)
        .connect(&config.db.connection_string)
        .await?;

    sqlx::migrate!()
        .run(&pool)
        .await
        .map_err(|e| AppError::Database(e.into()))?;
    tracing::info!("Database migrations completed");

    match command {
        Command::Run { initial } => run_collection(&config, pool, initial).await,
        Command::Serve => serve_api(&config, pool).await,
    }
}

async fn run_collection(config: &AppConfig, pool: PgPool, initial: bool) -> Result<(), AppError> {
    if !initial {
        tracing::info!("Skipping the gather step. To gather, pass --initial");
        return Ok(());
    }

    let started = Instant::now();
    let client = http::build_shared_client();

    let catalog = CityCatalog::new(client.clone(), pool.clone());
    catalog.populate().await?;

    let providers = providers::build_providers(&client, &config.data_sources);
    if providers.is_empty() {
        return Err(AppError::Config(
            "no data sources are configured, nothing to collect".to_string(),
        ));
    }

    let (start_date, end_date) = config.collect.window();
    tracing::info!(
        "Starting the gather for {} - {}",
        start_date.to_rfc3339(),
        end_date.to_rfc3339()
    );

    let mut collector = Collector::new(pool, providers, start_date, end_date);

    // Teardown must run whatever happens inside setup/run; dedup makes a
    // re-run after interruption safe.
    let result = async {
        collector.setup().await?;
        tokio::select! {
            run = collector.run() => run,
            _ = tokio::signal::ctrl_c() => Err(AppError::Interrupted),
        }
    }
    .await;
    collector.teardown().await;

    let summary = result?;
    tracing::info!(
        "Time taken - {:.1}s ({} succeeded, {} skipped)",
        started.elapsed().as_secs_f64(),
        summary.succeeded,
        summary.skipped
    );
    Ok(())
}

async fn serve_api(config: &AppConfig, pool: PgPool) -> Result<(), AppError> {
    let app_state = AppState { pool };

    // CORS: read-only API, restrict methods to GET
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET])
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .route("/api/v1/cities/search", get(routes::cities::search_cities))
        .route("/api/v1/weather", get(routes::weather::get_weather))
        .with_state(app_state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors);

    let listener =
        tokio::net::TcpListener::bind((config.api.host.as_str(), config.api.port)).await?;
    tracing::info!(
        "API server listening on {}:{}",
        config.api.host,
        config.api.port
    );

    axum::serve(listener, app).await?;
    Ok(())
}
