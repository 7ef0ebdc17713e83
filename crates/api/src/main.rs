#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Auth Sandbox API Server

use std::net::SocketAddr;
use std::sync::Arc;

use authsandbox_api::{
    routes::create_router,
    store::{CredentialStore, MemoryCredentialStore, PgCredentialStore},
    AppState, Config,
};
use authsandbox_shared::{create_migration_pool, create_pool, run_migrations};
use axum::http::{header, HeaderName, HeaderValue, Method};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,authsandbox_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Auth Sandbox API v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    let store: Arc<dyn CredentialStore> = match &config.database_url {
        Some(database_url) => {
            tracing::info!("Running database migrations...");
            let migration_pool = create_migration_pool(database_url).await?;
            run_migrations(&migration_pool).await?;
            migration_pool.close().await;

            tracing::info!("Connecting to database...");
            let pool = create_pool(database_url).await?;
            tracing::info!("Database connection established");
            Arc::new(PgCredentialStore::new(pool))
        }
        None => {
            tracing::warn!(
                "DATABASE_URL not set, using the in-memory credential store (data is lost on restart)"
            );
            Arc::new(MemoryCredentialStore::new())
        }
    };

    let state = AppState::new(config.clone(), store);

    // Explicit origin allowlist; cookies need credentialed CORS
    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
            HeaderName::from_static("x-refresh-token"),
        ])
        .expose_headers([header::CONTENT_TYPE])
        .allow_credentials(true);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = ?e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
