//! Stowage API Server
//!
//! Serves signup, billing commands and the payment provider webhook.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderValue, Method};
use stowage_api::{create_router, AppState, Config};
use stowage_billing::{
    dispatcher::DEFAULT_QUEUE_CAPACITY, BillingService, HttpNotificationSink, SideEffectDispatcher,
    SideEffectSink, TracingSink,
};
use stowage_shared::{create_pool, run_migrations};
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
                .unwrap_or_else(|_| "info,stowage_api=debug,stowage_billing=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Stowage API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    if config.run_migrations {
        run_migrations(&pool).await?;
    } else {
        tracing::info!("Database migrations skipped (RUN_MIGRATIONS=false)");
    }

    // Notifications go out through the external service when configured
    let sink: Arc<dyn SideEffectSink> = match HttpNotificationSink::from_env() {
        Some(sink) => {
            tracing::info!("Notification delivery enabled");
            Arc::new(sink)
        }
        None => {
            tracing::warn!(
                "Notification delivery not configured (missing NOTIFICATION_WEBHOOK_URL); logging side effects only"
            );
            Arc::new(TracingSink)
        }
    };
    let (dispatcher, _dispatch_task) = SideEffectDispatcher::spawn(
        sink,
        Duration::from_millis(config.side_effect_spacing_ms),
        DEFAULT_QUEUE_CAPACITY,
    );

    let billing = BillingService::from_env(pool, dispatcher).await?;
    tracing::info!("Billing service initialized");

    let state = AppState::new(config.clone(), billing);

    // Explicit origin allowlist
    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
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
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
