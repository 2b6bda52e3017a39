use axum::{http::Method, routing::get, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod auth;
mod config;
mod database;
mod error;
mod health;
mod jobs;
mod pool;
mod storage;
mod websocket;

pub use error::{ApiError, ApiResult, AppError};


pub struct AppState {
    pub health: health::HealthAggregator,
    pub gateway: Arc<websocket::EventGateway>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "Glimmr job events API" }))
        .merge(health::health_routes())
        .route("/ws", get(websocket::websocket_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

fn init_tracing(environment: config::Environment) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if environment.is_production() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    init_tracing(config::Environment::from_env());
    let config = config::Config::from_env()?;

    // Backing store
    let connector = Arc::new(pool::RedisConnector::new(&config.redis.url)?);
    let connections = Arc::new(pool::ConnectionPoolManager::new(connector, &config.redis));
    connections.start_health_sweep().await;
    for name in [
        pool::DEFAULT_CONNECTION,
        pool::QUEUE_CONNECTION,
        pool::EVENTS_CONNECTION,
    ] {
        connections.get_connection(name).await;
    }
    let default = connections.get_connection(pool::DEFAULT_CONNECTION).await;
    if !default.wait_until_ready(config.redis.connect_timeout).await {
        tracing::warn!(
            status = %default.status(),
            "Backing store not ready at startup, continuing in the background"
        );
    }

    // Health collaborators
    let datastore = Arc::new(database::PgDatastore::new(database::create_pool(
        &config.database_url,
        database::PoolConfig::from_env(config.environment),
    )?));
    let object_store = storage::build_object_store(&config.storage)?;
    let storage_probe = Arc::new(storage::ObjectStorageProbe::new(
        object_store,
        &config.storage.probe_prefix,
    ));
    let queue_metrics = Arc::new(jobs::RedisQueueMetrics::new(
        connections.clone(),
        &config.queues,
    ));

    let health = health::HealthAggregator::new(
        datastore.clone(),
        connections.clone(),
        storage_probe,
        queue_metrics.clone(),
    );

    // Real-time events
    let gateway = Arc::new(websocket::EventGateway::new(auth::TokenVerifier::new(
        &config.jwt_secret,
    )));

    let mut scheduler = jobs::JobScheduler::new(
        jobs::QueueStatsPublisher::new(queue_metrics, gateway.clone()),
        jobs::JobConfig::from(&config.queues),
    )
    .await?;
    scheduler.start().await?;

    let relay = jobs::QueueEventRelay::new(connections.clone(), gateway.clone(), &config.queues);
    let relay_cancel = relay.cancellation_token();
    let relay_task = relay.spawn();

    let app_state = Arc::new(AppState {
        health,
        gateway,
    });
    let app = build_router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    relay_cancel.cancel();
    if let Err(e) = relay_task.await {
        tracing::warn!(error = %e, "Queue event relay ended abnormally");
    }
    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!(error = %e, "Scheduler shutdown failed");
    }
    connections.shutdown().await;
    datastore.close().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
