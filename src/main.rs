//! Search API server.
//!
//! Serves the read side of the pipeline: join-reconstruction queries over
//! the document index the projection workers maintain.

use std::net::SocketAddr;
use std::sync::Arc;

use deadpool_redis::{Config, Runtime};
use tracing::info;

use docsync::api::{self, AppState};
use docsync::config::SyncConfig;
use docsync::index::RedisIndex;
use docsync::query::QueryEngine;
use docsync::shutdown::ShutdownSignal;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let config = SyncConfig::load().expect("invalid configuration");

    let pool = Config::from_url(config.redis.url.clone())
        .create_pool(Some(Runtime::Tokio1))
        .expect("failed to create Redis pool");

    let index = Arc::new(RedisIndex::new(pool));
    let engine = QueryEngine::new(index);
    let app = api::router(AppState::new(engine));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind server address");

    info!(addr = %addr, "search API listening");

    let shutdown = ShutdownSignal::new();
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.wait().await })
        .await
        .expect("server error");

    info!("search API stopped");
}
