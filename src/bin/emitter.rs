//! Change capture process.
//!
//! Holds the exclusive notification connection to the relational source,
//! decodes each change notification, and publishes it to the durable
//! change stream. Runs until SIGTERM/SIGINT.

use std::time::Duration;

use deadpool_redis::{Config, Runtime};
use tracing::info;

use docsync::config::SyncConfig;
use docsync::emitter::ChangeEmitter;
use docsync::publisher::EventPublisher;
use docsync::shutdown::ShutdownSignal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let config = SyncConfig::load()?;

    info!(
        channels = ?config.postgres.channels,
        stream = %config.pipeline.stream,
        "change emitter starting"
    );

    let pool = Config::from_url(config.redis.url.clone())
        .create_pool(Some(Runtime::Tokio1))
        .expect("failed to create Redis pool");

    let publisher = EventPublisher::new(pool, config.pipeline.stream.clone())
        .with_max_attempts(config.pipeline.publish_attempts);

    let emitter = ChangeEmitter::new(
        config.postgres.url.clone(),
        config.postgres.channels.clone(),
        Duration::from_secs(config.postgres.idle_timeout_secs),
        publisher,
    );

    let shutdown = ShutdownSignal::new();
    let signal = shutdown.clone();
    tokio::spawn(async move { signal.wait().await });

    emitter.run(&shutdown).await?;

    info!("emitter shutdown complete");
    Ok(())
}
