//! Projection worker.
//!
//! Consumes change events from the durable stream through a consumer group
//! and applies them to the document index. Multiple workers may run under
//! the same group name; each stream entry is processed by exactly one of
//! them.
//!
//! Environment:
//! - `REDIS_URL` / `DOCSYNC_CONFIG`: transport and config overrides
//! - `DOCSYNC_WORKER_NAME`: consumer identity (default: hostname or UUID)

use std::sync::Arc;

use deadpool_redis::{Config, Runtime};
use tracing::{error, info};

use docsync::config::SyncConfig;
use docsync::consumer::ConsumerLoop;
use docsync::dlq::DeadLetterQueue;
use docsync::index::RedisIndex;
use docsync::projector::Projector;
use docsync::shutdown::ShutdownSignal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let config = SyncConfig::load()?;
    let worker_name = config.worker_name();

    info!(
        worker_name = %worker_name,
        consumer_group = %config.pipeline.consumer_group,
        stream = %config.pipeline.stream,
        "projection worker starting"
    );

    let pool = Config::from_url(config.redis.url.clone())
        .create_pool(Some(Runtime::Tokio1))
        .expect("failed to create Redis pool");

    let index = Arc::new(RedisIndex::new(pool.clone()));
    let projector = Projector::new(index);
    let dlq = DeadLetterQueue::new(pool.clone());

    let consumer = ConsumerLoop::new(
        pool,
        projector,
        dlq,
        config.pipeline.stream.clone(),
        config.pipeline.consumer_group.clone(),
        worker_name,
        config.pipeline.max_retries,
    );

    let shutdown = ShutdownSignal::new();
    let signal = shutdown.clone();
    tokio::spawn(async move { signal.wait().await });

    match consumer.run(&shutdown).await {
        Ok(stats) => {
            info!(
                events_processed = stats.events_processed,
                events_failed = stats.events_failed,
                "worker shutdown complete"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "worker terminated on transport failure");
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}
