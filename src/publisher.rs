//! Event Publisher — appends change events to the durable stream.
//!
//! Each envelope becomes one stream entry keyed by its source table:
//!
//! ```text
//! XADD docsync:changes * table <table> payload <json> changedAt <rfc3339>
//! ```
//!
//! The stream is consumed through a consumer group by the projection
//! workers, so entries are processed once per group. Appends are confirmed
//! before the emitter moves on to the next notification; a failed append is
//! retried with exponential backoff up to a bounded attempt count, and
//! exhaustion surfaces as an error instead of a dropped-on-the-floor event.

use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::change::ChangeEnvelope;

/// Base delay for append retries (doubles per attempt, capped).
const RETRY_BASE_DELAY_MS: u64 = 200;

/// Default number of append attempts before giving up.
pub const DEFAULT_PUBLISH_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to serialize change envelope: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("stream append failed after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Confirmation that an event reached the stream.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    /// Stream entry id assigned by the log.
    pub stream_id: String,
    /// Routing key the entry was written under.
    pub table: String,
}

/// Appends change envelopes to the change stream.
#[derive(Clone)]
pub struct EventPublisher {
    pool: Pool,
    stream: String,
    max_attempts: u32,
}

impl EventPublisher {
    pub fn new(pool: Pool, stream: impl Into<String>) -> Self {
        Self {
            pool,
            stream: stream.into(),
            max_attempts: DEFAULT_PUBLISH_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Append one envelope, confirming delivery synchronously.
    pub async fn publish(&self, envelope: &ChangeEnvelope) -> Result<DeliveryReceipt, PublishError> {
        let payload = envelope.to_json()?;
        let changed_at = chrono::Utc::now().to_rfc3339();

        let mut last_error = String::new();
        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let backoff = retry_backoff(attempt - 1);
                warn!(
                    table = %envelope.table,
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying stream append"
                );
                tokio::time::sleep(backoff).await;
            }

            match self.try_append(&envelope.table, &payload, &changed_at).await {
                Ok(stream_id) => {
                    debug!(
                        stream_id = %stream_id,
                        table = %envelope.table,
                        operation = %envelope.operation,
                        "change event appended"
                    );
                    return Ok(DeliveryReceipt {
                        stream_id,
                        table: envelope.table.clone(),
                    });
                }
                Err(e) => {
                    warn!(table = %envelope.table, error = %e, "stream append failed");
                    last_error = e;
                }
            }
        }

        Err(PublishError::Exhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }

    async fn try_append(
        &self,
        table: &str,
        payload: &str,
        changed_at: &str,
    ) -> Result<String, String> {
        let mut conn = self.pool.get().await.map_err(|e| e.to_string())?;
        cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg("table")
            .arg(table)
            .arg("payload")
            .arg(payload)
            .arg("changedAt")
            .arg(changed_at)
            .query_async(&mut conn)
            .await
            .map_err(|e| e.to_string())
    }
}

fn retry_backoff(retry: u32) -> Duration {
    Duration::from_millis(RETRY_BASE_DELAY_MS * (1 << retry.min(5)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(retry_backoff(0), Duration::from_millis(200));
        assert_eq!(retry_backoff(1), Duration::from_millis(400));
        assert_eq!(retry_backoff(5), Duration::from_millis(6400));
        assert_eq!(retry_backoff(12), Duration::from_millis(6400));
    }
}
