//! Dead-letter stream for poison change events.
//!
//! Events that still fail projection after the retry ceiling land here with
//! enough context to diagnose and replay them by hand. The stream is capped
//! so a broken producer cannot grow it without bound.

use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::change::ChangeEnvelope;

/// Stream name for dead-lettered change events.
pub const DLQ_STREAM_NAME: &str = "docsync:changes:dlq";

/// Maximum entries kept (older entries are trimmed).
const DLQ_MAX_LEN: usize = 10000;

#[derive(Debug, Error)]
pub enum DlqError {
    #[error("redis connection error: {0}")]
    Connection(String),

    #[error("redis command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Dead-letter queue over a capped Redis stream.
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: Pool,
}

impl DeadLetterQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Record a change event that exhausted its retries.
    pub async fn add_failed_event(
        &self,
        envelope: &ChangeEnvelope,
        error: &str,
        retry_count: u32,
        original_id: Option<&str>,
    ) -> Result<String, DlqError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))?;

        let failed_at = chrono::Utc::now().to_rfc3339();
        let payload = envelope.to_json()?;

        let id: String = cmd("XADD")
            .arg(DLQ_STREAM_NAME)
            .arg("MAXLEN")
            .arg("~")
            .arg(DLQ_MAX_LEN)
            .arg("*")
            .arg("payload")
            .arg(&payload)
            .arg("error")
            .arg(error)
            .arg("retryCount")
            .arg(retry_count)
            .arg("failedAt")
            .arg(&failed_at)
            .arg("originalId")
            .arg(original_id.unwrap_or(""))
            .arg("table")
            .arg(&envelope.table)
            .arg("operation")
            .arg(envelope.operation.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to dead-letter change event");
                DlqError::Command(e.to_string())
            })?;

        info!(
            dlq_id = %id,
            original_id = ?original_id,
            table = %envelope.table,
            operation = %envelope.operation,
            retry_count = retry_count,
            "change event moved to dead-letter stream"
        );

        Ok(id)
    }

    /// Number of entries currently dead-lettered.
    pub async fn count(&self) -> Result<u64, DlqError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))?;

        cmd("XLEN")
            .arg(DLQ_STREAM_NAME)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Command(e.to_string()))
    }

    /// Page through dead-lettered entries as `(stream_id, entry)` pairs.
    pub async fn list(&self, count: usize, offset: usize) -> Result<Vec<(String, Value)>, DlqError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))?;

        let entries: Vec<(String, Vec<(String, String)>)> = cmd("XRANGE")
            .arg(DLQ_STREAM_NAME)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count + offset)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Command(e.to_string()))?;

        let result: Vec<(String, Value)> = entries
            .into_iter()
            .skip(offset)
            .take(count)
            .map(|(id, fields)| (id, entry_to_value(fields)))
            .collect();

        debug!(count = result.len(), "retrieved dead-letter entries");
        Ok(result)
    }

    /// Fetch one dead-lettered entry by stream id.
    pub async fn get(&self, id: &str) -> Result<Option<Value>, DlqError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))?;

        let entries: Vec<(String, Vec<(String, String)>)> = cmd("XRANGE")
            .arg(DLQ_STREAM_NAME)
            .arg(id)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Command(e.to_string()))?;

        Ok(entries
            .into_iter()
            .next()
            .map(|(_, fields)| entry_to_value(fields)))
    }

    /// Drop an entry after manual review or replay.
    pub async fn remove(&self, id: &str) -> Result<bool, DlqError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))?;

        let removed: u64 = cmd("XDEL")
            .arg(DLQ_STREAM_NAME)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Command(e.to_string()))?;

        if removed > 0 {
            info!(id = %id, "removed entry from dead-letter stream");
        } else {
            debug!(id = %id, "entry not found in dead-letter stream");
        }
        Ok(removed > 0)
    }
}

/// Render raw stream fields as a JSON object, inlining the envelope payload
/// and numeric retry count where they parse.
fn entry_to_value(fields: Vec<(String, String)>) -> Value {
    let mut obj = serde_json::Map::new();
    for (key, value) in fields {
        match key.as_str() {
            "payload" => {
                let parsed =
                    serde_json::from_str::<Value>(&value).unwrap_or(Value::String(value));
                obj.insert(key, parsed);
            }
            "retryCount" => {
                let parsed = value
                    .parse::<u32>()
                    .map(|n| json!(n))
                    .unwrap_or(Value::String(value));
                obj.insert(key, parsed);
            }
            _ => {
                obj.insert(key, Value::String(value));
            }
        }
    }
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Operation;
    use serde_json::json;

    #[test]
    fn entry_rendering_inlines_payload_and_retry_count() {
        let envelope = ChangeEnvelope::new(
            "user_projects",
            Operation::Insert,
            json!({"user_id": 1, "project_id": 10}),
        );
        let fields = vec![
            ("payload".to_string(), envelope.to_json().unwrap()),
            ("error".to_string(), "index timeout".to_string()),
            ("retryCount".to_string(), "3".to_string()),
        ];

        let value = entry_to_value(fields);
        assert_eq!(value["payload"]["table"], "user_projects");
        assert_eq!(value["retryCount"], 3);
        assert_eq!(value["error"], "index timeout");
    }
}
