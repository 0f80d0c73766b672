//! Event Consumer — polls the change stream and drives the projector.
//!
//! Workers join a named consumer group so multiple instances share the
//! stream without processing the same entry twice. The loop:
//!
//! 1. ensures the group exists (`MKSTREAM`, `BUSYGROUP` tolerated) and
//!    claims long-idle pending entries left behind by dead workers,
//! 2. reads batches with a bounded block so shutdown is never far away,
//! 3. decodes each entry into a [`TableChange`] and applies it through the
//!    [`Projector`],
//! 4. acks on success; on failure re-appends the entry with an incremented
//!    retry count (backoff grows with it) until the ceiling, after which
//!    the entry is dead-lettered.
//!
//! Per-entry decode failures are local: log, ack, continue — a poison
//! entry must not wedge the stream. Transport failures are not: after a
//! small consecutive-failure budget the loop returns an error and the
//! process is expected to exit rather than retry forever.

use deadpool_redis::redis::streams::{StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{cmd, AsyncCommands, Value as RedisValue};
use deadpool_redis::Pool;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::change::{ChangeEnvelope, TableChange};
use crate::dlq::DeadLetterQueue;
use crate::projector::{Projection, Projector};
use crate::shutdown::ShutdownSignal;

/// Base delay for per-event retry backoff (doubles per retry, capped).
const RETRY_BASE_DELAY_MS: u64 = 1000;

/// Idle time after which another worker's pending entries are claimed.
const PENDING_IDLE_THRESHOLD_MS: u64 = 30000;

/// Consecutive transport failures tolerated before the loop gives up.
const TRANSPORT_FAILURE_BUDGET: u32 = 3;

/// Block timeout for each group read, in milliseconds.
const READ_BLOCK_MS: usize = 2000;

/// Entries fetched per read.
const READ_BATCH_SIZE: usize = 10;

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("change stream transport failed: {0}")]
    Transport(String),

    #[error("consumer group setup failed: {0}")]
    GroupSetup(String),
}

/// Counters reported when the loop exits.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsumerStats {
    pub events_processed: u64,
    pub events_failed: u64,
}

/// The consume/dispatch loop for one worker.
pub struct ConsumerLoop {
    pool: Pool,
    projector: Projector,
    dlq: DeadLetterQueue,
    stream: String,
    group: String,
    consumer_name: String,
    max_retries: u32,
}

impl ConsumerLoop {
    pub fn new(
        pool: Pool,
        projector: Projector,
        dlq: DeadLetterQueue,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer_name: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            pool,
            projector,
            dlq,
            stream: stream.into(),
            group: group.into(),
            consumer_name: consumer_name.into(),
            max_retries,
        }
    }

    /// Run until shutdown or a fatal transport failure.
    pub async fn run(&self, shutdown: &ShutdownSignal) -> Result<ConsumerStats, ConsumeError> {
        self.ensure_group().await?;

        if let Err(e) = self.claim_pending().await {
            warn!(error = %e, "failed to claim pending entries");
        }

        let mut shutdown_rx = shutdown.subscribe();
        let mut stats = ConsumerStats::default();
        let mut transport_failures: u32 = 0;

        info!(
            stream = %self.stream,
            group = %self.group,
            consumer = %self.consumer_name,
            "consuming change events"
        );

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!(
                    events_processed = stats.events_processed,
                    events_failed = stats.events_failed,
                    "consumer shutting down"
                );
                return Ok(stats);
            }

            let mut conn = match self.pool.get().await {
                Ok(conn) => {
                    transport_failures = 0;
                    conn
                }
                Err(e) => {
                    transport_failures += 1;
                    error!(
                        error = %e,
                        consecutive = transport_failures,
                        "failed to get stream connection"
                    );
                    if transport_failures >= TRANSPORT_FAILURE_BUDGET {
                        return Err(ConsumeError::Transport(e.to_string()));
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            let opts = StreamReadOptions::default()
                .group(&self.group, &self.consumer_name)
                .block(READ_BLOCK_MS)
                .count(READ_BATCH_SIZE);

            let stream_keys = [self.stream.as_str()];
            let reply: StreamReadReply = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(
                        events_processed = stats.events_processed,
                        events_failed = stats.events_failed,
                        "consumer shutting down"
                    );
                    return Ok(stats);
                }
                result = conn.xread_options(&stream_keys, &[">"], &opts) => {
                    match result {
                        Ok(reply) => reply,
                        Err(e) => {
                            let text = e.to_string();
                            // Blocked reads time out routinely; only real
                            // transport errors count against the budget.
                            if text.contains("timed out") || text.contains("response was nil") {
                                continue;
                            }
                            transport_failures += 1;
                            error!(
                                error = %text,
                                consecutive = transport_failures,
                                "stream read failed"
                            );
                            if transport_failures >= TRANSPORT_FAILURE_BUDGET {
                                return Err(ConsumeError::Transport(text));
                            }
                            tokio::time::sleep(Duration::from_secs(2)).await;
                            continue;
                        }
                    }
                }
            };

            for stream_key in reply.keys {
                for entry in stream_key.ids {
                    self.handle_entry(&mut conn, &entry.id, &entry.map, &mut stats)
                        .await;
                }
            }

            if stats.events_processed > 0 && stats.events_processed % 100 == 0 {
                info!(
                    events_processed = stats.events_processed,
                    events_failed = stats.events_failed,
                    "consumer statistics"
                );
            }
        }
    }

    /// Process one stream entry end to end: decode, project, ack/retry/DLQ.
    async fn handle_entry(
        &self,
        conn: &mut deadpool_redis::Connection,
        id: &str,
        fields: &HashMap<String, RedisValue>,
        stats: &mut ConsumerStats,
    ) {
        let retry_count = get_retry_count(fields);

        let envelope = match parse_entry(fields) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(id = %id, error = %e, "skipping undecodable stream entry");
                self.ack(conn, id).await;
                return;
            }
        };

        let change = match TableChange::decode(&envelope) {
            Ok(change) => change,
            Err(e) => {
                warn!(
                    id = %id,
                    table = %envelope.table,
                    error = %e,
                    "skipping entry with invalid row data"
                );
                self.ack(conn, id).await;
                return;
            }
        };

        debug!(
            id = %id,
            table = %envelope.table,
            operation = %envelope.operation,
            retry_count = retry_count,
            "projecting change event"
        );

        match self.projector.apply(&change).await {
            Ok(Projection::Ignored) => {
                debug!(id = %id, table = %envelope.table, "entry ignored");
            }
            Ok(_) => {
                stats.events_processed += 1;
            }
            Err(e) => {
                stats.events_failed += 1;
                error!(
                    id = %id,
                    table = %envelope.table,
                    retry_count = retry_count,
                    error = %e,
                    "projection failed"
                );

                if retry_count >= self.max_retries {
                    warn!(
                        id = %id,
                        retry_count = retry_count,
                        max_retries = self.max_retries,
                        "retry ceiling reached, dead-lettering"
                    );
                    if let Err(dlq_err) = self
                        .dlq
                        .add_failed_event(&envelope, &e.to_string(), retry_count, Some(id))
                        .await
                    {
                        // Leave the entry pending; XAUTOCLAIM will hand it
                        // back once the DLQ is reachable again.
                        error!(id = %id, error = %dlq_err, "failed to dead-letter entry");
                        return;
                    }
                } else {
                    let backoff = retry_backoff(retry_count);
                    debug!(
                        id = %id,
                        retry_count = retry_count,
                        backoff_ms = backoff.as_millis() as u64,
                        "re-queueing with incremented retry count"
                    );
                    tokio::time::sleep(backoff).await;
                    if let Err(requeue_err) = self.requeue(conn, &envelope, retry_count + 1).await {
                        error!(id = %id, error = %requeue_err, "failed to re-queue entry");
                        return;
                    }
                }
            }
        }

        // Every path that reaches here has finished with the entry: applied,
        // ignored, re-queued as a fresh entry, or dead-lettered.
        self.ack(conn, id).await;
    }

    async fn ack(&self, conn: &mut deadpool_redis::Connection, id: &str) {
        let result: Result<(), _> = conn.xack(&self.stream, &self.group, &[id]).await;
        if let Err(e) = result {
            error!(id = %id, error = %e, "failed to ack stream entry");
        }
    }

    async fn requeue(
        &self,
        conn: &mut deadpool_redis::Connection,
        envelope: &ChangeEnvelope,
        retry_count: u32,
    ) -> Result<(), String> {
        let payload = envelope.to_json().map_err(|e| e.to_string())?;
        let _: String = cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg("table")
            .arg(&envelope.table)
            .arg("payload")
            .arg(payload)
            .arg("changedAt")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg("retryCount")
            .arg(retry_count)
            .query_async(conn)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Create the consumer group, tolerating one that already exists.
    async fn ensure_group(&self) -> Result<(), ConsumeError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| ConsumeError::Transport(e.to_string()))?;

        let result: Result<(), _> = cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(group = %self.group, stream = %self.stream, "created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                info!(group = %self.group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(ConsumeError::GroupSetup(e.to_string())),
        }
    }

    /// Adopt entries another worker read but never acked.
    async fn claim_pending(&self) -> Result<usize, String> {
        let mut conn = self.pool.get().await.map_err(|e| e.to_string())?;

        #[allow(clippy::type_complexity)]
        let result: Result<(String, Vec<(String, HashMap<String, RedisValue>)>), _> =
            cmd("XAUTOCLAIM")
                .arg(&self.stream)
                .arg(&self.group)
                .arg(&self.consumer_name)
                .arg(PENDING_IDLE_THRESHOLD_MS)
                .arg("0-0")
                .arg("COUNT")
                .arg(READ_BATCH_SIZE)
                .query_async(&mut conn)
                .await;

        match result {
            Ok((_, entries)) => {
                if !entries.is_empty() {
                    info!(count = entries.len(), "claimed pending entries from previous workers");
                }
                Ok(entries.len())
            }
            Err(e) => {
                debug!(error = %e, "XAUTOCLAIM unavailable, skipping pending recovery");
                Ok(0)
            }
        }
    }
}

/// Parse a stream entry's fields into a change envelope. The `payload`
/// field is authoritative; `table` is just the routing key.
fn parse_entry(fields: &HashMap<String, RedisValue>) -> Result<ChangeEnvelope, String> {
    let payload =
        get_str_field(fields, "payload").ok_or_else(|| "missing payload field".to_string())?;
    ChangeEnvelope::from_json(&payload).map_err(|e| e.to_string())
}

fn get_str_field(fields: &HashMap<String, RedisValue>, key: &str) -> Option<String> {
    fields.get(key).and_then(|value| match value {
        RedisValue::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        RedisValue::SimpleString(s) => Some(s.clone()),
        _ => None,
    })
}

fn get_retry_count(fields: &HashMap<String, RedisValue>) -> u32 {
    get_str_field(fields, "retryCount")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn retry_backoff(retry_count: u32) -> Duration {
    Duration::from_millis(RETRY_BASE_DELAY_MS * (1 << retry_count.min(5)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Operation;

    fn entry_with(payload: &str) -> HashMap<String, RedisValue> {
        let mut map = HashMap::new();
        map.insert(
            "payload".to_string(),
            RedisValue::BulkString(payload.as_bytes().to_vec()),
        );
        map.insert(
            "table".to_string(),
            RedisValue::BulkString(b"users".to_vec()),
        );
        map
    }

    #[test]
    fn parses_well_formed_entry() {
        let fields =
            entry_with(r#"{"table": "users", "operation": "INSERT", "data": {"id": 1}}"#);
        let envelope = parse_entry(&fields).unwrap();
        assert_eq!(envelope.table, "users");
        assert_eq!(envelope.operation, Operation::Insert);
    }

    #[test]
    fn rejects_entry_without_payload() {
        let fields = HashMap::new();
        assert!(parse_entry(&fields).is_err());
    }

    #[test]
    fn rejects_entry_with_garbage_payload() {
        let fields = entry_with("{definitely not json");
        assert!(parse_entry(&fields).is_err());
    }

    #[test]
    fn retry_count_defaults_to_zero() {
        let fields = entry_with("{}");
        assert_eq!(get_retry_count(&fields), 0);

        let mut with_count = fields;
        with_count.insert(
            "retryCount".to_string(),
            RedisValue::BulkString(b"2".to_vec()),
        );
        assert_eq!(get_retry_count(&with_count), 2);
    }

    #[test]
    fn backoff_grows_with_retries_and_caps() {
        assert_eq!(retry_backoff(0), Duration::from_millis(1000));
        assert_eq!(retry_backoff(2), Duration::from_millis(4000));
        assert_eq!(retry_backoff(9), Duration::from_millis(32000));
    }
}
