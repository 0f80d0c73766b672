//! Change Emitter — captures row-level change notifications from the
//! relational source and hands them to the [`EventPublisher`].
//!
//! The emitter owns the process's only notification connection. It issues
//! `LISTEN` on every configured channel and then pumps notifications:
//! each payload is parsed as a [`ChangeEnvelope`] and published; malformed
//! payloads are logged and dropped, never forwarded.
//!
//! Silent connection loss is the failure mode that matters here — a dead
//! `LISTEN` connection looks exactly like a quiet database. If no
//! notification arrives within the idle window the emitter probes the
//! connection with `SELECT 1`; a failed probe (or a terminated connection
//! stream) tears the session down, and the outer loop reconnects with a
//! short delay until shutdown.

use futures_util::stream::poll_fn;
use futures_util::StreamExt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_postgres::tls::NoTlsStream;
use tokio_postgres::{AsyncMessage, Client, Connection, NoTls, Notification, Socket};
use tracing::{debug, error, info, warn};

use crate::change::ChangeEnvelope;
use crate::publisher::EventPublisher;
use crate::shutdown::ShutdownSignal;

/// Delay before re-establishing a torn-down source connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum EmitterError {
    #[error("failed to connect to the relational source: {0}")]
    Connect(#[source] tokio_postgres::Error),

    #[error("LISTEN setup failed: {0}")]
    Listen(#[source] tokio_postgres::Error),

    #[error("liveness probe failed: {0}")]
    Probe(#[source] tokio_postgres::Error),

    #[error("notification connection closed")]
    ConnectionClosed,
}

enum SessionEnd {
    Shutdown,
}

/// Long-lived capture loop over one exclusive notification connection.
pub struct ChangeEmitter {
    conninfo: String,
    channels: Vec<String>,
    idle_window: Duration,
    publisher: EventPublisher,
}

impl ChangeEmitter {
    pub fn new(
        conninfo: impl Into<String>,
        channels: Vec<String>,
        idle_window: Duration,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            conninfo: conninfo.into(),
            channels,
            idle_window,
            publisher,
        }
    }

    /// Run until shutdown. Connection failures are not fatal: the emitter
    /// reconnects indefinitely, since "no capture" is strictly worse than
    /// "capture with gaps" for a listen-from-now pipeline.
    pub async fn run(&self, shutdown: &ShutdownSignal) -> Result<(), EmitterError> {
        let mut shutdown_rx = shutdown.subscribe();
        loop {
            match self.listen_session(&mut shutdown_rx).await {
                Ok(SessionEnd::Shutdown) => {
                    info!("emitter shutting down");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        delay_secs = RECONNECT_DELAY.as_secs(),
                        "source connection lost, reconnecting"
                    );
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("emitter shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    /// One connection lifetime: connect, LISTEN, pump notifications until
    /// shutdown or a transport failure.
    async fn listen_session(
        &self,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<SessionEnd, EmitterError> {
        let (client, connection) = tokio_postgres::connect(&self.conninfo, NoTls)
            .await
            .map_err(EmitterError::Connect)?;

        let (tx, mut notifications) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive_connection(connection, tx));

        let result = self.pump(&client, &mut notifications, shutdown_rx).await;
        driver.abort();
        result
    }

    async fn pump(
        &self,
        client: &Client,
        notifications: &mut mpsc::UnboundedReceiver<Notification>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<SessionEnd, EmitterError> {
        for channel in &self.channels {
            client
                .batch_execute(&format!("LISTEN {channel}"))
                .await
                .map_err(EmitterError::Listen)?;
            info!(channel = %channel, "listening for change notifications");
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return Ok(SessionEnd::Shutdown),

                received = tokio::time::timeout(self.idle_window, notifications.recv()) => {
                    match received {
                        Ok(Some(notification)) => self.handle_notification(&notification).await,
                        Ok(None) => return Err(EmitterError::ConnectionClosed),
                        Err(_) => {
                            debug!(
                                idle_secs = self.idle_window.as_secs(),
                                "no notifications within idle window, probing connection"
                            );
                            client
                                .simple_query("SELECT 1")
                                .await
                                .map_err(EmitterError::Probe)?;
                        }
                    }
                }
            }
        }
    }

    async fn handle_notification(&self, notification: &Notification) {
        debug!(
            channel = %notification.channel(),
            pid = notification.process_id(),
            "notification received"
        );

        let envelope = match ChangeEnvelope::from_json(notification.payload()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    channel = %notification.channel(),
                    error = %e,
                    "dropping malformed change payload"
                );
                return;
            }
        };

        match self.publisher.publish(&envelope).await {
            Ok(receipt) => {
                info!(
                    stream_id = %receipt.stream_id,
                    table = %receipt.table,
                    operation = %envelope.operation,
                    "change event published"
                );
            }
            Err(e) => {
                // The publisher has already exhausted its retries; without a
                // local spool there is nothing left to do but say so loudly.
                error!(
                    table = %envelope.table,
                    operation = %envelope.operation,
                    error = %e,
                    "change event lost: publish failed"
                );
            }
        }
    }
}

/// Drive the connection, forwarding notifications to the pump. Runs until
/// the connection errors out or the receiver side is dropped.
async fn drive_connection(
    mut connection: Connection<Socket, NoTlsStream>,
    tx: mpsc::UnboundedSender<Notification>,
) {
    let mut messages = poll_fn(move |cx| connection.poll_message(cx));
    while let Some(message) = messages.next().await {
        match message {
            Ok(AsyncMessage::Notification(notification)) => {
                if tx.send(notification).is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "notification connection error");
                break;
            }
        }
    }
}
