//! Cooperative shutdown for the pipeline's long-lived loops.
//!
//! One [`ShutdownSignal`] is created per process and cloned into every
//! loop. `wait()` blocks on SIGTERM/SIGINT and then notifies all
//! subscribers; loops check their receiver between units of work and let
//! in-flight work finish rather than aborting it.

use tokio::sync::broadcast;
use tracing::info;

/// Broadcast-backed shutdown notification shared across components.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }

    /// Block until SIGTERM or SIGINT, then notify all subscribers.
    pub async fn wait(&self) {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received Ctrl+C, shutting down"),
            _ = terminate => info!("received SIGTERM, shutting down"),
        }

        let _ = self.sender.send(());
    }

    /// A receiver that resolves once shutdown has been triggered.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Trigger shutdown without a signal (tests, programmatic stop).
    pub fn trigger(&self) {
        let _ = self.sender.send(());
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
