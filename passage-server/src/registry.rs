//! Listener registry and shutdown signal handling.
//!
//! Every data listener runs in its own task and is registered here at
//! creation. On an interrupt or termination signal the registry is drained
//! and each task is aborted, which drops its socket and closes the port.
//! A failing listener never takes down its siblings or the control channel.

use std::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info};

struct ListenerEntry {
    name: String,
    abort: AbortHandle,
}

/// Ordered collection of closable listener handles.
pub struct ListenerRegistry {
    entries: Mutex<Vec<ListenerEntry>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener task for shutdown.
    pub fn register(&self, name: impl Into<String>, abort: AbortHandle) {
        let mut entries = self.entries.lock().expect("listener registry poisoned");
        entries.push(ListenerEntry {
            name: name.into(),
            abort,
        });
    }

    /// Close every registered listener, in registration order.
    pub fn shutdown_all(&self) {
        let entries = {
            let mut entries = self.entries.lock().expect("listener registry poisoned");
            std::mem::take(&mut *entries)
        };
        for entry in entries {
            debug!("closing {} listener", entry.name);
            entry.abort.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("listener registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for an interrupt or termination signal.
pub async fn wait_for_shutdown_signal() {
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
