use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cct_core::ServerConfig;
use cct_core::SessionManager;

/// Shared state handed to every WebSocket connection (spec §4.6).
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub config: Arc<ServerConfig>,
    active_connections: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(manager: Arc<SessionManager>, config: Arc<ServerConfig>) -> Self {
        Self {
            manager,
            config,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Attempt to reserve a connection slot, respecting `max_connections`.
    /// Returns a drop guard that releases the slot when the connection ends.
    pub fn try_acquire_connection(&self) -> Option<ConnectionGuard> {
        loop {
            let current = self.active_connections.load(Ordering::SeqCst);
            if current >= self.config.max_connections {
                return None;
            }
            if self
                .active_connections
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(ConnectionGuard {
                    counter: self.active_connections.clone(),
                });
            }
        }
    }
}

pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
