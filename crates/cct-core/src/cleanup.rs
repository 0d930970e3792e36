use std::sync::Arc;
use std::time::Duration;

use crate::session::SessionManager;

/// Background retention sweep (spec §4.4.5). Runs once immediately, then on
/// every tick of `interval_hours`. Never propagates errors to foreground
/// paths — failures are logged and the ticker continues.
pub fn spawn(manager: Arc<SessionManager>, interval_hours: u64, retention_days: i64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_hours * 3600));
        loop {
            ticker.tick().await;
            run_once(&manager, retention_days).await;
        }
    });
}

async fn run_once(manager: &SessionManager, retention_days: i64) {
    match manager.delete_sessions_older_than(retention_days).await {
        Ok(count) if count > 0 => {
            tracing::info!(count, retention_days, "cleanup deleted expired sessions");
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(error = %e, "session cleanup sweep failed");
        }
    }
}
