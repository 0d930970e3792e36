mod messages;
mod migrations;
mod sessions;

use std::path::Path;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::session::types::{MessageRecord, Session, StatusFilter};

/// Durable session + message store, backed by a single SQLite file with WAL
/// journaling and foreign keys on (spec §4.1). A process-wide write mutex
/// serializes multi-statement write sequences (persist-then-bump-counters) so
/// they appear atomic to any concurrent reader — belt-and-suspenders on top
/// of SQLite's own single-writer guarantee.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl Storage {
    /// Open (creating if needed) the database at `db_path`, apply every
    /// pending migration, and run the idempotent sequence repair.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                crate::error::CctError::Storage(sqlx::Error::Io(e))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        migrations::run(&pool).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = std::fs::metadata(db_path) {
                let mut perms = meta.permissions();
                perms.set_mode(0o600);
                let _ = std::fs::set_permissions(db_path, perms);
            }
        }

        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub async fn save_session(&self, session: &Session) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sessions::save_session(&self.pool, session).await
    }

    pub async fn update_session(&self, session: &Session) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sessions::update_session(&self.pool, session).await
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Session> {
        sessions::get_session(&self.pool, id).await
    }

    pub async fn list_sessions(&self, filter: StatusFilter) -> Result<Vec<Session>> {
        sessions::list_sessions(&self.pool, filter).await
    }

    pub async fn delete_session(&self, id: Uuid) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sessions::delete_session(&self.pool, id).await
    }

    pub async fn delete_old_sessions(&self, retention_days: i64) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        sessions::delete_old_sessions(&self.pool, retention_days).await
    }

    pub async fn save_message(&self, msg: &MessageRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        messages::save_message(&self.pool, msg).await
    }

    pub async fn get_messages(
        &self,
        session_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<MessageRecord>, bool)> {
        messages::get_messages(&self.pool, session_id, limit, offset).await
    }

    pub async fn get_message_count(&self, session_id: Uuid) -> Result<i64> {
        messages::get_message_count(&self.pool, session_id).await
    }
}
