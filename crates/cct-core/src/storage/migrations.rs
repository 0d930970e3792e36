use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::error::Result;

/// Current schema version. Bump this and push a new entry onto [`steps`] when
/// adding a migration — never edit a past step in place.
const CURRENT_VERSION: i64 = 2;

async fn ensure_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
    )
    .execute(pool)
    .await?;

    let row = sqlx::query("SELECT COUNT(*) as c FROM schema_version")
        .fetch_one(pool)
        .await?;
    let count: i64 = row.try_get("c")?;
    if count == 0 {
        // A pre-existing database with the expected tables but no version row
        // is treated as version 1 (spec §4.1); a brand-new database starts at 0
        // so every step below runs.
        let tables_exist = table_exists(pool, "sessions").await? && table_exists(pool, "messages").await?;
        let initial = if tables_exist { 1 } else { 0 };
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(initial)
            .execute(pool)
            .await?;
    }
    Ok(())
}

async fn table_exists(pool: &SqlitePool, name: &str) -> Result<bool> {
    let row = sqlx::query("SELECT COUNT(*) as c FROM sqlite_master WHERE type='table' AND name=?")
        .bind(name)
        .fetch_one(pool)
        .await?;
    let count: i64 = row.try_get("c")?;
    Ok(count > 0)
}

async fn column_exists(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await?;
    for row in rows {
        let name: String = row.try_get("name")?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn current_version(pool: &SqlitePool) -> Result<i64> {
    let row = sqlx::query("SELECT version FROM schema_version LIMIT 1")
        .fetch_one(pool)
        .await?;
    Ok(row.try_get("version")?)
}

async fn set_version(tx: &mut Transaction<'_, Sqlite>, version: i64) -> Result<()> {
    sqlx::query("UPDATE schema_version SET version = ?")
        .bind(version)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Run every migration newer than the database's current recorded version, in
/// order, each inside its own transaction. Idempotent: re-running after a
/// crash mid-migration is safe because every step guards on feature detection
/// (`table_exists`/`column_exists`) before acting.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;
    sqlx::query("PRAGMA journal_mode = WAL").execute(pool).await?;

    ensure_version_table(pool).await?;
    let mut version = current_version(pool).await?;

    if version < 1 {
        migrate_v1(pool).await?;
        version = 1;
    }
    if version < 2 {
        migrate_v2(pool).await?;
        version = 2;
    }
    debug_assert_eq!(version, CURRENT_VERSION);

    repair_sequences(pool).await?;
    Ok(())
}

/// v1: base schema — sessions + messages, with the indexes spec §4.1 requires.
async fn migrate_v1(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id                  TEXT    PRIMARY KEY,
            status              TEXT    NOT NULL,
            created_at          TEXT    NOT NULL,
            updated_at          TEXT    NOT NULL,
            ended_at            TEXT,
            message_count       INTEGER NOT NULL DEFAULT 0,
            num_turns           INTEGER NOT NULL DEFAULT 0,
            cost_usd            REAL    NOT NULL DEFAULT 0,
            duration_ms         INTEGER NOT NULL DEFAULT 0,
            model_name          TEXT    NOT NULL,
            claude_session_id   TEXT,
            git_branch          TEXT,
            error_message       TEXT,
            options             TEXT    NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id                TEXT    PRIMARY KEY,
            session_id        TEXT    NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            sequence          INTEGER NOT NULL,
            role              TEXT    NOT NULL,
            content           TEXT    NOT NULL,
            thinking_content  TEXT,
            tool_uses         TEXT,
            timestamp         TEXT    NOT NULL,
            tokens_used       INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_status_updated ON sessions(status, updated_at DESC)")
        .execute(&mut *tx)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_created ON sessions(created_at DESC)")
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sessions_ended ON sessions(ended_at DESC) WHERE ended_at IS NOT NULL",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_session_seq_asc ON messages(session_id, sequence ASC)")
        .execute(&mut *tx)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_session_seq_desc ON messages(session_id, sequence DESC)")
        .execute(&mut *tx)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp DESC)")
        .execute(&mut *tx)
        .await?;

    set_version(&mut tx, 1).await?;
    tx.commit().await?;
    Ok(())
}

/// v2: add `tokens_used` to messages for databases created before it existed.
///
/// SQLite has supported `ALTER TABLE ... ADD COLUMN` for a long time, so a
/// straight add suffices here; the create/copy/drop/rename fallback (spec
/// §4.1, §9) is reserved for column *renames*, which plain `ADD COLUMN` can't
/// express — see [`rename_column_fallback`].
async fn migrate_v2(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;
    if !column_exists(pool, "messages", "tokens_used").await? {
        sqlx::query("ALTER TABLE messages ADD COLUMN tokens_used INTEGER NOT NULL DEFAULT 0")
            .execute(&mut *tx)
            .await?;
    }
    set_version(&mut tx, 2).await?;
    tx.commit().await?;
    Ok(())
}

/// Create-new-table / copy / drop / rename fallback for engines (or SQLite
/// builds) without `RENAME COLUMN`, run inside one transaction with identical
/// indexes recreated afterward. Not currently invoked by any migration step,
/// but kept as the documented escape hatch spec §4.1/§9 calls for.
#[allow(dead_code)]
async fn rename_column_fallback(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    create_new_sql: &str,
    copy_columns: &str,
    recreate_indexes: &[&str],
) -> Result<()> {
    let tmp = format!("{table}_new");
    sqlx::query(create_new_sql).execute(&mut **tx).await?;
    sqlx::query(&format!(
        "INSERT INTO {tmp} ({copy_columns}) SELECT {copy_columns} FROM {table}"
    ))
    .execute(&mut **tx)
    .await?;
    sqlx::query(&format!("DROP TABLE {table}")).execute(&mut **tx).await?;
    sqlx::query(&format!("ALTER TABLE {tmp} RENAME TO {table}"))
        .execute(&mut **tx)
        .await?;
    for idx_sql in recreate_indexes {
        sqlx::query(idx_sql).execute(&mut **tx).await?;
    }
    Ok(())
}

/// Idempotent sequence repair (spec §4.1, §8): rewrite every message's
/// `sequence` as `row_number() over (partition by session_id order by
/// timestamp asc, sequence asc)`, then set each session's `message_count` to
/// the max sequence for that session. Runs inside one transaction; safe to
/// re-run on every startup.
async fn repair_sequences(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        WITH ranked AS (
            SELECT id, ROW_NUMBER() OVER (
                PARTITION BY session_id ORDER BY timestamp ASC, sequence ASC
            ) AS rn
            FROM messages
        )
        UPDATE messages
        SET sequence = (SELECT rn FROM ranked WHERE ranked.id = messages.id)
        WHERE id IN (SELECT id FROM ranked)
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE sessions
        SET message_count = COALESCE(
            (SELECT MAX(sequence) FROM messages WHERE messages.session_id = sessions.id),
            message_count
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn open_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn run_on_fresh_database_reaches_current_version() {
        let pool = open_pool().await;
        run(&pool).await.unwrap();
        assert_eq!(current_version(&pool).await.unwrap(), CURRENT_VERSION);
        assert!(table_exists(&pool, "sessions").await.unwrap());
        assert!(table_exists(&pool, "messages").await.unwrap());
        assert!(column_exists(&pool, "messages", "tokens_used").await.unwrap());
    }

    #[tokio::test]
    async fn run_twice_is_idempotent() {
        let pool = open_pool().await;
        run(&pool).await.unwrap();
        run(&pool).await.unwrap();
        assert_eq!(current_version(&pool).await.unwrap(), CURRENT_VERSION);
    }

    #[tokio::test]
    async fn pre_existing_tables_without_version_row_are_treated_as_v1() {
        let pool = open_pool().await;

        // Simulate a database created before the schema_version table existed:
        // tables present (missing the v2 `tokens_used` column), no version row.
        sqlx::query(
            r#"
            CREATE TABLE sessions (
                id TEXT PRIMARY KEY, status TEXT NOT NULL, created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL, ended_at TEXT, message_count INTEGER NOT NULL DEFAULT 0,
                num_turns INTEGER NOT NULL DEFAULT 0, cost_usd REAL NOT NULL DEFAULT 0,
                duration_ms INTEGER NOT NULL DEFAULT 0, model_name TEXT NOT NULL,
                claude_session_id TEXT, git_branch TEXT, error_message TEXT, options TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            r#"
            CREATE TABLE messages (
                id TEXT PRIMARY KEY, session_id TEXT NOT NULL REFERENCES sessions(id),
                sequence INTEGER NOT NULL, role TEXT NOT NULL, content TEXT NOT NULL,
                thinking_content TEXT, tool_uses TEXT, timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        run(&pool).await.unwrap();

        assert_eq!(current_version(&pool).await.unwrap(), CURRENT_VERSION);
        assert!(column_exists(&pool, "messages", "tokens_used").await.unwrap());
    }

    #[tokio::test]
    async fn repair_sequences_syncs_session_message_count() {
        let pool = open_pool().await;
        run(&pool).await.unwrap();

        let session_id = uuid::Uuid::new_v4();
        sqlx::query(
            "INSERT INTO sessions (id, status, created_at, updated_at, model_name, options) \
             VALUES (?, 'idle', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z', 'claude-sonnet-4-5', '{}')",
        )
        .bind(session_id.to_string())
        .execute(&pool)
        .await
        .unwrap();

        for i in 0..3 {
            sqlx::query(
                "INSERT INTO messages (id, session_id, sequence, role, content, timestamp) \
                 VALUES (?, ?, ?, 'user', 'hi', ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(session_id.to_string())
            .bind(i)
            .bind(format!("2024-01-01T00:00:0{i}Z"))
            .execute(&pool)
            .await
            .unwrap();
        }

        repair_sequences(&pool).await.unwrap();

        let row = sqlx::query("SELECT message_count FROM sessions WHERE id = ?")
            .bind(session_id.to_string())
            .fetch_one(&pool)
            .await
            .unwrap();
        let message_count: i64 = row.try_get("message_count").unwrap();
        assert_eq!(message_count, 3);
    }
}
