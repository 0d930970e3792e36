use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{CctError, Result};
use crate::session::types::{Session, SessionOptions, SessionStatus, StatusFilter};

fn status_to_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Idle => "idle",
        SessionStatus::Active => "active",
        SessionStatus::Processing => "processing",
        SessionStatus::Error => "error",
        SessionStatus::Ended => "ended",
    }
}

fn status_from_str(s: &str) -> SessionStatus {
    match s {
        "active" => SessionStatus::Active,
        "processing" => SessionStatus::Processing,
        "error" => SessionStatus::Error,
        "ended" => SessionStatus::Ended,
        _ => SessionStatus::Idle,
    }
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<Session> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let ended_at: Option<String> = row.try_get("ended_at")?;
    let options_json: String = row.try_get("options")?;

    let options: SessionOptions = serde_json::from_str(&options_json).unwrap_or_default();

    Ok(Session {
        id: Uuid::parse_str(&id).map_err(|e| CctError::Storage(sqlx::Error::Decode(Box::new(e))))?,
        status: status_from_str(&status),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        ended_at: ended_at.map(|s| parse_ts(&s)),
        message_count: row.try_get("message_count")?,
        num_turns: row.try_get("num_turns")?,
        cost_usd: row.try_get("cost_usd")?,
        duration_ms: row.try_get("duration_ms")?,
        model_name: row.try_get("model_name")?,
        claude_session_id: row.try_get("claude_session_id")?,
        git_branch: row.try_get("git_branch")?,
        error_message: row.try_get("error_message")?,
        options,
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub async fn save_session(pool: &SqlitePool, session: &Session) -> Result<()> {
    let options_json = serde_json::to_string(&session.options)
        .map_err(|e| CctError::InvalidRequest(format!("serializing session options: {e}")))?;

    sqlx::query(
        r#"
        INSERT INTO sessions
            (id, status, created_at, updated_at, ended_at, message_count, num_turns,
             cost_usd, duration_ms, model_name, claude_session_id, git_branch, error_message, options)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(session.id.to_string())
    .bind(status_to_str(session.status))
    .bind(session.created_at.to_rfc3339())
    .bind(session.updated_at.to_rfc3339())
    .bind(session.ended_at.map(|t| t.to_rfc3339()))
    .bind(session.message_count)
    .bind(session.num_turns)
    .bind(session.cost_usd)
    .bind(session.duration_ms)
    .bind(&session.model_name)
    .bind(&session.claude_session_id)
    .bind(&session.git_branch)
    .bind(&session.error_message)
    .bind(options_json)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn update_session(pool: &SqlitePool, session: &Session) -> Result<()> {
    let options_json = serde_json::to_string(&session.options)
        .map_err(|e| CctError::InvalidRequest(format!("serializing session options: {e}")))?;

    let result = sqlx::query(
        r#"
        UPDATE sessions SET
            status = ?, updated_at = ?, ended_at = ?, message_count = ?, num_turns = ?,
            cost_usd = ?, duration_ms = ?, model_name = ?, claude_session_id = ?,
            git_branch = ?, error_message = ?, options = ?
        WHERE id = ?
        "#,
    )
    .bind(status_to_str(session.status))
    .bind(session.updated_at.to_rfc3339())
    .bind(session.ended_at.map(|t| t.to_rfc3339()))
    .bind(session.message_count)
    .bind(session.num_turns)
    .bind(session.cost_usd)
    .bind(session.duration_ms)
    .bind(&session.model_name)
    .bind(&session.claude_session_id)
    .bind(&session.git_branch)
    .bind(&session.error_message)
    .bind(options_json)
    .bind(session.id.to_string())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CctError::NotFound(session.id.to_string()));
    }
    Ok(())
}

pub async fn get_session(pool: &SqlitePool, id: Uuid) -> Result<Session> {
    let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| CctError::NotFound(id.to_string()))?;
    row_to_session(&row)
}

pub async fn list_sessions(pool: &SqlitePool, filter: StatusFilter) -> Result<Vec<Session>> {
    let rows = match filter {
        StatusFilter::All => {
            sqlx::query("SELECT * FROM sessions ORDER BY updated_at DESC")
                .fetch_all(pool)
                .await?
        }
        StatusFilter::Status(status) => {
            sqlx::query("SELECT * FROM sessions WHERE status = ? ORDER BY updated_at DESC")
                .bind(status_to_str(status))
                .fetch_all(pool)
                .await?
        }
    };

    rows.iter().map(row_to_session).collect()
}

pub async fn delete_session(pool: &SqlitePool, id: Uuid) -> Result<()> {
    let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(CctError::NotFound(id.to_string()));
    }
    Ok(())
}

/// Delete every session whose `ended_at` is older than `retention_days`.
/// Returns the count deleted. Message rows cascade via the FK.
pub async fn delete_old_sessions(pool: &SqlitePool, retention_days: i64) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days);
    let result = sqlx::query(
        "DELETE FROM sessions WHERE ended_at IS NOT NULL AND ended_at < ?",
    )
    .bind(cutoff.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
