use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{CctError, Result};
use crate::session::types::{MessageRecord, MessageRole};

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<MessageRecord> {
    let id: String = row.try_get("id")?;
    let session_id: String = row.try_get("session_id")?;
    let role: String = row.try_get("role")?;
    let timestamp: String = row.try_get("timestamp")?;
    let tool_uses_json: Option<String> = row.try_get("tool_uses")?;

    Ok(MessageRecord {
        id: Uuid::parse_str(&id).map_err(|e| CctError::Storage(sqlx::Error::Decode(Box::new(e))))?,
        session_id: Uuid::parse_str(&session_id)
            .map_err(|e| CctError::Storage(sqlx::Error::Decode(Box::new(e))))?,
        sequence: row.try_get("sequence")?,
        role: MessageRole::parse(&role).unwrap_or(MessageRole::System),
        content: row.try_get("content")?,
        thinking_content: row.try_get("thinking_content")?,
        tool_uses: tool_uses_json
            .and_then(|s| serde_json::from_str(&s).ok()),
        timestamp: parse_ts(&timestamp),
        tokens_used: row.try_get("tokens_used")?,
    })
}

pub async fn save_message(pool: &SqlitePool, msg: &MessageRecord) -> Result<()> {
    let tool_uses_json = msg
        .tool_uses
        .as_ref()
        .map(|v| serde_json::to_string(v))
        .transpose()
        .map_err(|e| CctError::InvalidRequest(format!("serializing tool_uses: {e}")))?;

    sqlx::query(
        r#"
        INSERT INTO messages
            (id, session_id, sequence, role, content, thinking_content, tool_uses, timestamp, tokens_used)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(msg.id.to_string())
    .bind(msg.session_id.to_string())
    .bind(msg.sequence)
    .bind(msg.role.as_str())
    .bind(&msg.content)
    .bind(&msg.thinking_content)
    .bind(tool_uses_json)
    .bind(msg.timestamp.to_rfc3339())
    .bind(msg.tokens_used)
    .execute(pool)
    .await?;

    Ok(())
}

/// Page through a session's transcript. Over-fetches `limit + 1` rows and
/// reports `has_more` from the surplus row, which is trimmed before return —
/// callers never see the sentinel (spec §4.1).
pub async fn get_messages(
    pool: &SqlitePool,
    session_id: Uuid,
    limit: i64,
    offset: i64,
) -> Result<(Vec<MessageRecord>, bool)> {
    let rows = sqlx::query(
        "SELECT * FROM messages WHERE session_id = ? ORDER BY sequence ASC LIMIT ? OFFSET ?",
    )
    .bind(session_id.to_string())
    .bind(limit + 1)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let has_more = rows.len() as i64 > limit;
    let mut messages: Vec<MessageRecord> = rows.iter().map(row_to_message).collect::<Result<_>>()?;
    if has_more {
        messages.truncate(limit as usize);
    }

    Ok((messages, has_more))
}

pub async fn get_message_count(pool: &SqlitePool, session_id: Uuid) -> Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) as c FROM messages WHERE session_id = ?")
        .bind(session_id.to_string())
        .fetch_one(pool)
        .await?;
    Ok(row.try_get("c")?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::SessionOptions;
    use crate::storage::sessions::save_session;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn open_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::storage::migrations::run(&pool).await.unwrap();
        pool
    }

    async fn seed_session(pool: &SqlitePool) -> Uuid {
        let id = Uuid::new_v4();
        let session = crate::session::types::Session::new(id, "claude-sonnet-4-5".into(), SessionOptions::default());
        save_session(pool, &session).await.unwrap();
        id
    }

    #[tokio::test]
    async fn pagination_reports_has_more_and_trims_sentinel_row() {
        let pool = open_pool().await;
        let session_id = seed_session(&pool).await;

        for i in 0..5 {
            let msg = MessageRecord::new(session_id, i + 1, MessageRole::User, format!("message {i}"));
            save_message(&pool, &msg).await.unwrap();
        }

        let (page, has_more) = get_messages(&pool, session_id, 3, 0).await.unwrap();
        assert_eq!(page.len(), 3);
        assert!(has_more);
        assert_eq!(page[0].content, "message 0");
        assert_eq!(page[2].content, "message 2");

        let (last_page, has_more) = get_messages(&pool, session_id, 3, 3).await.unwrap();
        assert_eq!(last_page.len(), 2);
        assert!(!has_more);
    }

    #[tokio::test]
    async fn tool_uses_round_trip_as_json() {
        let pool = open_pool().await;
        let session_id = seed_session(&pool).await;

        let mut msg = MessageRecord::new(session_id, 1, MessageRole::Assistant, "using a tool");
        msg.tool_uses = Some(serde_json::json!([{"id": "t1", "name": "Bash", "input": {"command": "ls"}}]));
        save_message(&pool, &msg).await.unwrap();

        let (page, _) = get_messages(&pool, session_id, 10, 0).await.unwrap();
        assert_eq!(page.len(), 1);
        let tool_uses = page[0].tool_uses.as_ref().unwrap();
        assert_eq!(tool_uses[0]["name"], "Bash");
    }

    #[tokio::test]
    async fn message_count_reflects_inserted_rows() {
        let pool = open_pool().await;
        let session_id = seed_session(&pool).await;

        assert_eq!(get_message_count(&pool, session_id).await.unwrap(), 0);
        save_message(&pool, &MessageRecord::new(session_id, 1, MessageRole::User, "hi")).await.unwrap();
        save_message(&pool, &MessageRecord::new(session_id, 2, MessageRole::Assistant, "hello")).await.unwrap();
        assert_eq!(get_message_count(&pool, session_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn sequence_repair_is_idempotent_across_reruns() {
        let pool = open_pool().await;
        let session_id = seed_session(&pool).await;

        // Insert out of timestamp order with duplicate/garbled sequences, as a
        // crash mid-turn might leave behind.
        let mut first = MessageRecord::new(session_id, 7, MessageRole::User, "first");
        first.timestamp = Utc::now() - chrono::Duration::seconds(10);
        let mut second = MessageRecord::new(session_id, 7, MessageRole::Assistant, "second");
        second.timestamp = Utc::now() - chrono::Duration::seconds(5);
        save_message(&pool, &first).await.unwrap();
        save_message(&pool, &second).await.unwrap();

        crate::storage::migrations::run(&pool).await.unwrap();
        let (page, _) = get_messages(&pool, session_id, 10, 0).await.unwrap();
        assert_eq!(page[0].sequence, 1);
        assert_eq!(page[1].sequence, 2);

        // Running it again must be a no-op: sequences are already dense and
        // ordered, so repair should leave them untouched.
        crate::storage::migrations::run(&pool).await.unwrap();
        let (page_again, _) = get_messages(&pool, session_id, 10, 0).await.unwrap();
        assert_eq!(page_again[0].sequence, 1);
        assert_eq!(page_again[1].sequence, 2);
    }
}
