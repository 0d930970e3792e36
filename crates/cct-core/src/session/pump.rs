use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::git;
use crate::sdk::{ContentBlock, SdkMessage};
use crate::storage::Storage;

use super::manager::AgentSession;
use super::types::{MessageRecord, MessageRole, SessionStatus};

const FORWARD_TIMEOUT: Duration = Duration::from_secs(300);

/// Launch the response pump for one turn (spec §4.4.3). Reads from the SDK's
/// per-turn channel, persists each message, forwards it unmodified to the
/// session's response channel, and returns the session to idle when the SDK
/// channel closes, the turn's result message arrives, or the turn is
/// cancelled.
pub fn spawn(
    agent: Arc<AgentSession>,
    storage: Storage,
    turn_token: CancellationToken,
    mut sdk_rx: mpsc::Receiver<SdkMessage>,
    working_directory: Option<String>,
) {
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                msg = sdk_rx.recv() => msg,
                _ = turn_token.cancelled() => None,
            };

            let Some(message) = next else {
                finish_turn(&agent, &storage).await;
                return;
            };

            refresh_git_branch(&agent, &storage, working_directory.as_deref(), &turn_token).await;

            let sequence = {
                let mut record = agent.record.lock().await;
                record.message_count += 1;
                record.message_count
            };

            persist(&agent, &storage, sequence, &message).await;

            let is_result = matches!(message, SdkMessage::Result(_));

            let forward = agent.response_channel_sender().send(message);
            let forwarded = tokio::select! {
                result = tokio::time::timeout(FORWARD_TIMEOUT, forward) => result.is_ok(),
                _ = turn_token.cancelled() => false,
            };

            if !forwarded || is_result {
                finish_turn(&agent, &storage).await;
                return;
            }
        }
    });
}

async fn refresh_git_branch(
    agent: &Arc<AgentSession>,
    storage: &Storage,
    working_directory: Option<&str>,
    turn_token: &CancellationToken,
) {
    let Some(dir) = working_directory else { return };
    if turn_token.is_cancelled() {
        return;
    }
    let branch = git::current_branch(dir).await;
    let mut record = agent.record.lock().await;
    if record.git_branch.as_deref() != Some(branch.as_str()) {
        record.git_branch = Some(branch.clone());
        record.touch();
        let snapshot = record.clone();
        drop(record);
        let _ = storage.update_session(&snapshot).await;
        let _ = agent
            .response_channel_sender()
            .send(SdkMessage::System {
                payload: serde_json::json!({"event": "branch_changed", "branch": branch}),
            })
            .await;
    }
}

async fn persist(agent: &Arc<AgentSession>, storage: &Storage, sequence: i64, message: &SdkMessage) {
    let session_id = agent.id;
    match message {
        SdkMessage::Assistant { blocks } => {
            let (content, thinking, tool_uses) = split_blocks(blocks);
            let mut record = MessageRecord::new(session_id, sequence, MessageRole::Assistant, content);
            record.thinking_content = thinking;
            record.tool_uses = tool_uses;
            let _ = storage.save_message(&record).await;
        }
        SdkMessage::User { blocks } => {
            let (content, _thinking, tool_uses) = split_blocks(blocks);
            let mut record = MessageRecord::new(session_id, sequence, MessageRole::User, content);
            record.tool_uses = tool_uses;
            let _ = storage.save_message(&record).await;
        }
        SdkMessage::Result(result) => {
            let content = serde_json::to_string(result).unwrap_or_default();
            let record = MessageRecord::new(session_id, sequence, MessageRole::System, content);
            let _ = storage.save_message(&record).await;

            let mut session = agent.record.lock().await;
            session.num_turns += 1;
            session.duration_ms = result.duration_ms;
            if let Some(cost) = result.total_cost_usd {
                session.cost_usd += cost;
            }
            if let Some(sid) = &result.session_id {
                if !sid.is_empty() && session.claude_session_id.is_none() {
                    session.claude_session_id = Some(sid.clone());
                }
            }
            session.status = SessionStatus::Idle;
            session.touch();
            let snapshot = session.clone();
            drop(session);
            let _ = storage.update_session(&snapshot).await;
        }
        SdkMessage::System { .. } => {}
    }
}

/// Split a message's content blocks into the transcript's `(content,
/// thinking, tool_uses)` columns. A message carrying an image (or any other
/// non-text block) persists its full block array as JSON in `content`
/// instead of the joined plain text, so multimodal content survives (spec
/// §3) rather than being silently dropped.
fn split_blocks(blocks: &[ContentBlock]) -> (String, Option<String>, Option<serde_json::Value>) {
    let mut text = String::new();
    let mut thinking = String::new();
    let mut tool_uses = Vec::new();
    let mut has_image = false;

    for block in blocks {
        match block {
            ContentBlock::Text { text: t } => {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(t);
            }
            ContentBlock::Thinking { text: t } => {
                if !thinking.is_empty() {
                    thinking.push('\n');
                }
                thinking.push_str(t);
            }
            ContentBlock::ToolUse { id, name, input } => {
                tool_uses.push(serde_json::json!({"id": id, "name": name, "input": input}));
            }
            ContentBlock::Image { .. } => has_image = true,
        }
    }

    let content = if has_image {
        serde_json::to_string(blocks).unwrap_or(text)
    } else {
        text
    };
    let thinking = if thinking.is_empty() { None } else { Some(thinking) };
    let tool_uses = if tool_uses.is_empty() {
        None
    } else {
        Some(serde_json::Value::Array(tool_uses))
    };
    (content, thinking, tool_uses)
}

async fn finish_turn(agent: &Arc<AgentSession>, storage: &Storage) {
    let mut record = agent.record.lock().await;
    if record.status == SessionStatus::Processing {
        record.status = SessionStatus::Idle;
        record.touch();
        let snapshot = record.clone();
        drop(record);
        let _ = storage.update_session(&snapshot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::ImageSource;

    #[test]
    fn split_blocks_joins_plain_text() {
        let blocks = vec![
            ContentBlock::Text { text: "hello".into() },
            ContentBlock::Text { text: "world".into() },
        ];
        let (content, thinking, tool_uses) = split_blocks(&blocks);
        assert_eq!(content, "hello\nworld");
        assert!(thinking.is_none());
        assert!(tool_uses.is_none());
    }

    #[test]
    fn split_blocks_preserves_images_as_json() {
        let blocks = vec![
            ContentBlock::Text { text: "see this".into() },
            ContentBlock::Image {
                source: ImageSource {
                    kind: "base64".into(),
                    media_type: "image/png".into(),
                    data: "Zm9v".into(),
                },
            },
        ];
        let (content, _, _) = split_blocks(&blocks);

        // Not the plain joined text: the image must survive in the persisted content.
        assert_ne!(content, "see this");
        let decoded: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(decoded.as_array().unwrap().len(), 2);
        assert_eq!(decoded[1]["source"]["media_type"], "image/png");
    }

    #[test]
    fn split_blocks_collects_tool_uses_and_thinking() {
        let blocks = vec![
            ContentBlock::Thinking { text: "pondering".into() },
            ContentBlock::ToolUse {
                id: "t1".into(),
                name: "Bash".into(),
                input: serde_json::json!({"command": "ls"}),
            },
        ];
        let (content, thinking, tool_uses) = split_blocks(&blocks);
        assert_eq!(content, "");
        assert_eq!(thinking.as_deref(), Some("pondering"));
        let tool_uses = tool_uses.unwrap();
        assert_eq!(tool_uses[0]["name"], "Bash");
    }
}
