use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a session. `Ended` is terminal — (I3) it never
/// transitions back to any other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Active,
    Processing,
    Error,
    Ended,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Ended)
    }
}

/// How aggressively the session auto-approves tool use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMode {
    Default,
    AllowAll,
    ReadOnly,
}

impl Default for PermissionMode {
    fn default() -> Self {
        PermissionMode::Default
    }
}

/// Structured session configuration, persisted as a single JSON blob (spec §3,
/// §9 "Options persistence") so adding a field later never requires a schema
/// migration — unknown/missing fields just take their `#[serde(default)]`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default, rename = "tools")]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, rename = "baseURL")]
    pub base_url: Option<String>,
    #[serde(default, rename = "apiKey")]
    pub api_key: Option<String>,
}

/// One multi-turn conversation, persisted across reconnects and restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message_count: i64,
    #[serde(default)]
    pub num_turns: i64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub duration_ms: i64,
    pub model_name: String,
    #[serde(default)]
    pub claude_session_id: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub options: SessionOptions,
}

impl Session {
    pub fn new(id: Uuid, model_name: String, options: SessionOptions) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: SessionStatus::Idle,
            created_at: now,
            updated_at: now,
            ended_at: None,
            message_count: 0,
            num_turns: 0,
            cost_usd: 0.0,
            duration_ms: 0,
            model_name,
            claude_session_id: None,
            git_branch: None,
            error_message: None,
            options,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Closed role set (M3): a message is always one of these three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

/// One entry in a session's ordered transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub sequence: i64,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub thinking_content: Option<String>,
    /// JSON array of `{id, name, input}`.
    #[serde(default)]
    pub tool_uses: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tokens_used: i64,
}

impl MessageRecord {
    pub fn new(session_id: Uuid, sequence: i64, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            sequence,
            role,
            content: content.into(),
            thinking_content: None,
            tool_uses: None,
            timestamp: Utc::now(),
            tokens_used: 0,
        }
    }
}

/// Status filter for `list_sessions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    All,
    Status(SessionStatus),
}
