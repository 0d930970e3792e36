use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cct_core::sdk::ContentBlock;
use cct_core::{MessageRecord, Session, SessionOptions, StatusFilter};

/// Inbound frame decoded from a client socket (spec §6).
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Auth {
        #[serde(default)]
        token: Option<String>,
    },
    CreateSession {
        session_id: Uuid,
        options: SessionOptions,
    },
    SendPrompt {
        session_id: Uuid,
        #[serde(default)]
        prompt: Option<String>,
        #[serde(default)]
        content: Option<Vec<ContentBlock>>,
    },
    EndSession {
        session_id: Uuid,
    },
    InterruptSession {
        session_id: Uuid,
    },
    DeleteSession {
        session_id: Uuid,
    },
    DeleteAllSessions {},
    ListSessions {
        #[serde(default)]
        status: Option<String>,
    },
    LoadMessages {
        session_id: Uuid,
        limit: i64,
        offset: i64,
    },
    KillAllAgents {},
    PermissionResponse {
        session_id: Uuid,
        permission_id: Uuid,
        approved: bool,
        #[serde(default)]
        updated_input: Option<serde_json::Value>,
        #[serde(default)]
        deny_message: Option<String>,
    },
    Ping {},
}

impl InboundMessage {
    pub fn to_core_permission_response(
        permission_id: Uuid,
        approved: bool,
        updated_input: Option<serde_json::Value>,
        deny_message: Option<String>,
    ) -> cct_core::PermissionResponse {
        cct_core::PermissionResponse {
            request_id: permission_id,
            allow: approved,
            updated_input,
            reason: deny_message,
        }
    }
}

/// Outbound frame encoded to a client socket (spec §6).
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    AuthSuccess {},
    SessionCreated {
        session_id: Uuid,
        session: Session,
        status: &'static str,
    },
    SessionEnded {
        session_id: Uuid,
    },
    SessionInterrupted {
        session_id: Uuid,
    },
    SessionDeleted {
        session_id: Uuid,
    },
    SessionsList {
        sessions: Vec<Session>,
    },
    MessagesLoaded {
        session_id: Uuid,
        count: usize,
        limit: i64,
        offset: i64,
        has_more: bool,
        messages: Vec<MessageRecord>,
    },
    AgentMessage {
        session_id: Uuid,
        content: cct_core::SdkMessage,
    },
    AgentThinking {
        session_id: Uuid,
        text: String,
    },
    AgentToolUse {
        session_id: Uuid,
        id: String,
        name: String,
        input: serde_json::Value,
    },
    AgentError {
        session_id: Uuid,
        error: String,
    },
    PermissionRequest {
        session_id: Uuid,
        permission_id: Uuid,
        tool: String,
        action: String,
        details: serde_json::Value,
        description: String,
    },
    PermissionAcknowledged {
        permission_id: Uuid,
    },
    AgentsKilled {
        count: usize,
    },
    AllSessionsDeleted {
        count: usize,
    },
    SessionUpdated {
        session_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        git_branch: Option<String>,
    },
    Error {
        message: String,
    },
    Pong {},
}

pub fn status_filter_from_str(s: Option<&str>) -> StatusFilter {
    match s {
        None | Some("all") => StatusFilter::All,
        Some("idle") => StatusFilter::Status(cct_core::SessionStatus::Idle),
        Some("active") => StatusFilter::Status(cct_core::SessionStatus::Active),
        Some("processing") => StatusFilter::Status(cct_core::SessionStatus::Processing),
        Some("error") => StatusFilter::Status(cct_core::SessionStatus::Error),
        Some("ended") => StatusFilter::Status(cct_core::SessionStatus::Ended),
        Some(_) => StatusFilter::All,
    }
}

/// Render a human-readable permission prompt from a raw tool request.
pub fn describe_permission_request(tool_name: &str, input: &serde_json::Value) -> String {
    match tool_name {
        "Bash" => format!(
            "Run command: {}",
            input.get("command").and_then(|v| v.as_str()).unwrap_or("?")
        ),
        "Read" | "Write" | "Edit" => format!(
            "{tool_name} {}",
            input.get("file_path").and_then(|v| v.as_str()).unwrap_or("?")
        ),
        other => format!("Use {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_filter_defaults_to_all() {
        assert_eq!(status_filter_from_str(None), StatusFilter::All);
        assert_eq!(status_filter_from_str(Some("all")), StatusFilter::All);
        assert_eq!(status_filter_from_str(Some("bogus")), StatusFilter::All);
    }

    #[test]
    fn status_filter_parses_known_statuses() {
        assert_eq!(
            status_filter_from_str(Some("processing")),
            StatusFilter::Status(cct_core::SessionStatus::Processing)
        );
        assert_eq!(
            status_filter_from_str(Some("ended")),
            StatusFilter::Status(cct_core::SessionStatus::Ended)
        );
    }

    #[test]
    fn describe_permission_request_formats_bash() {
        let input = serde_json::json!({"command": "rm -rf /tmp/x"});
        assert_eq!(
            describe_permission_request("Bash", &input),
            "Run command: rm -rf /tmp/x"
        );
    }

    #[test]
    fn describe_permission_request_formats_file_tools() {
        let input = serde_json::json!({"file_path": "/etc/hosts"});
        assert_eq!(describe_permission_request("Write", &input), "Write /etc/hosts");
        assert_eq!(describe_permission_request("Edit", &input), "Edit /etc/hosts");
    }

    #[test]
    fn describe_permission_request_falls_back_for_unknown_tools() {
        let input = serde_json::json!({});
        assert_eq!(describe_permission_request("Glob", &input), "Use Glob");
    }

    #[test]
    fn describe_permission_request_handles_missing_fields() {
        let input = serde_json::json!({});
        assert_eq!(describe_permission_request("Bash", &input), "Run command: ?");
        assert_eq!(describe_permission_request("Read", &input), "Read ?");
    }
}
