use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::rules::{check_always_allow, Rule};
use crate::sdk::PermissionDecision;
use crate::session::manager::AgentSession;
use crate::settings::SettingsStore;

const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(300);

/// A pending tool-use approval forwarded to the owning client (spec §4.5,
/// §3 "Permission Request").
#[derive(Debug, Clone, serde::Serialize)]
pub struct PermissionRequest {
    pub request_id: Uuid,
    pub tool_name: String,
    pub input: serde_json::Value,
}

/// The client's answer, correlated back to a `PermissionRequest` by id.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PermissionResponse {
    pub request_id: Uuid,
    pub allow: bool,
    #[serde(default)]
    pub updated_input: Option<serde_json::Value>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Turn the SDK's synchronous `can_use_tool` callback into an asynchronous
/// round trip through the owning WebSocket client (spec §4.5).
///
/// Consults the Rule Engine against the project's current allow-list first;
/// on a match, returns `Allow` without ever enqueuing a request.
pub async fn evaluate(
    session: &AgentSession,
    working_directory: Option<&str>,
    tool_name: String,
    input: serde_json::Value,
) -> PermissionDecision {
    if let Some(dir) = working_directory {
        if let Some(decision) = check_rule_engine(dir, &tool_name, &input).await {
            return decision;
        }
    }

    if session.token.is_cancelled() {
        return PermissionDecision::Deny {
            reason: "session cancelled".into(),
        };
    }

    let request_id = Uuid::new_v4();
    let (tx, rx) = oneshot::channel::<PermissionResponse>();
    session.register_pending_permission(request_id, tx).await;

    let request = PermissionRequest {
        request_id,
        tool_name,
        input,
    };

    let enqueue = session.permission_tx.send(request);
    let enqueued = tokio::select! {
        result = tokio::time::timeout(ENQUEUE_TIMEOUT, enqueue) => result,
        _ = session.token.cancelled() => {
            session.remove_pending_permission(request_id).await;
            return PermissionDecision::Deny { reason: "session cancelled".into() };
        }
    };

    match enqueued {
        Ok(Ok(())) => {}
        Ok(Err(_)) => {
            session.remove_pending_permission(request_id).await;
            return PermissionDecision::Deny {
                reason: "permission channel closed".into(),
            };
        }
        Err(_) => {
            session.remove_pending_permission(request_id).await;
            return PermissionDecision::Deny {
                reason: "request timeout".into(),
            };
        }
    }

    tokio::select! {
        result = tokio::time::timeout(RESPONSE_TIMEOUT, rx) => match result {
            Ok(Ok(response)) => {
                if response.allow {
                    PermissionDecision::Allow { updated_input: response.updated_input }
                } else {
                    PermissionDecision::Deny {
                        reason: response.reason.unwrap_or_else(|| "denied by user".into()),
                    }
                }
            }
            Ok(Err(_)) => PermissionDecision::Deny { reason: "permission request dropped".into() },
            Err(_) => {
                session.remove_pending_permission(request_id).await;
                PermissionDecision::Deny { reason: "user response timeout".into() }
            }
        },
        _ = session.token.cancelled() => {
            session.remove_pending_permission(request_id).await;
            PermissionDecision::Deny { reason: "session cancelled".into() }
        }
    }
}

async fn check_rule_engine(
    working_directory: &str,
    tool_name: &str,
    input: &serde_json::Value,
) -> Option<PermissionDecision> {
    let store = SettingsStore::new(working_directory);
    store.load_settings().await.ok()?;
    let allowed = store.get_allowed().await;
    let rules: Vec<Rule> = allowed
        .iter()
        .filter_map(|s| Rule::parse(s, s.clone()))
        .collect();

    let (matched, description) = check_always_allow(&rules, tool_name, input);
    if matched {
        tracing::info!(tool = tool_name, rule = ?description, "auto-approved by stored rule");
        Some(PermissionDecision::Allow { updated_input: None })
    } else {
        None
    }
}

/// Deliver a client's answer to whichever `evaluate` call is waiting on
/// `response.request_id`. Responses with an unknown id are dropped with a
/// warning; never cross-delivered (spec §4.5).
pub async fn deliver_response(session: &AgentSession, response: PermissionResponse) {
    let request_id = response.request_id;
    if !session.resolve_pending_permission(request_id, response).await {
        tracing::warn!(%request_id, "permission response for unknown or expired request");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rule_engine_short_circuits_on_matching_allow_rule() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());
        store.add_permission("Bash(ls)").await.unwrap();

        let input = serde_json::json!({"command": "ls"});
        let decision = check_rule_engine(dir.path().to_str().unwrap(), "Bash", &input).await;
        assert!(matches!(decision, Some(PermissionDecision::Allow { .. })));
    }

    #[tokio::test]
    async fn rule_engine_passes_through_on_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());
        store.add_permission("Bash(ls)").await.unwrap();

        let input = serde_json::json!({"command": "rm -rf /"});
        let decision = check_rule_engine(dir.path().to_str().unwrap(), "Bash", &input).await;
        assert!(decision.is_none());
    }

    #[tokio::test]
    async fn rule_engine_passes_through_with_no_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = serde_json::json!({"command": "ls"});
        let decision = check_rule_engine(dir.path().to_str().unwrap(), "Bash", &input).await;
        assert!(decision.is_none());
    }
}
