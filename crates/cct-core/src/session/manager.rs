use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::{CctError, Result};
use crate::git;
use crate::permission::{self, PermissionRequest, PermissionResponse};
use crate::sdk::{AgentSdkClient, CanUseToolFuture, SdkClientOptions, SdkMessage};
use crate::storage::Storage;

use super::pump;
use super::types::{MessageRecord, MessageRole, Session, SessionOptions, SessionStatus, StatusFilter};

const RESPONSE_CHANNEL_BUFFER: usize = 10;
const PERMISSION_CHANNEL_BUFFER: usize = 16;

/// Factory producing a fresh SDK client handle. The server wires one that
/// builds `SubprocessSdkClient`; tests wire one that builds `MockSdkClient`
/// (spec §2.2).
pub type SdkClientFactory = Arc<dyn Fn() -> Box<dyn AgentSdkClient> + Send + Sync>;

/// In-memory coordination state for one live session (spec §4.4).
pub struct AgentSession {
    pub id: Uuid,
    pub record: Mutex<Session>,
    pub token: CancellationToken,
    turn_token: Mutex<Option<CancellationToken>>,
    response_tx: mpsc::Sender<SdkMessage>,
    response_rx: Arc<Mutex<mpsc::Receiver<SdkMessage>>>,
    pub(crate) permission_tx: mpsc::Sender<PermissionRequest>,
    permission_rx: Arc<Mutex<mpsc::Receiver<PermissionRequest>>>,
    pending_permissions: Mutex<HashMap<Uuid, oneshot::Sender<PermissionResponse>>>,
    pub forwarder_started: AtomicBool,
    client: Mutex<Option<Box<dyn AgentSdkClient>>>,
}

impl AgentSession {
    fn new(record: Session) -> Arc<Self> {
        let (response_tx, response_rx) = mpsc::channel(RESPONSE_CHANNEL_BUFFER);
        let (permission_tx, permission_rx) = mpsc::channel(PERMISSION_CHANNEL_BUFFER);
        Arc::new(Self {
            id: record.id,
            record: Mutex::new(record),
            token: CancellationToken::new(),
            turn_token: Mutex::new(None),
            response_tx,
            response_rx: Arc::new(Mutex::new(response_rx)),
            permission_tx,
            permission_rx: Arc::new(Mutex::new(permission_rx)),
            pending_permissions: Mutex::new(HashMap::new()),
            forwarder_started: AtomicBool::new(false),
            client: Mutex::new(None),
        })
    }

    pub fn response_channel(&self) -> Arc<Mutex<mpsc::Receiver<SdkMessage>>> {
        self.response_rx.clone()
    }

    pub(crate) fn response_channel_sender(&self) -> mpsc::Sender<SdkMessage> {
        self.response_tx.clone()
    }

    pub fn permission_channel(&self) -> Arc<Mutex<mpsc::Receiver<PermissionRequest>>> {
        self.permission_rx.clone()
    }

    pub(crate) async fn register_pending_permission(
        &self,
        request_id: Uuid,
        tx: oneshot::Sender<PermissionResponse>,
    ) {
        self.pending_permissions.lock().await.insert(request_id, tx);
    }

    pub(crate) async fn remove_pending_permission(&self, request_id: Uuid) {
        self.pending_permissions.lock().await.remove(&request_id);
    }

    pub(crate) async fn resolve_pending_permission(
        &self,
        request_id: Uuid,
        response: PermissionResponse,
    ) -> bool {
        let sender = self.pending_permissions.lock().await.remove(&request_id);
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// A child of the session token, fresh per turn, so `interrupt_session`
    /// can cancel only the in-flight turn without ending the session.
    async fn new_turn_token(&self) -> CancellationToken {
        let child = self.token.child_token();
        *self.turn_token.lock().await = Some(child.clone());
        child
    }

    async fn interrupt(&self) {
        if let Some(turn) = self.turn_token.lock().await.take() {
            turn.cancel();
        }
    }
}

/// Coordinates every in-flight session (spec §4.4). A single process-wide
/// lock guards the session map, mirroring the teacher's single-mutex
/// discipline around shared state.
pub struct SessionManager {
    storage: Storage,
    config: Arc<ServerConfig>,
    sdk_factory: SdkClientFactory,
    sessions: Mutex<HashMap<Uuid, Arc<AgentSession>>>,
}

impl SessionManager {
    pub fn new(storage: Storage, config: Arc<ServerConfig>, sdk_factory: SdkClientFactory) -> Self {
        Self {
            storage,
            config,
            sdk_factory,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create a new session, or restore one already persisted under `id`
    /// (spec §4.4.1).
    pub async fn create_session(&self, id: Uuid, options: SessionOptions) -> Result<Session> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&id) {
            return Err(CctError::AlreadyExists(id.to_string()));
        }
        if sessions.len() >= self.config.max_sessions {
            return Err(CctError::CapacityExceeded(format!(
                "max_sessions ({}) reached",
                self.config.max_sessions
            )));
        }

        let record = match self.storage.get_session(id).await {
            Ok(mut stored) => {
                stored.options = options;
                if stored.options.working_directory.is_some() && stored.git_branch.as_deref().unwrap_or("").is_empty() {
                    if let Some(dir) = stored.options.working_directory.clone() {
                        stored.git_branch = Some(git::current_branch(&dir).await);
                    }
                }
                stored.touch();
                self.storage.update_session(&stored).await?;
                stored
            }
            Err(CctError::NotFound(_)) => {
                let model = options.model.clone().unwrap_or_else(|| self.config.model.clone());
                let mut record = Session::new(id, model, options);
                if let Some(dir) = record.options.working_directory.clone() {
                    record.git_branch = Some(git::current_branch(&dir).await);
                }
                self.storage.save_session(&record).await?;
                record
            }
            Err(e) => return Err(e),
        };

        let agent_session = AgentSession::new(record.clone());
        sessions.insert(id, agent_session);
        Ok(record)
    }

    /// Fetch the in-memory coordination handle for `id`, for the WebSocket
    /// layer to wire up its permission-forwarder and response-drainer tasks.
    pub async fn agent_handle(&self, id: Uuid) -> Result<Arc<AgentSession>> {
        let sessions = self.sessions.lock().await;
        self.agent_session(&sessions, id)
    }

    pub async fn get_session_snapshot(&self, id: Uuid) -> Result<Session> {
        let sessions = self.sessions.lock().await;
        match sessions.get(&id) {
            Some(agent) => Ok(agent.record.lock().await.clone()),
            None => self.storage.get_session(id).await,
        }
    }

    pub async fn list_sessions(&self, filter: StatusFilter) -> Result<Vec<Session>> {
        self.storage.list_sessions(filter).await
    }

    pub async fn load_messages(
        &self,
        session_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<MessageRecord>, bool)> {
        self.storage.get_session(session_id).await?;
        self.storage.get_messages(session_id, limit, offset).await
    }

    fn agent_session(&self, sessions: &HashMap<Uuid, Arc<AgentSession>>, id: Uuid) -> Result<Arc<AgentSession>> {
        sessions.get(&id).cloned().ok_or_else(|| CctError::NotFound(id.to_string()))
    }

    /// Send a text prompt, launching the response pump in the background
    /// (spec §4.4.2). Returns once the pump has been started, not once the
    /// turn has finished.
    pub async fn send_prompt(&self, session_id: Uuid, prompt: String) -> Result<()> {
        self.send_prompt_with_content(session_id, vec![crate::sdk::ContentBlock::Text { text: prompt }])
            .await
    }

    pub async fn send_prompt_with_content(
        &self,
        session_id: Uuid,
        blocks: Vec<crate::sdk::ContentBlock>,
    ) -> Result<()> {
        let agent = {
            let sessions = self.sessions.lock().await;
            self.agent_session(&sessions, session_id)?
        };

        let (sequence, provider) = {
            let mut record = agent.record.lock().await;
            if record.status == SessionStatus::Processing {
                return Err(CctError::InvalidRequest("session is already processing a turn".into()));
            }
            record.status = SessionStatus::Processing;
            record.message_count += 1;
            record.touch();
            self.storage.update_session(&record).await?;
            (record.message_count, record.options.provider.clone())
        };

        let content_text = render_blocks_as_content(&blocks);
        let user_message = MessageRecord::new(session_id, sequence, MessageRole::User, content_text);
        self.storage.save_message(&user_message).await?;

        let working_directory = agent.record.lock().await.options.working_directory.clone();

        let sdk_rx = match self.connect_and_query(&agent, &blocks, provider.as_deref()).await {
            Ok(rx) => rx,
            Err(e) => {
                let mut record = agent.record.lock().await;
                record.status = SessionStatus::Error;
                record.error_message = Some(e.to_string());
                record.touch();
                let _ = self.storage.update_session(&record).await;
                return Err(e);
            }
        };

        let turn_token = agent.new_turn_token().await;
        pump::spawn(agent.clone(), self.storage.clone(), turn_token, sdk_rx, working_directory);
        Ok(())
    }

    async fn connect_and_query(
        &self,
        agent: &Arc<AgentSession>,
        blocks: &[crate::sdk::ContentBlock],
        provider: Option<&str>,
    ) -> Result<mpsc::Receiver<SdkMessage>> {
        let (permission_mode, working_directory, system_prompt, model_override, base_url_override, api_key_override, resume, provider_id) = {
            let record = agent.record.lock().await;
            (
                record.options.permission_mode,
                record.options.working_directory.clone(),
                record.options.system_prompt.clone(),
                record.options.model.clone(),
                record.options.base_url.clone(),
                record.options.api_key.clone(),
                record.claude_session_id.clone(),
                provider.unwrap_or("anthropic").to_string(),
            )
        };

        let model = model_override.or_else(|| Some(self.config.model.clone()));
        let base_url = self.config.resolve_base_url(&provider_id, base_url_override.as_deref());
        let api_key = self.config.resolve_api_key(&provider_id, api_key_override.as_deref());

        let agent_for_callback = agent.clone();
        let working_directory_for_callback = working_directory.clone();
        let can_use_tool: crate::sdk::CanUseTool = Arc::new(move |tool_name, input| {
            let agent = agent_for_callback.clone();
            let working_directory = working_directory_for_callback.clone();
            let fut: CanUseToolFuture = Box::pin(async move {
                permission::evaluate(&agent, working_directory.as_deref(), tool_name, input).await
            });
            fut
        });

        let sdk_options = SdkClientOptions {
            model,
            system_prompt,
            working_directory,
            permission_mode,
            provider: Some(provider_id),
            base_url,
            api_key,
            resume,
            can_use_tool,
        };

        let mut client_guard = agent.client.lock().await;
        if client_guard.is_none() {
            let mut client = (self.sdk_factory)();
            client.connect(sdk_options).await?;
            *client_guard = Some(client);
        }
        let client = client_guard.as_mut().expect("client just populated");
        client.query_with_content(blocks.to_vec()).await?;
        let rx = client.receive_response();
        Ok(rx)
    }

    /// Cancel the current turn without ending the session (spec §4.6).
    pub async fn interrupt_session(&self, session_id: Uuid) -> Result<()> {
        let sessions = self.sessions.lock().await;
        let agent = self.agent_session(&sessions, session_id)?;
        agent.interrupt().await;
        let mut record = agent.record.lock().await;
        record.status = SessionStatus::Idle;
        record.touch();
        self.storage.update_session(&record).await?;
        Ok(())
    }

    pub async fn submit_permission_response(&self, session_id: Uuid, response: PermissionResponse) -> Result<()> {
        let sessions = self.sessions.lock().await;
        let agent = self.agent_session(&sessions, session_id)?;
        permission::deliver_response(&agent, response).await;
        Ok(())
    }

    async fn teardown(&self, agent: &Arc<AgentSession>) -> Result<()> {
        agent.token.cancel();
        let mut client_guard = agent.client.lock().await;
        if let Some(client) = client_guard.as_mut() {
            let _ = client.close().await;
        }
        *client_guard = None;
        drop(client_guard);

        let mut record = agent.record.lock().await;
        record.status = SessionStatus::Ended;
        record.duration_ms = (chrono::Utc::now() - record.created_at).num_milliseconds();
        record.ended_at = Some(chrono::Utc::now());
        record.touch();
        self.storage.update_session(&record).await?;
        Ok(())
    }

    pub async fn end_session(&self, session_id: Uuid) -> Result<()> {
        let agent = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(&session_id).ok_or_else(|| CctError::NotFound(session_id.to_string()))?
        };
        self.teardown(&agent).await
    }

    pub async fn delete_session(&self, session_id: Uuid) -> Result<()> {
        if let Some(agent) = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(&session_id)
        } {
            let _ = self.teardown(&agent).await;
        }
        self.storage.delete_session(session_id).await
    }

    pub async fn end_all_sessions(&self) -> Result<usize> {
        let agents: Vec<Arc<AgentSession>> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, v)| v).collect()
        };
        let count = agents.len();
        for agent in &agents {
            let _ = self.teardown(agent).await;
        }
        Ok(count)
    }

    pub async fn delete_sessions_older_than(&self, retention_days: i64) -> Result<u64> {
        self.storage.delete_old_sessions(retention_days).await
    }

    pub async fn delete_all_sessions(&self) -> Result<usize> {
        self.end_all_sessions().await?;
        let all = self.storage.list_sessions(StatusFilter::All).await?;
        let count = all.len();
        for session in all {
            self.storage.delete_session(session.id).await?;
        }
        Ok(count)
    }
}

/// Render a prompt's content blocks for persistence. Plain-text-only prompts
/// store their joined text directly; a prompt carrying an image (or any other
/// non-text block) persists the full block array as JSON instead, per the
/// multimodal content contract (spec §3) — never silently dropping blocks.
fn render_blocks_as_content(blocks: &[crate::sdk::ContentBlock]) -> String {
    let all_text = blocks.iter().all(|b| matches!(b, crate::sdk::ContentBlock::Text { .. }));
    if all_text {
        blocks
            .iter()
            .filter_map(|b| match b {
                crate::sdk::ContentBlock::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        serde_json::to_string(blocks).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::sdk::{ContentBlock, SdkTurnResult};

    use super::*;

    async fn test_manager(max_sessions: usize, script: Vec<SdkMessage>) -> (SessionManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(&dir.path().join("test.db")).await.unwrap();
        let config = Arc::new(ServerConfig {
            max_sessions,
            ..ServerConfig::default()
        });
        let factory: SdkClientFactory = Arc::new(move || {
            Box::new(crate::sdk::MockSdkClient::new(script.clone())) as Box<dyn AgentSdkClient>
        });
        (SessionManager::new(storage, config, factory), dir)
    }

    async fn wait_for_idle(manager: &SessionManager, id: Uuid) -> Session {
        for _ in 0..100 {
            let snapshot = manager.get_session_snapshot(id).await.unwrap();
            if snapshot.status != SessionStatus::Processing {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never left processing state");
    }

    #[tokio::test]
    async fn create_session_enforces_max_sessions() {
        let (manager, _dir) = test_manager(1, vec![]).await;
        manager.create_session(Uuid::new_v4(), SessionOptions::default()).await.unwrap();

        let err = manager
            .create_session(Uuid::new_v4(), SessionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CctError::CapacityExceeded(_)));
    }

    #[tokio::test]
    async fn create_session_rejects_duplicate_live_id() {
        let (manager, _dir) = test_manager(10, vec![]).await;
        let id = Uuid::new_v4();
        manager.create_session(id, SessionOptions::default()).await.unwrap();
        let err = manager.create_session(id, SessionOptions::default()).await.unwrap_err();
        assert!(matches!(err, CctError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn load_messages_after_delete_session_errors() {
        let (manager, _dir) = test_manager(10, vec![]).await;
        let id = Uuid::new_v4();
        manager.create_session(id, SessionOptions::default()).await.unwrap();
        manager.delete_session(id).await.unwrap();

        let err = manager.load_messages(id, 10, 0).await.unwrap_err();
        assert!(matches!(err, CctError::NotFound(_)));
    }

    #[tokio::test]
    async fn load_messages_for_unknown_session_errors() {
        let (manager, _dir) = test_manager(10, vec![]).await;
        let err = manager.load_messages(Uuid::new_v4(), 10, 0).await.unwrap_err();
        assert!(matches!(err, CctError::NotFound(_)));
    }

    #[tokio::test]
    async fn send_prompt_persists_transcript_and_completes_turn() {
        let script = vec![
            SdkMessage::Assistant { blocks: vec![ContentBlock::Text { text: "hi there".into() }] },
            SdkMessage::Result(SdkTurnResult {
                duration_ms: 42,
                api_duration_ms: 20,
                is_error: false,
                num_turns: 1,
                total_cost_usd: Some(0.01),
                usage: None,
                session_id: Some("claude-session-abc".into()),
            }),
        ];
        let (manager, _dir) = test_manager(10, script).await;
        let id = Uuid::new_v4();
        manager.create_session(id, SessionOptions::default()).await.unwrap();

        manager.send_prompt(id, "hello".into()).await.unwrap();
        let snapshot = wait_for_idle(&manager, id).await;

        assert_eq!(snapshot.status, SessionStatus::Idle);
        assert_eq!(snapshot.num_turns, 1);
        assert_eq!(snapshot.claude_session_id.as_deref(), Some("claude-session-abc"));

        let (messages, has_more) = manager.load_messages(id, 10, 0).await.unwrap();
        assert!(!has_more);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].content, "hi there");
        assert_eq!(messages[2].role, MessageRole::System);
    }

    #[tokio::test]
    async fn claude_session_id_is_immutable_across_turns() {
        let script = vec![SdkMessage::Result(SdkTurnResult {
            duration_ms: 1,
            api_duration_ms: 1,
            is_error: false,
            num_turns: 1,
            total_cost_usd: None,
            usage: None,
            session_id: Some("claude-first".into()),
        })];
        let (manager, _dir) = test_manager(10, script).await;
        let id = Uuid::new_v4();
        manager.create_session(id, SessionOptions::default()).await.unwrap();

        manager.send_prompt(id, "one".into()).await.unwrap();
        let snapshot = wait_for_idle(&manager, id).await;
        assert_eq!(snapshot.claude_session_id.as_deref(), Some("claude-first"));

        // A second turn whose Result carries a different upstream session id
        // must never overwrite the one recorded on the first turn.
        manager.send_prompt(id, "two".into()).await.unwrap();
        let snapshot = wait_for_idle(&manager, id).await;
        assert_eq!(snapshot.claude_session_id.as_deref(), Some("claude-first"));
    }

    #[tokio::test]
    async fn send_prompt_rejects_concurrent_turn_on_same_session() {
        let (manager, _dir) = test_manager(10, vec![]).await;
        let id = Uuid::new_v4();
        manager.create_session(id, SessionOptions::default()).await.unwrap();

        {
            let agent = manager.agent_handle(id).await.unwrap();
            agent.record.lock().await.status = SessionStatus::Processing;
        }

        let err = manager.send_prompt(id, "hello".into()).await.unwrap_err();
        assert!(matches!(err, CctError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn permission_response_resolves_the_matching_pending_request() {
        let (manager, _dir) = test_manager(10, vec![]).await;
        let id = Uuid::new_v4();
        manager.create_session(id, SessionOptions::default()).await.unwrap();
        let agent = manager.agent_handle(id).await.unwrap();

        let eval_agent = agent.clone();
        let handle = tokio::spawn(async move {
            crate::permission::evaluate(
                &eval_agent,
                None,
                "Bash".to_string(),
                serde_json::json!({"command": "ls"}),
            )
            .await
        });

        let request = {
            let channel = agent.permission_channel();
            let mut rx = channel.lock().await;
            rx.recv().await.expect("permission request enqueued")
        };

        // A response carrying an unrelated id must not resolve this request.
        let stray = PermissionResponse {
            request_id: Uuid::new_v4(),
            allow: true,
            updated_input: None,
            reason: None,
        };
        manager.submit_permission_response(id, stray).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_finished());

        let response = PermissionResponse {
            request_id: request.request_id,
            allow: true,
            updated_input: None,
            reason: None,
        };
        manager.submit_permission_response(id, response).await.unwrap();

        let decision = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("evaluate should resolve promptly")
            .unwrap();
        assert!(matches!(decision, crate::sdk::PermissionDecision::Allow { .. }));
    }

    #[tokio::test]
    async fn interrupt_unknown_session_is_not_found() {
        let (manager, _dir) = test_manager(10, vec![]).await;
        let err = manager.interrupt_session(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, CctError::NotFound(_)));
    }
}
