use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::session::types::PermissionMode;

/// A content block of a multimodal prompt or SDK response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Thinking { text: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
    Image { source: ImageSource },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

/// Structured turn result carried by the SDK's `Result` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdkTurnResult {
    pub duration_ms: i64,
    pub api_duration_ms: i64,
    pub is_error: bool,
    pub num_turns: i64,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub usage: Option<serde_json::Value>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// The tagged union the response pump consumes (spec §2.2, §4.4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SdkMessage {
    Assistant { blocks: Vec<ContentBlock> },
    User { blocks: Vec<ContentBlock> },
    Result(SdkTurnResult),
    System { payload: serde_json::Value },
}

/// What the permission callback resolves to.
#[derive(Debug, Clone)]
pub enum PermissionDecision {
    Allow { updated_input: Option<serde_json::Value> },
    Deny { reason: String },
}

pub type CanUseToolFuture = Pin<Box<dyn Future<Output = PermissionDecision> + Send>>;
pub type CanUseTool = Arc<dyn Fn(String, serde_json::Value) -> CanUseToolFuture + Send + Sync>;

/// Everything the Session Manager composes before connecting a client
/// (spec §4.4.2). `can_use_tool` is the Permission Broker's entry point.
#[derive(Clone)]
pub struct SdkClientOptions {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub working_directory: Option<String>,
    pub permission_mode: PermissionMode,
    pub provider: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub resume: Option<String>,
    pub can_use_tool: CanUseTool,
}

/// Abstraction over the external agent SDK/CLI (out of scope per spec's
/// Non-goals — this is the seam the orchestrator is testable against).
#[async_trait]
pub trait AgentSdkClient: Send + Sync {
    async fn connect(&mut self, options: SdkClientOptions) -> Result<()>;
    async fn query(&mut self, prompt: String) -> Result<()>;
    async fn query_with_content(&mut self, blocks: Vec<ContentBlock>) -> Result<()>;
    fn receive_response(&mut self) -> mpsc::Receiver<SdkMessage>;
    async fn close(&mut self) -> Result<()>;
}
