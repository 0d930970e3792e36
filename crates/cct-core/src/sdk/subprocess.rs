use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use crate::error::{CctError, Result};

use super::client::{AgentSdkClient, ContentBlock, SdkClientOptions, SdkMessage};

type CurrentSender = Arc<Mutex<Option<mpsc::Sender<SdkMessage>>>>;

/// Minimal concrete adapter spawning the configured CLI binary
/// (`cct.agentCommand`, default `claude`) and speaking newline-delimited
/// JSON over its stdin/stdout. The wire format with the subprocess is an
/// implementation detail, not part of the orchestrator's contract (spec
/// §2.2) — this is intentionally the smallest adapter that satisfies it.
///
/// The background stdout reader is spawned once, at `connect`, and lives for
/// the whole connection; each `query_with_content` call re-arms it with a
/// fresh per-turn channel so `receive_response` always hands back a receiver
/// scoped to the turn just started, even though the connection (and the
/// reader task) is reused across turns.
pub struct SubprocessSdkClient {
    command: String,
    child: Option<Child>,
    current_tx: CurrentSender,
    rx: Option<mpsc::Receiver<SdkMessage>>,
}

impl SubprocessSdkClient {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            child: None,
            current_tx: Arc::new(Mutex::new(None)),
            rx: None,
        }
    }
}

#[async_trait]
impl AgentSdkClient for SubprocessSdkClient {
    async fn connect(&mut self, options: SdkClientOptions) -> Result<()> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("--output-format").arg("stream-json");
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());

        if let Some(dir) = &options.working_directory {
            cmd.current_dir(dir);
        }
        if let Some(model) = &options.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(resume) = &options.resume {
            cmd.arg("--resume").arg(resume);
        }
        if let Some(base_url) = &options.base_url {
            cmd.env("ANTHROPIC_BASE_URL", base_url);
        }
        if let Some(api_key) = &options.api_key {
            cmd.env("ANTHROPIC_API_KEY", api_key);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| CctError::Sdk(format!("spawning agent command: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CctError::Sdk("subprocess stdout unavailable".into()))?;

        let current_tx = self.current_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<SdkMessage>(&line) {
                            Ok(msg) => {
                                let sender = current_tx.lock().await.clone();
                                if let Some(sender) = sender {
                                    if sender.send(msg).await.is_err() {
                                        tracing::warn!("agent subprocess response channel closed");
                                    }
                                } else {
                                    tracing::warn!("dropping agent subprocess frame with no active turn");
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "dropping unparseable agent subprocess frame");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "agent subprocess stdout read failed");
                        break;
                    }
                }
            }
        });

        self.child = Some(child);
        Ok(())
    }

    async fn query(&mut self, prompt: String) -> Result<()> {
        self.query_with_content(vec![ContentBlock::Text { text: prompt }]).await
    }

    async fn query_with_content(&mut self, blocks: Vec<ContentBlock>) -> Result<()> {
        let frame = serde_json::json!({ "type": "user", "blocks": blocks });
        let line = serde_json::to_string(&frame)
            .map_err(|e| CctError::Sdk(format!("encoding prompt frame: {e}")))?;

        let Some(child) = self.child.as_mut() else {
            return Err(CctError::Sdk("client not connected".into()));
        };
        let Some(stdin) = child.stdin.as_mut() else {
            return Err(CctError::Sdk("subprocess stdin unavailable".into()));
        };

        let (tx, rx) = mpsc::channel(32);
        *self.current_tx.lock().await = Some(tx);
        self.rx = Some(rx);

        stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| CctError::Sdk(format!("writing prompt to subprocess: {e}")))?;
        Ok(())
    }

    fn receive_response(&mut self) -> mpsc::Receiver<SdkMessage> {
        self.rx.take().unwrap_or_else(|| mpsc::channel(1).1)
    }

    async fn close(&mut self) -> Result<()> {
        *self.current_tx.lock().await = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.rx = None;
        Ok(())
    }
}
