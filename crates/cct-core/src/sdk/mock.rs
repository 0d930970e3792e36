use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

use super::client::{AgentSdkClient, ContentBlock, SdkClientOptions, SdkMessage};

/// Test double driving a deterministic message sequence without a real
/// subprocess, mirroring the teacher's preference for exercising real
/// storage against a tempfile-backed database while mocking only the
/// genuinely external collaborator (spec §2.2).
pub struct MockSdkClient {
    script: Vec<SdkMessage>,
    rx: Option<mpsc::Receiver<SdkMessage>>,
    connected: bool,
    pub last_prompt: Option<String>,
}

impl MockSdkClient {
    pub fn new(script: Vec<SdkMessage>) -> Self {
        Self {
            script,
            rx: None,
            connected: false,
            last_prompt: None,
        }
    }
}

#[async_trait]
impl AgentSdkClient for MockSdkClient {
    async fn connect(&mut self, _options: SdkClientOptions) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn query(&mut self, prompt: String) -> Result<()> {
        self.last_prompt = Some(prompt);
        let (tx, rx) = mpsc::channel(self.script.len().max(1));
        for msg in self.script.clone() {
            let _ = tx.send(msg).await;
        }
        self.rx = Some(rx);
        Ok(())
    }

    async fn query_with_content(&mut self, blocks: Vec<ContentBlock>) -> Result<()> {
        let prompt = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        self.query(prompt).await
    }

    fn receive_response(&mut self) -> mpsc::Receiver<SdkMessage> {
        self.rx.take().unwrap_or_else(|| mpsc::channel(1).1)
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.rx = None;
        Ok(())
    }
}
