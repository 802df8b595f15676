use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::json;

use crate::agents::{AgentChunk, AgentEventStream, AgentInvoker, ToolConfig};

/// In-process agent backend that plays back a fixed script.
///
/// Without an explicit script it echoes the prompt back in small text chunks,
/// which makes it usable for dry runs when no agent endpoint is configured.
pub struct ScriptedInvoker {
    name: String,
    script: Option<Vec<AgentChunk>>,
    chunk_delay: Duration,
    words_per_chunk: usize,
    fail_first: u32,
    stall: bool,
    invocations: AtomicU32,
}

impl Default for ScriptedInvoker {
    fn default() -> Self {
        Self::echo()
    }
}

impl ScriptedInvoker {
    /// Echo backend registered as `echo`.
    pub fn echo() -> Self {
        Self {
            name: "echo".to_string(),
            script: None,
            chunk_delay: Duration::ZERO,
            words_per_chunk: 8,
            fail_first: 0,
            stall: false,
            invocations: AtomicU32::new(0),
        }
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::echo()
        }
    }

    /// Replay exactly these chunks instead of echoing.
    pub fn with_script(mut self, script: Vec<AgentChunk>) -> Self {
        self.script = Some(script);
        self
    }

    /// Sleep this long before every chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// The first `n` invocations fail after their first chunk.
    pub fn failing_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    /// Never finish: after the script the stream stays open until dropped.
    pub fn stalling(mut self) -> Self {
        self.stall = true;
        self
    }

    /// Number of times `invoke` has been called.
    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }

    fn echo_script(&self, prompt: &str, tools: &ToolConfig) -> Vec<AgentChunk> {
        let words: Vec<&str> = prompt.split_whitespace().take(64).collect();
        let mut chunks: Vec<AgentChunk> = words
            .chunks(self.words_per_chunk.max(1))
            .map(|w| AgentChunk::Text(format!("{} ", w.join(" "))))
            .collect();

        if let Some(ref path) = tools.output_path {
            chunks.push(AgentChunk::ToolUse {
                name: "write_md".to_string(),
                input: json!({ "path": path }),
            });
        }
        chunks.push(AgentChunk::Usage {
            tokens: words.len() as u64,
        });
        chunks
    }
}

#[async_trait]
impl AgentInvoker for ScriptedInvoker {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Plays back scripted output (echoes the prompt by default)"
    }

    async fn invoke(&self, prompt: &str, tools: &ToolConfig) -> Result<AgentEventStream> {
        let call = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;

        let mut items: Vec<Result<AgentChunk>> = match self.script {
            Some(ref script) => script.iter().cloned().map(Ok).collect(),
            None => self.echo_script(prompt, tools).into_iter().map(Ok).collect(),
        };
        if call <= self.fail_first {
            items.truncate(1);
            items.push(Err(anyhow::anyhow!(
                "{} agent failed on invocation {}",
                self.name,
                call
            )));
        }

        let delay = self.chunk_delay;
        let playback = stream::iter(items).then(move |item| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            item
        });

        if self.stall {
            Ok(playback.chain(stream::pending()).boxed())
        } else {
            Ok(playback.boxed())
        }
    }
}
