use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::json;
use tracing::debug;

use crate::agents::{AgentChunk, AgentEventStream, AgentInvoker, ToolConfig};

/// Agent backend that POSTs the prompt to an HTTP endpoint and reads the
/// reply as newline-delimited JSON.
///
/// Recognised lines:
/// `{"type":"text","text":..}`, `{"type":"tool_use","name":..,"input":..}`,
/// `{"type":"usage","total_tokens":..}`, `{"type":"error","message":..}`,
/// `{"type":"done"}`. Anything else is ignored.
pub struct HttpAgentInvoker {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpAgentInvoker {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client for agent endpoint")?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl AgentInvoker for HttpAgentInvoker {
    fn name(&self) -> &str {
        "http"
    }

    fn description(&self) -> &str {
        "Streams agent output from an HTTP endpoint (NDJSON)"
    }

    async fn invoke(&self, prompt: &str, tools: &ToolConfig) -> Result<AgentEventStream> {
        let body = json!({
            "prompt": prompt,
            "agent_kind": tools.agent_kind,
            "system_prompt": tools.system_prompt,
            "allowed_tools": tools.allowed_tools,
            "max_turns": tools.max_turns,
            "workspace": tools.workspace,
            "output_path": tools.output_path,
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Agent endpoint request failed: {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Agent endpoint returned {}: {}", status, text);
        }

        debug!(endpoint = %self.endpoint, agent_kind = %tools.agent_kind, "Agent stream opened");
        Ok(ndjson_chunks(response.bytes_stream().boxed()))
    }
}

/// Outcome of parsing a single NDJSON line.
#[derive(Debug, PartialEq)]
pub(crate) enum LineEvent {
    Chunk(AgentChunk),
    Done,
    Failed(String),
    Ignored,
}

pub(crate) fn parse_line(line: &str) -> Result<LineEvent> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(LineEvent::Ignored);
    }

    let value: serde_json::Value =
        serde_json::from_str(line).with_context(|| format!("Malformed agent line: {}", line))?;

    let kind = value.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let event = match kind {
        "text" => LineEvent::Chunk(AgentChunk::Text(
            value
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        )),
        "tool_use" => LineEvent::Chunk(AgentChunk::ToolUse {
            name: value
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            input: value.get("input").cloned().unwrap_or(serde_json::Value::Null),
        }),
        "usage" => LineEvent::Chunk(AgentChunk::Usage {
            tokens: value
                .get("total_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        }),
        "error" => LineEvent::Failed(
            value
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("agent reported an error")
                .to_string(),
        ),
        "done" => LineEvent::Done,
        _ => LineEvent::Ignored,
    };
    Ok(event)
}

struct LineReader<E> {
    upstream: BoxStream<'static, Result<E, reqwest::Error>>,
    buf: Vec<u8>,
    pending: VecDeque<Result<AgentChunk>>,
    finished: bool,
}

impl<E: AsRef<[u8]>> LineReader<E> {
    fn push_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        match parse_line(&line) {
            Ok(LineEvent::Chunk(chunk)) => self.pending.push_back(Ok(chunk)),
            Ok(LineEvent::Done) => self.finished = true,
            Ok(LineEvent::Failed(msg)) => {
                self.pending.push_back(Err(anyhow::anyhow!(msg)));
                self.finished = true;
            }
            Ok(LineEvent::Ignored) => {}
            Err(e) => {
                self.pending.push_back(Err(e));
                self.finished = true;
            }
        }
    }

    fn drain_lines(&mut self) {
        while !self.finished {
            let Some(pos) = self.buf.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.push_line(&line);
        }
    }
}

fn ndjson_chunks<E>(upstream: BoxStream<'static, Result<E, reqwest::Error>>) -> AgentEventStream
where
    E: AsRef<[u8]> + Send + 'static,
{
    let reader = LineReader {
        upstream,
        buf: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(item) = reader.pending.pop_front() {
                return Some((item, reader));
            }
            if reader.finished {
                return None;
            }
            match reader.upstream.next().await {
                Some(Ok(bytes)) => {
                    reader.buf.extend_from_slice(bytes.as_ref());
                    reader.drain_lines();
                }
                Some(Err(e)) => {
                    reader
                        .pending
                        .push_back(Err(anyhow::anyhow!("Agent stream broken: {}", e)));
                    reader.finished = true;
                }
                None => {
                    let rest = std::mem::take(&mut reader.buf);
                    reader.push_line(&rest);
                    reader.finished = true;
                }
            }
        }
    })
    .boxed()
}
