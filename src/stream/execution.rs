use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agents::{AgentChunk, AgentInvoker, ToolConfig};
use crate::engine::types::{EventPayload, ExecutionEvent, Metrics, ToolUse};

use super::{EventReceiver, PauseGate};

/// Everything needed to run one agent attempt for one step.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub session_id: String,
    pub step_id: String,
    pub agent_kind: String,
    pub task: String,
    pub prompt: String,
    pub tools: ToolConfig,
    pub attempt: u32,
}

/// How a stream ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamTermination {
    Completed,
    Error(String),
    Interrupted,
}

/// Accumulated result of a finished stream.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub agent_id: String,
    pub termination: StreamTermination,
    pub output: String,
    pub tool_log: Vec<ToolUse>,
    pub metrics: Metrics,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
}

/// A running agent invocation, observable as a stream of [`ExecutionEvent`]s.
///
/// The producer runs on its own task and always emits `initialized` first and
/// exactly one of `completed`, `error` or `interrupted` last. Cancelling the
/// token makes it drop the upstream agent stream and emit `interrupted`
/// with whatever output was gathered so far.
pub struct ExecutionStream {
    agent_id: String,
    events: EventReceiver,
    task: JoinHandle<StreamOutcome>,
}

impl ExecutionStream {
    pub fn spawn(
        invoker: Arc<dyn AgentInvoker>,
        request: StreamRequest,
        cancel: CancellationToken,
        gate: PauseGate,
    ) -> Self {
        let short = Uuid::new_v4().simple().to_string();
        let agent_id = format!("{}_{}", request.agent_kind, &short[..8]);
        let (tx, events) = EventReceiver::channel();

        let producer = Producer {
            agent_id: agent_id.clone(),
            request,
            tx,
            acc: Accumulator::default(),
            started: Utc::now(),
        };
        let task = tokio::spawn(producer.run(invoker, cancel, gate));

        Self {
            agent_id,
            events,
            task,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Wait for the producer and return the accumulated outcome.
    /// Events not yet consumed are discarded.
    pub async fn finish(self) -> StreamOutcome {
        let Self {
            agent_id, task, ..
        } = self;
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                let now = Utc::now();
                StreamOutcome {
                    agent_id,
                    termination: StreamTermination::Error(format!(
                        "execution stream task aborted: {}",
                        e
                    )),
                    output: String::new(),
                    tool_log: Vec::new(),
                    metrics: Metrics::default(),
                    started: now,
                    finished: now,
                }
            }
        }
    }
}

impl Stream for ExecutionStream {
    type Item = ExecutionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

#[derive(Default)]
struct Accumulator {
    output: String,
    tool_log: Vec<ToolUse>,
    metrics: Metrics,
}

enum Wake<T> {
    Cancelled,
    Ready(T),
}

struct Producer {
    agent_id: String,
    request: StreamRequest,
    tx: mpsc::UnboundedSender<ExecutionEvent>,
    acc: Accumulator,
    started: DateTime<Utc>,
}

impl Producer {
    async fn run(
        mut self,
        invoker: Arc<dyn AgentInvoker>,
        cancel: CancellationToken,
        gate: PauseGate,
    ) -> StreamOutcome {
        self.emit(EventPayload::Initialized {
            agent_kind: self.request.agent_kind.clone(),
            task: self.request.task.clone(),
            attempt: self.request.attempt,
        });

        if !gate.wait_until_running(&cancel).await {
            return self.interrupted("cancelled before start");
        }

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Wake::Cancelled,
            r = invoker.invoke(&self.request.prompt, &self.request.tools) => Wake::Ready(r),
        };
        let mut upstream = match opened {
            Wake::Cancelled => return self.interrupted("cancelled while connecting"),
            Wake::Ready(Ok(s)) => s,
            Wake::Ready(Err(e)) => return self.failed(format!("{:#}", e)),
        };
        self.acc.metrics.api_calls += 1;

        loop {
            if !gate.wait_until_running(&cancel).await {
                drop(upstream);
                return self.interrupted("cancelled");
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Wake::Cancelled,
                item = upstream.next() => Wake::Ready(item),
            };

            match next {
                Wake::Cancelled => {
                    drop(upstream);
                    return self.interrupted("cancelled");
                }
                Wake::Ready(None) => return self.completed(),
                Wake::Ready(Some(Err(e))) => return self.failed(format!("{:#}", e)),
                Wake::Ready(Some(Ok(chunk))) => self.absorb(chunk),
            }
        }
    }

    fn absorb(&mut self, chunk: AgentChunk) {
        match chunk {
            AgentChunk::Text(content) => {
                let word_count = content.split_whitespace().count() as u64;
                self.acc.output.push_str(&content);
                self.acc.metrics.words_generated += word_count;
                self.emit(EventPayload::TextChunk {
                    content,
                    word_count,
                });
            }
            AgentChunk::ToolUse { name, input } => {
                self.acc.metrics.tool_calls += 1;
                self.acc.tool_log.push(ToolUse {
                    tool: name.clone(),
                    input: input.clone(),
                    timestamp: Utc::now(),
                });
                self.emit(EventPayload::ToolUse { tool: name, input });
            }
            AgentChunk::Usage { tokens } => {
                self.acc.metrics.tokens_used += tokens;
            }
        }
    }

    fn emit(&self, payload: EventPayload) {
        let event = ExecutionEvent::new(
            &self.agent_id,
            &self.request.session_id,
            &self.request.step_id,
            payload,
        );
        // A dropped receiver only means nobody is watching; keep accumulating.
        let _ = self.tx.send(event);
    }

    fn completed(self) -> StreamOutcome {
        debug!(
            step = %self.request.step_id,
            agent_id = %self.agent_id,
            words = self.acc.metrics.words_generated,
            "Agent stream completed"
        );
        self.emit(EventPayload::Completed {
            output_chars: self.acc.output.chars().count(),
            metrics: self.acc.metrics.clone(),
        });
        self.finish(StreamTermination::Completed)
    }

    fn failed(mut self, message: String) -> StreamOutcome {
        warn!(
            step = %self.request.step_id,
            agent_id = %self.agent_id,
            error = %message,
            "Agent stream failed"
        );
        self.acc.metrics.errors += 1;
        self.emit(EventPayload::Error {
            message: message.clone(),
        });
        self.finish(StreamTermination::Error(message))
    }

    fn interrupted(self, reason: &str) -> StreamOutcome {
        debug!(
            step = %self.request.step_id,
            agent_id = %self.agent_id,
            reason,
            "Agent stream interrupted"
        );
        self.emit(EventPayload::Interrupted {
            reason: reason.to_string(),
            partial_chars: self.acc.output.chars().count(),
        });
        self.finish(StreamTermination::Interrupted)
    }

    fn finish(self, termination: StreamTermination) -> StreamOutcome {
        StreamOutcome {
            agent_id: self.agent_id,
            termination,
            output: self.acc.output,
            tool_log: self.acc.tool_log,
            metrics: self.acc.metrics,
            started: self.started,
            finished: Utc::now(),
        }
    }
}
