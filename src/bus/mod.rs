//! Publish/subscribe hub for session progress.
//!
//! `publish` never blocks and never fails because of a subscriber: every
//! subscriber owns a private bounded queue, and overflow is handled per
//! subscriber by dropping events and queueing a single `overflow` marker.
//! A ring buffer of recent events lets late subscribers catch up.

mod queue;
mod ticker;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::types::{EventPayload, ExecutionEvent};

use queue::SubscriberQueue;
pub use queue::{OverflowPolicy, SubscriptionFilter};
pub use ticker::{AlertRule, MetricSource, ThresholdMonitor, spawn_ticker};

/// Default per-subscriber queue capacity.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1000;
/// Default number of events kept for replay.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Wire-level event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    WorkflowStatus,
    StepStarted,
    TextChunk,
    ToolUse,
    StepCompleted,
    StepFailed,
    WorkflowModified,
    WorkflowCompleted,
    WorkflowFailed,
    Interrupted,
    Alert,
    Heartbeat,
    Overflow,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::WorkflowStarted => "workflow_started",
            EventKind::WorkflowStatus => "workflow_status",
            EventKind::StepStarted => "step_started",
            EventKind::TextChunk => "text_chunk",
            EventKind::ToolUse => "tool_use",
            EventKind::StepCompleted => "step_completed",
            EventKind::StepFailed => "step_failed",
            EventKind::WorkflowModified => "workflow_modified",
            EventKind::WorkflowCompleted => "workflow_completed",
            EventKind::WorkflowFailed => "workflow_failed",
            EventKind::Interrupted => "interrupted",
            EventKind::Alert => "alert",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Overflow => "overflow",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("Unknown event type: {}", s))
    }
}

/// Event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl BusEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            session_id: None,
            step_id: None,
            agent_id: None,
            timestamp: Utc::now(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn with_step(mut self, step_id: &str) -> Self {
        self.step_id = Some(step_id.to_string());
        self
    }

    pub fn with_agent(mut self, agent_id: &str) -> Self {
        self.agent_id = Some(agent_id.to_string());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub(crate) fn overflow(subscriber_id: u64, dropped: u64) -> Self {
        Self::new(EventKind::Overflow).with_payload(serde_json::json!({
            "subscriber_id": subscriber_id,
            "dropped": dropped,
        }))
    }
}

impl From<&ExecutionEvent> for BusEvent {
    fn from(event: &ExecutionEvent) -> Self {
        let (kind, payload) = match &event.payload {
            EventPayload::Initialized {
                agent_kind,
                task,
                attempt,
            } => (
                EventKind::StepStarted,
                serde_json::json!({ "agent_kind": agent_kind, "task": task, "attempt": attempt }),
            ),
            EventPayload::TextChunk {
                content,
                word_count,
            } => (
                EventKind::TextChunk,
                serde_json::json!({ "content": content, "word_count": word_count }),
            ),
            EventPayload::ToolUse { tool, input } => (
                EventKind::ToolUse,
                serde_json::json!({ "tool": tool, "input": input }),
            ),
            EventPayload::Completed {
                output_chars,
                metrics,
            } => (
                EventKind::StepCompleted,
                serde_json::json!({ "output_chars": output_chars, "metrics": metrics }),
            ),
            EventPayload::Error { message } => (
                EventKind::StepFailed,
                serde_json::json!({ "error": message }),
            ),
            EventPayload::Interrupted {
                reason,
                partial_chars,
            } => (
                EventKind::Interrupted,
                serde_json::json!({ "reason": reason, "partial_chars": partial_chars }),
            ),
        };

        Self {
            kind,
            session_id: Some(event.session_id.clone()),
            step_id: Some(event.step_id.clone()),
            agent_id: Some(event.agent_id.clone()),
            timestamp: event.timestamp,
            payload,
        }
    }
}

/// Bus sizing and overflow behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub subscriber_capacity: usize,
    pub history_capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

struct BusState {
    history: VecDeque<BusEvent>,
    subscribers: Vec<Weak<SubscriberQueue>>,
    closed: bool,
}

struct BusInner {
    config: BusConfig,
    state: Mutex<BusState>,
    next_id: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
}

/// Cheaply cloneable handle to the event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let history = VecDeque::with_capacity(config.history_capacity.min(4096));
        Self {
            inner: Arc::new(BusInner {
                config,
                state: Mutex::new(BusState {
                    history,
                    subscribers: Vec::new(),
                    closed: false,
                }),
                next_id: AtomicU64::new(1),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Deliver `event` to every matching subscriber and record it in history.
    pub fn publish(&self, event: BusEvent) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        state.subscribers.retain(|weak| weak.strong_count() > 0);
        for weak in &state.subscribers {
            let Some(queue) = weak.upgrade() else {
                continue;
            };
            if !queue.filter.matches(&event) {
                continue;
            }
            if let Err(overflow) = queue.push(event.clone()) {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    subscriber = overflow.subscriber_id,
                    dropped = overflow.dropped,
                    "Subscriber queue full, dropping event"
                );
            }
        }

        let cap = self.inner.config.history_capacity;
        if cap > 0 {
            while state.history.len() >= cap {
                state.history.pop_front();
            }
            state.history.push_back(event);
        }
    }

    /// Subscribe to live events only.
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        self.subscribe_with_history(filter, 0)
    }

    /// Subscribe and pre-load up to `replay` of the most recent matching
    /// events from history. Replay and live delivery never overlap or gap.
    pub fn subscribe_with_history(&self, filter: SubscriptionFilter, replay: usize) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(
            id,
            filter,
            self.inner.config.subscriber_capacity,
            self.inner.config.overflow_policy,
        ));

        let mut state = self.inner.state.lock();
        if replay > 0 {
            let matching: Vec<&BusEvent> = state
                .history
                .iter()
                .filter(|e| queue.filter.matches(e))
                .collect();
            let skip = matching.len().saturating_sub(replay);
            for event in matching.into_iter().skip(skip) {
                let _ = queue.push(event.clone());
            }
        }
        if state.closed {
            queue.close();
        } else {
            state.subscribers.push(Arc::downgrade(&queue));
        }
        drop(state);

        debug!(subscriber = id, "Subscriber attached");
        Subscription { queue }
    }

    /// Most recent `n` events from history, oldest first.
    pub fn recent(&self, n: usize) -> Vec<BusEvent> {
        let state = self.inner.state.lock();
        let skip = state.history.len().saturating_sub(n);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .subscribers
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn history_len(&self) -> usize {
        self.inner.state.lock().history.len()
    }

    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Total events dropped across all subscribers.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// End every subscription; later publishes are ignored.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        for queue in state.subscribers.drain(..).filter_map(|w| w.upgrade()) {
            queue.close();
        }
    }
}

/// Receiving end of a bus subscription. Dropping it unsubscribes.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.queue.id
    }

    /// Next event, waiting if none is queued. `None` once the bus is closed
    /// and the queue has drained.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.queue.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.queue.pop()
    }

    /// Queued events, counting a pending overflow marker as one.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}
