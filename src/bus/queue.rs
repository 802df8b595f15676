use std::collections::{BTreeSet, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::SubscriberOverflowError;

use super::{BusEvent, EventKind};

/// What a full subscriber queue gives up when another event arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued event to make room.
    #[default]
    DropOldest,
    /// Discard the arriving event.
    DropNewest,
}

/// Selects which events a subscriber receives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// Only events of this session. Events without a session always pass.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Only these event types. Empty means all.
    #[serde(default)]
    pub kinds: BTreeSet<EventKind>,
}

impl SubscriptionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn session(session_id: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            kinds: BTreeSet::new(),
        }
    }

    pub fn with_kinds<I: IntoIterator<Item = EventKind>>(mut self, kinds: I) -> Self {
        self.kinds.extend(kinds);
        self
    }

    pub fn matches(&self, event: &BusEvent) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        match (&self.session_id, &event.session_id) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        }
    }
}

struct QueueState {
    events: VecDeque<BusEvent>,
    /// Events dropped since the last overflow marker was handed out.
    dropped: u64,
    closed: bool,
}

/// A subscriber's private bounded queue.
pub(crate) struct SubscriberQueue {
    pub(crate) id: u64,
    pub(crate) filter: SubscriptionFilter,
    capacity: usize,
    policy: OverflowPolicy,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SubscriberQueue {
    pub(crate) fn new(
        id: u64,
        filter: SubscriptionFilter,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Self {
        Self {
            id,
            filter,
            capacity: capacity.max(1),
            policy,
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(capacity.min(1024)),
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue without ever blocking. A full queue drops per policy and
    /// reports the overflow; the subscriber later sees one marker for it.
    pub(crate) fn push(&self, event: BusEvent) -> Result<(), SubscriberOverflowError> {
        let result = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            if state.events.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        state.events.pop_front();
                        state.events.push_back(event);
                    }
                    OverflowPolicy::DropNewest => {}
                }
                state.dropped += 1;
                Err(SubscriberOverflowError {
                    subscriber_id: self.id,
                    dropped: state.dropped,
                })
            } else {
                state.events.push_back(event);
                Ok(())
            }
        };
        self.notify.notify_one();
        result
    }

    /// Next event, overflow marker first if events were dropped.
    pub(crate) fn pop(&self) -> Option<BusEvent> {
        let mut state = self.state.lock();
        if state.dropped > 0 {
            let dropped = std::mem::take(&mut state.dropped);
            return Some(BusEvent::overflow(self.id, dropped));
        }
        state.events.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        let state = self.state.lock();
        state.events.len() + usize::from(state.dropped > 0)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    pub(crate) async fn recv(&self) -> Option<BusEvent> {
        loop {
            if let Some(event) = self.pop() {
                return Some(event);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }
}
