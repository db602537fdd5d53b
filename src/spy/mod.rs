//! Spy bus: a process-wide, bounded FIFO ring of observable events.
//!
//! Every state transition the engine makes visible (publish, consume, dlq
//! routing, object upload/download/delete/copy) is appended here. Tests
//! consume the ring two ways: retroactive scans over buffered events, and
//! awaitable matchers that suspend until a matching event arrives or a
//! deadline fires. Waiters never leak: every registration is resolved by a
//! match, its own timeout, or `clear()`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

/// Status tag carried by every spy event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpyStatus {
    Published,
    Consumed,
    Dlq,
    Uploaded,
    Downloaded,
    Deleted,
    Copied,
}

/// Observable engine event, tagged by originating service.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "service", rename_all = "lowercase")]
pub enum SpyEvent {
    Sqs {
        #[serde(rename = "queueName")]
        queue_name: String,
        #[serde(rename = "messageId")]
        message_id: String,
        body: String,
        #[serde(rename = "messageAttributes")]
        message_attributes: HashMap<String, Value>,
        status: SpyStatus,
        timestamp: u64,
    },
    Sns {
        #[serde(rename = "topicArn")]
        topic_arn: String,
        #[serde(rename = "topicName")]
        topic_name: String,
        #[serde(rename = "messageId")]
        message_id: String,
        body: String,
        #[serde(rename = "messageAttributes")]
        message_attributes: HashMap<String, Value>,
        status: SpyStatus,
    },
    S3 {
        bucket: String,
        key: String,
        status: SpyStatus,
    },
}

impl SpyEvent {
    pub fn status(&self) -> SpyStatus {
        match self {
            Self::Sqs { status, .. } | Self::Sns { status, .. } | Self::S3 { status, .. } => {
                *status
            }
        }
    }

    /// Message id, for the events that carry one.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Sqs { message_id, .. } | Self::Sns { message_id, .. } => Some(message_id),
            Self::S3 { .. } => None,
        }
    }
}

/// Event selector: a predicate, or a partial object deep-compared
/// key-by-key against the event's JSON form (nested objects recurse,
/// primitives use strict equality).
#[derive(Clone)]
pub enum SpyFilter {
    Predicate(Arc<dyn Fn(&SpyEvent) -> bool + Send + Sync>),
    Partial(Value),
}

impl fmt::Debug for SpyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Predicate(_) => f.write_str("SpyFilter::Predicate"),
            Self::Partial(v) => write!(f, "SpyFilter::Partial({v})"),
        }
    }
}

impl SpyFilter {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&SpyEvent) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    pub fn partial(value: Value) -> Self {
        Self::Partial(value)
    }

    /// Filter that matches any event.
    pub fn any() -> Self {
        Self::predicate(|_| true)
    }

    fn matches(&self, event: &SpyEvent) -> bool {
        match self {
            Self::Predicate(p) => p(event),
            Self::Partial(expected) => match serde_json::to_value(event) {
                Ok(actual) => value_subset(expected, &actual),
                Err(_) => false,
            },
        }
    }
}

/// Structural subset match: every key in `expected` must be present in
/// `actual` with an equal (or recursively matching) value.
fn value_subset(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Object(exp), Value::Object(act)) => exp
            .iter()
            .all(|(k, v)| act.get(k).is_some_and(|a| value_subset(v, a))),
        _ => expected == actual,
    }
}

/// Errors surfaced to suspended spy consumers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SpyError {
    #[error("timed out waiting for spy events ({collected}/{expected} collected)")]
    Timeout { collected: usize, expected: usize },

    #[error("spy buffer was cleared while waiting")]
    Cleared,

    #[error("an event matched within the watch window")]
    UnexpectedEvent(Box<SpyEvent>),
}

struct Waiter {
    id: u64,
    filter: SpyFilter,
    status: Option<SpyStatus>,
    expected: usize,
    collected: Vec<SpyEvent>,
    tx: oneshot::Sender<Result<Vec<SpyEvent>, SpyError>>,
}

impl Waiter {
    fn accepts(&self, event: &SpyEvent) -> bool {
        self.status.is_none_or(|s| s == event.status()) && self.filter.matches(event)
    }
}

struct SpyState {
    events: std::collections::VecDeque<SpyEvent>,
    waiters: Vec<Waiter>,
    next_waiter_id: u64,
}

/// Process-wide spy bus. One instance is shared by all services.
pub struct SpyBus {
    capacity: usize,
    state: Mutex<SpyState>,
}

impl SpyBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(SpyState {
                events: std::collections::VecDeque::new(),
                waiters: Vec::new(),
                next_waiter_id: 0,
            }),
        }
    }

    /// Append an event, evicting the oldest past capacity, then deliver to
    /// every waiter whose matcher accepts it, in registration order.
    pub async fn add(&self, event: SpyEvent) {
        let mut state = self.state.lock().await;
        if state.events.len() == self.capacity {
            state.events.pop_front();
        }
        state.events.push_back(event.clone());
        debug!(status = ?event.status(), buffered = state.events.len(), "spy event added");

        let mut idx = 0;
        while idx < state.waiters.len() {
            if state.waiters[idx].accepts(&event) {
                state.waiters[idx].collected.push(event.clone());
                if state.waiters[idx].collected.len() >= state.waiters[idx].expected {
                    let waiter = state.waiters.remove(idx);
                    let _ = waiter.tx.send(Ok(waiter.collected.clone()));
                    continue;
                }
            }
            idx += 1;
        }
    }

    /// Synchronous scan, oldest to newest; returns the first match.
    pub async fn check_for_message(
        &self,
        filter: &SpyFilter,
        status: Option<SpyStatus>,
    ) -> Option<SpyEvent> {
        let state = self.state.lock().await;
        state
            .events
            .iter()
            .find(|e| status.is_none_or(|s| s == e.status()) && filter.matches(e))
            .cloned()
    }

    /// Wait for a single matching event.
    pub async fn wait_for_message(
        &self,
        filter: SpyFilter,
        status: Option<SpyStatus>,
        timeout: Option<Duration>,
    ) -> Result<SpyEvent, SpyError> {
        let events = self.wait_for_messages(filter, 1, status, timeout).await?;
        // expected == 1 guarantees exactly one element
        Ok(events.into_iter().next().unwrap_or_else(|| unreachable!()))
    }

    /// Wait until `count` matching events have been observed, counting
    /// already-buffered matches first.
    pub async fn wait_for_messages(
        &self,
        filter: SpyFilter,
        count: usize,
        status: Option<SpyStatus>,
        timeout: Option<Duration>,
    ) -> Result<Vec<SpyEvent>, SpyError> {
        let expected = count.max(1);
        let (id, mut rx) = {
            let mut state = self.state.lock().await;
            let collected: Vec<SpyEvent> = state
                .events
                .iter()
                .filter(|e| status.is_none_or(|s| s == e.status()) && filter.matches(e))
                .take(expected)
                .cloned()
                .collect();
            if collected.len() >= expected {
                return Ok(collected);
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push(Waiter {
                id,
                filter,
                status,
                expected,
                collected,
                tx,
            });
            (id, rx)
        };

        match timeout {
            None => rx.await.unwrap_or(Err(SpyError::Cleared)),
            Some(limit) => match tokio::time::timeout(limit, &mut rx).await {
                Ok(result) => result.unwrap_or(Err(SpyError::Cleared)),
                Err(_) => {
                    let mut state = self.state.lock().await;
                    if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
                        let waiter = state.waiters.remove(pos);
                        return Err(SpyError::Timeout {
                            collected: waiter.collected.len(),
                            expected,
                        });
                    }
                    drop(state);
                    // Delivered between the deadline and re-lock.
                    rx.await.unwrap_or(Err(SpyError::Cleared))
                }
            },
        }
    }

    /// Wait for an event carrying the given message id.
    pub async fn wait_for_message_with_id(
        &self,
        message_id: &str,
        status: Option<SpyStatus>,
        timeout: Option<Duration>,
    ) -> Result<SpyEvent, SpyError> {
        let id = message_id.to_string();
        self.wait_for_message(
            SpyFilter::predicate(move |e| e.message_id() == Some(id.as_str())),
            status,
            timeout,
        )
        .await
    }

    /// Assert that no matching event is buffered or arrives within the
    /// window. A `clear()` during the window counts as success.
    pub async fn expect_no_message(
        &self,
        filter: SpyFilter,
        status: Option<SpyStatus>,
        within: Duration,
    ) -> Result<(), SpyError> {
        match self
            .wait_for_messages(filter, 1, status, Some(within))
            .await
        {
            Ok(mut events) => Err(SpyError::UnexpectedEvent(Box::new(events.remove(0)))),
            Err(SpyError::Timeout { .. }) | Err(SpyError::Cleared) => Ok(()),
            Err(other) => Err(other),
        }
    }

    /// Empty the buffer and fail every pending waiter with a cleared
    /// marker (`expect_no_message` interprets that as success).
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.events.clear();
        for waiter in state.waiters.drain(..) {
            let _ = waiter.tx.send(Err(SpyError::Cleared));
        }
    }

    /// Snapshot of the buffered events, oldest first.
    pub async fn events(&self) -> Vec<SpyEvent> {
        self.state.lock().await.events.iter().cloned().collect()
    }

    /// Number of registered waiters; used by tests to prove none leak.
    pub async fn waiter_count(&self) -> usize {
        self.state.lock().await.waiters.len()
    }
}
