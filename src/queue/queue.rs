//! Per-queue state machine.
//!
//! A queue holds messages in three pools — ready, delayed, inflight — with
//! FIFO queues additionally sharding ready/delayed per message group. All
//! pool mutation happens under the queue's lock; spy events are emitted
//! after the lock is released. Long-poll waiters are one-shot signals; a
//! ≈20 ms ticker drives timer processing only while waiters exist, so idle
//! queues cost nothing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Result, ServiceError};
use crate::spy::{SpyBus, SpyEvent, SpyStatus};

use super::attributes::{QueueAttributes, VISIBILITY_TIMEOUT_MAX};
use super::fifo::{content_based_dedup_id, format_sequence_number, DedupCache, GroupPools};
use super::message::{
    message_size, validate_attributes, validate_body_characters, Message, MessageAttributeValue,
};

/// Timer-processing cadence while long-poll waiters are registered.
pub const TIMER_TICK_MILLIS: u64 = 20;
/// Hard cap on messages returned by a single dequeue.
pub const MAX_RECEIVE_BATCH: usize = 10;

/// Parameters of a single send, already decoded by the shell.
#[derive(Debug, Clone, Default)]
pub struct SendMessageParams {
    pub body: String,
    pub attributes: HashMap<String, MessageAttributeValue>,
    pub delay_seconds: Option<u32>,
    pub group_id: Option<String>,
    pub dedup_id: Option<String>,
}

/// What a send produced. For a FIFO duplicate, the original message's id
/// and sequence number come back and nothing was enqueued.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message_id: String,
    pub body_digest: String,
    pub attributes_digest: Option<String>,
    pub sequence_number: Option<String>,
    pub duplicate: bool,
}

/// A message handed to a receiver, with its fresh receipt handle.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub body_digest: String,
    pub attributes: HashMap<String, MessageAttributeValue>,
    pub attributes_digest: Option<String>,
    pub sent_timestamp: u64,
    pub receive_count: u32,
    pub first_receive_timestamp: u64,
    pub group_id: Option<String>,
    pub dedup_id: Option<String>,
    pub sequence_number: Option<String>,
}

/// A message that exhausted its receive budget and must move to the DLQ.
/// The caller (queue registry) owns cross-queue routing so queue locks
/// never nest.
#[derive(Debug)]
pub struct DlqRedrive {
    pub message: Message,
    pub target_arn: String,
}

/// Non-destructive inspection view of a queue's pools.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub ready: Vec<Message>,
    pub delayed: Vec<Message>,
    pub inflight: Vec<InflightView>,
}

#[derive(Debug, Clone)]
pub struct InflightView {
    pub message: Message,
    pub receipt_handle: String,
    pub visibility_deadline: u64,
}

struct InflightEntry {
    message: Message,
    deadline: u64,
}

struct PollWaiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct TimerOutcome {
    /// Delayed messages that just became visible for the first time.
    newly_published: Vec<Message>,
    became_ready: bool,
}

struct QueueState {
    attributes: QueueAttributes,
    tags: Vec<(String, String)>,
    created_timestamp: u64,
    last_modified_timestamp: u64,
    ready: VecDeque<Message>,
    delayed: Vec<Message>,
    inflight: HashMap<String, InflightEntry>,
    groups: GroupPools,
    dedup: DedupCache,
    sequence_counter: u64,
    waiters: Vec<PollWaiter>,
    next_waiter_id: u64,
    ticker_running: bool,
    deleted: bool,
}

impl QueueState {
    fn ready_len(&self, fifo: bool) -> usize {
        if fifo {
            self.groups.ready_len()
        } else {
            self.ready.len()
        }
    }

    fn delayed_len(&self, fifo: bool) -> usize {
        if fifo {
            self.groups.delayed_len()
        } else {
            self.delayed.len()
        }
    }

    /// Move expired inflight entries back to the front of ready and due
    /// delayed messages to the tail. Idempotent and cheap.
    fn process_timers(&mut self, now: u64, fifo: bool) -> TimerOutcome {
        let mut outcome = TimerOutcome::default();

        let expired: Vec<String> = self
            .inflight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(handle, _)| handle.clone())
            .collect();
        let mut returned: Vec<Message> = Vec::with_capacity(expired.len());
        let mut deadlines: Vec<u64> = Vec::with_capacity(expired.len());
        for handle in expired {
            if let Some(entry) = self.inflight.remove(&handle) {
                deadlines.push(entry.deadline);
                returned.push(entry.message);
            }
        }
        // Earliest-expired ends up at the very front.
        let mut order: Vec<usize> = (0..returned.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(deadlines[i]));
        for idx in order {
            let message = returned[idx].clone();
            outcome.became_ready = true;
            if fifo {
                let group = message.group_id.clone().unwrap_or_default();
                self.groups.push_ready_front(message);
                self.groups.unlock(&group);
            } else {
                self.ready.push_front(message);
            }
        }

        if fifo {
            for message in self.groups.take_due_delayed(now) {
                outcome.became_ready = true;
                outcome.newly_published.push(message.clone());
                self.groups.push_ready_back(message);
            }
        } else {
            let mut idx = 0;
            let mut due = Vec::new();
            while idx < self.delayed.len() {
                if self.delayed[idx].delay_until.is_none_or(|t| t <= now) {
                    due.push(self.delayed.remove(idx));
                } else {
                    idx += 1;
                }
            }
            due.sort_by_key(|m| m.delay_until.unwrap_or(0));
            for message in due {
                outcome.became_ready = true;
                outcome.newly_published.push(message.clone());
                self.ready.push_back(message);
            }
        }

        outcome
    }

    fn signal_one(&mut self) {
        while !self.waiters.is_empty() {
            let waiter = self.waiters.remove(0);
            if waiter.tx.send(()).is_ok() {
                return;
            }
        }
    }

    fn signal_all(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.tx.send(());
        }
    }

    fn drop_closed_waiters(&mut self) {
        self.waiters.retain(|w| !w.tx.is_closed());
    }
}

/// One emulated queue. Shared as `Arc<Queue>`; the registry owns the map
/// of queues, each queue exclusively owns its pools.
pub struct Queue {
    pub name: String,
    pub url: String,
    pub arn: String,
    pub region: String,
    pub fifo: bool,
    clock: Arc<dyn Clock>,
    spy: Arc<SpyBus>,
    state: Mutex<QueueState>,
}

impl Queue {
    pub fn new(
        name: String,
        url: String,
        arn: String,
        region: String,
        attributes: QueueAttributes,
        clock: Arc<dyn Clock>,
        spy: Arc<SpyBus>,
    ) -> Self {
        let fifo = attributes.fifo_queue;
        let now_secs = clock.now_secs();
        Self {
            name,
            url,
            arn,
            region,
            fifo,
            clock,
            spy,
            state: Mutex::new(QueueState {
                attributes,
                tags: Vec::new(),
                created_timestamp: now_secs,
                last_modified_timestamp: now_secs,
                ready: VecDeque::new(),
                delayed: Vec::new(),
                inflight: HashMap::new(),
                groups: GroupPools::new(),
                dedup: DedupCache::new(),
                sequence_counter: 0,
                waiters: Vec::new(),
                next_waiter_id: 0,
                ticker_running: false,
                deleted: false,
            }),
        }
    }

    fn spy_event(&self, message: &Message, status: SpyStatus) -> SpyEvent {
        SpyEvent::Sqs {
            queue_name: self.name.clone(),
            message_id: message.message_id.clone(),
            body: message.body.clone(),
            message_attributes: message.attributes_json(),
            status,
            timestamp: self.clock.now_millis(),
        }
    }

    /// Spy event naming this queue as the source of a DLQ redrive.
    pub fn dlq_event(&self, message: &Message) -> SpyEvent {
        self.spy_event(message, SpyStatus::Dlq)
    }

    /// Validate and enqueue one message. FIFO duplicates short-circuit with
    /// the original send's identifiers.
    pub async fn send(&self, params: SendMessageParams) -> Result<SendOutcome> {
        if params.body.is_empty() {
            return Err(ServiceError::MissingParameter("MessageBody".to_string()));
        }
        validate_body_characters(&params.body)?;
        validate_attributes(&params.attributes)?;
        if let Some(delay) = params.delay_seconds {
            if delay > super::attributes::DELAY_SECONDS_MAX {
                return Err(ServiceError::InvalidParameterValue(format!(
                    "DelaySeconds must be between 0 and {}",
                    super::attributes::DELAY_SECONDS_MAX
                )));
            }
        }

        let now = self.clock.now_millis();
        let (outcome, event) = {
            let mut state = self.state.lock().await;

            let size = message_size(&params.body, &params.attributes);
            if size > state.attributes.maximum_message_size as usize {
                return Err(ServiceError::InvalidParameterValue(format!(
                    "One or more parameters are invalid. Reason: Message must be shorter than {} bytes",
                    state.attributes.maximum_message_size
                )));
            }

            let mut dedup_id = params.dedup_id.clone();
            if self.fifo {
                if params.group_id.is_none() {
                    return Err(ServiceError::MissingParameter(
                        "MessageGroupId".to_string(),
                    ));
                }
                if dedup_id.is_none() {
                    if state.attributes.content_based_deduplication {
                        dedup_id = Some(content_based_dedup_id(&params.body));
                    } else {
                        return Err(ServiceError::InvalidParameterValue(
                            "The queue should either have ContentBasedDeduplication enabled or MessageDeduplicationId provided explicitly".to_string(),
                        ));
                    }
                }
            }

            let mut message = Message::new(params.body, params.attributes, now);
            message.group_id = params.group_id;
            message.dedup_id = dedup_id.clone();

            if let Some(ref id) = dedup_id {
                if let Some(original) = state.dedup.check(id, now) {
                    debug!(queue = %self.name, dedup_id = %id, "duplicate send suppressed");
                    return Ok(SendOutcome {
                        message_id: original.message_id,
                        body_digest: message.body_digest,
                        attributes_digest: message.attributes_digest,
                        sequence_number: original.sequence_number,
                        duplicate: true,
                    });
                }
            }

            if self.fifo {
                state.sequence_counter += 1;
                message.sequence_number =
                    Some(format_sequence_number(state.sequence_counter));
            }
            if let Some(ref id) = dedup_id {
                let recorded_id = message.message_id.clone();
                let recorded_seq = message.sequence_number.clone();
                state.dedup.record(id.clone(), recorded_id, recorded_seq, now);
            }

            let delay = params
                .delay_seconds
                .unwrap_or(state.attributes.delay_seconds);
            if delay > 0 {
                message.delay_until = Some(now + u64::from(delay) * 1000);
            }

            let outcome = SendOutcome {
                message_id: message.message_id.clone(),
                body_digest: message.body_digest.clone(),
                attributes_digest: message.attributes_digest.clone(),
                sequence_number: message.sequence_number.clone(),
                duplicate: false,
            };

            let event = self.insert_locked(&mut state, message, now);
            (outcome, event)
        };
        if let Some(event) = event {
            self.spy.add(event).await;
        }
        Ok(outcome)
    }

    /// Enqueue an already-built message (publisher fan-out, DLQ routing).
    pub async fn enqueue(&self, message: Message) {
        let now = self.clock.now_millis();
        let event = {
            let mut state = self.state.lock().await;
            self.insert_locked(&mut state, message, now)
        };
        if let Some(event) = event {
            self.spy.add(event).await;
        }
    }

    /// Insert into delayed or ready; on transition into ready, produce the
    /// `published` spy event and signal one waiter.
    fn insert_locked(
        &self,
        state: &mut QueueState,
        message: Message,
        now: u64,
    ) -> Option<SpyEvent> {
        let delayed = message.delay_until.is_some_and(|t| t > now);
        if delayed {
            if self.fifo {
                state.groups.push_delayed(message);
            } else {
                state.delayed.push(message);
            }
            return None;
        }
        let event = self.spy_event(&message, SpyStatus::Published);
        if self.fifo {
            state.groups.push_ready_back(message);
        } else {
            state.ready.push_back(message);
        }
        state.signal_one();
        Some(event)
    }

    /// Take up to `min(max, 10)` visible messages. Messages past their
    /// redrive budget come back separately for the registry to route.
    pub async fn dequeue(
        &self,
        max: usize,
        visibility_override: Option<u32>,
    ) -> (Vec<ReceivedMessage>, Vec<DlqRedrive>) {
        let now = self.clock.now_millis();
        let limit = max.clamp(1, MAX_RECEIVE_BATCH);

        let mut received = Vec::new();
        let mut redrives = Vec::new();
        let published = {
            let mut state = self.state.lock().await;
            let timer_outcome = state.process_timers(now, self.fifo);
            if timer_outcome.became_ready {
                state.signal_all();
            }

            let visibility = u64::from(
                visibility_override.unwrap_or(state.attributes.visibility_timeout),
            );
            let redrive_policy = state.attributes.redrive_policy.clone();

            while received.len() < limit {
                let next = if self.fifo {
                    state.groups.pop_next_ready()
                } else {
                    state.ready.pop_front()
                };
                let Some(mut message) = next else { break };

                message.receive_count += 1;
                if message.first_receive_timestamp.is_none() {
                    message.first_receive_timestamp = Some(now);
                }

                if let Some(ref policy) = redrive_policy {
                    if message.receive_count > policy.max_receive_count {
                        // Does not lock its group and does not count toward
                        // the caller's batch.
                        redrives.push(DlqRedrive {
                            message,
                            target_arn: policy.dead_letter_target_arn.clone(),
                        });
                        continue;
                    }
                }

                let receipt_handle = Uuid::new_v4().to_string();
                if self.fifo {
                    let group = message.group_id.clone().unwrap_or_default();
                    state.groups.lock(&group);
                }
                received.push(ReceivedMessage {
                    message_id: message.message_id.clone(),
                    receipt_handle: receipt_handle.clone(),
                    body: message.body.clone(),
                    body_digest: message.body_digest.clone(),
                    attributes: message.attributes.clone(),
                    attributes_digest: message.attributes_digest.clone(),
                    sent_timestamp: message.sent_timestamp,
                    receive_count: message.receive_count,
                    first_receive_timestamp: message.first_receive_timestamp.unwrap_or(now),
                    group_id: message.group_id.clone(),
                    dedup_id: message.dedup_id.clone(),
                    sequence_number: message.sequence_number.clone(),
                });
                state.inflight.insert(
                    receipt_handle,
                    InflightEntry {
                        message,
                        deadline: now + visibility * 1000,
                    },
                );
            }
            timer_outcome.newly_published
        };
        for message in published {
            self.spy
                .add(self.spy_event(&message, SpyStatus::Published))
                .await;
        }
        (received, redrives)
    }

    /// Remove an inflight entry. Unknown handles are a no-op reported as
    /// `false`; callers decide whether that is an error.
    pub async fn delete_message(&self, receipt_handle: &str) -> bool {
        let event = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.inflight.remove(receipt_handle) else {
                return false;
            };
            if self.fifo {
                let group = entry.message.group_id.clone().unwrap_or_default();
                if state.groups.unlock(&group) {
                    state.signal_all();
                }
            }
            self.spy_event(&entry.message, SpyStatus::Consumed)
        };
        self.spy.add(event).await;
        true
    }

    /// Change an inflight message's visibility deadline. Zero returns it to
    /// the front of its queue/group immediately.
    pub async fn change_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        if seconds > VISIBILITY_TIMEOUT_MAX {
            return Err(ServiceError::InvalidParameterValue(format!(
                "VisibilityTimeout must be between 0 and {VISIBILITY_TIMEOUT_MAX}"
            )));
        }
        let now = self.clock.now_millis();
        let mut state = self.state.lock().await;
        if seconds == 0 {
            let entry = state
                .inflight
                .remove(receipt_handle)
                .ok_or(ServiceError::MessageNotInflight)?;
            if self.fifo {
                let group = entry.message.group_id.clone().unwrap_or_default();
                state.groups.push_ready_front(entry.message);
                state.groups.unlock(&group);
            } else {
                state.ready.push_front(entry.message);
            }
            state.signal_all();
            return Ok(());
        }
        let deadline = now + u64::from(seconds) * 1000;
        match state.inflight.get_mut(receipt_handle) {
            Some(entry) => {
                entry.deadline = deadline;
                Ok(())
            }
            None => Err(ServiceError::MessageNotInflight),
        }
    }

    /// Run timer processing outside of a dequeue (ticker path).
    pub async fn process_timers(&self) {
        let now = self.clock.now_millis();
        let (published, became_ready) = {
            let mut state = self.state.lock().await;
            let outcome = state.process_timers(now, self.fifo);
            if outcome.became_ready {
                state.signal_all();
            }
            (outcome.newly_published, outcome.became_ready)
        };
        if became_ready {
            debug!(queue = %self.name, "timer pass made messages visible");
        }
        for message in published {
            self.spy
                .add(self.spy_event(&message, SpyStatus::Published))
                .await;
        }
    }

    /// Register a long-poll waiter and start the ticker if needed.
    pub async fn register_waiter(self: &Arc<Self>) -> (u64, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().await;
        let id = state.next_waiter_id;
        state.next_waiter_id += 1;
        state.waiters.push(PollWaiter { id, tx });
        if !state.ticker_running {
            state.ticker_running = true;
            self.spawn_ticker();
        }
        (id, rx)
    }

    /// Drop a waiter that timed out on the caller's side.
    pub async fn deregister_waiter(&self, id: u64) {
        let mut state = self.state.lock().await;
        state.waiters.retain(|w| w.id != id);
    }

    fn spawn_ticker(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(TIMER_TICK_MILLIS));
            loop {
                ticker.tick().await;
                let Some(queue) = weak.upgrade() else { break };
                queue.process_timers().await;
                let mut state = queue.state.lock().await;
                state.drop_closed_waiters();
                if state.waiters.is_empty() || state.deleted {
                    state.ticker_running = false;
                    break;
                }
            }
        });
    }

    /// Mark deleted and wake every waiter; they observe no messages.
    pub async fn cancel_waiters(&self) {
        let mut state = self.state.lock().await;
        state.deleted = true;
        state.signal_all();
    }

    pub async fn is_deleted(&self) -> bool {
        self.state.lock().await.deleted
    }

    /// Drop every pooled message. Dedup state and waiters survive a purge.
    pub async fn purge(&self) {
        let mut state = self.state.lock().await;
        state.ready.clear();
        state.delayed.clear();
        state.inflight.clear();
        state.groups.clear();
        warn!(queue = %self.name, "queue purged");
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock().await;
        let (ready, delayed) = if self.fifo {
            (state.groups.ready_messages(), state.groups.delayed_messages())
        } else {
            (
                state.ready.iter().cloned().collect(),
                state.delayed.clone(),
            )
        };
        QueueSnapshot {
            ready,
            delayed,
            inflight: state
                .inflight
                .iter()
                .map(|(handle, entry)| InflightView {
                    message: entry.message.clone(),
                    receipt_handle: handle.clone(),
                    visibility_deadline: entry.deadline,
                })
                .collect(),
        }
    }

    /// Full attribute map: stored values plus live computed counts.
    pub async fn attributes_map(&self) -> HashMap<String, String> {
        let state = self.state.lock().await;
        let mut map = state.attributes.to_map();
        map.insert("QueueArn".to_string(), self.arn.clone());
        map.insert(
            "ApproximateNumberOfMessages".to_string(),
            state.ready_len(self.fifo).to_string(),
        );
        map.insert(
            "ApproximateNumberOfMessagesNotVisible".to_string(),
            state.inflight.len().to_string(),
        );
        map.insert(
            "ApproximateNumberOfMessagesDelayed".to_string(),
            state.delayed_len(self.fifo).to_string(),
        );
        map.insert(
            "CreatedTimestamp".to_string(),
            state.created_timestamp.to_string(),
        );
        map.insert(
            "LastModifiedTimestamp".to_string(),
            state.last_modified_timestamp.to_string(),
        );
        map
    }

    pub async fn set_attributes(&self, attrs: &HashMap<String, String>) -> Result<()> {
        let mut state = self.state.lock().await;
        if attrs.contains_key("FifoQueue") {
            let wanted = attrs.get("FifoQueue").map(String::as_str) == Some("true");
            if wanted != self.fifo {
                return Err(ServiceError::InvalidAttributeValue(
                    "FifoQueue cannot be changed after creation".to_string(),
                ));
            }
        }
        let mut updated = state.attributes.clone();
        updated.apply(attrs)?;
        state.attributes = updated;
        state.last_modified_timestamp = self.clock.now_secs();
        Ok(())
    }

    /// Does the caller-provided attribute set match this queue (idempotent
    /// create check)? Returns the first differing attribute name.
    pub async fn conflicting_attribute(
        &self,
        provided: &HashMap<String, String>,
    ) -> Option<String> {
        self.state.lock().await.attributes.matches_provided(provided)
    }

    pub async fn attribute_defaults(&self) -> QueueAttributes {
        self.state.lock().await.attributes.clone()
    }

    // -- tags (insertion-order preserved) ---------------------------------

    pub async fn tag(&self, tags: Vec<(String, String)>) {
        let mut state = self.state.lock().await;
        for (key, value) in tags {
            match state.tags.iter_mut().find(|(k, _)| *k == key) {
                Some(existing) => existing.1 = value,
                None => state.tags.push((key, value)),
            }
        }
    }

    pub async fn untag(&self, keys: &[String]) {
        let mut state = self.state.lock().await;
        state.tags.retain(|(k, _)| !keys.contains(k));
    }

    pub async fn tags(&self) -> Vec<(String, String)> {
        self.state.lock().await.tags.clone()
    }

    // -- test/diagnostic accessors ----------------------------------------

    pub async fn waiter_count(&self) -> usize {
        self.state.lock().await.waiters.len()
    }
}
