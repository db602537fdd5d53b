//! FIFO queue extras: per-group pools, group locks, deduplication.
//!
//! Groups are iterated in the insertion order of their first message.
//! While a group has an inflight message it is locked: none of its other
//! messages become visible. The dedup cache is bounded both by capacity
//! (FIFO eviction) and entry age (lazy 5-minute expiry).

use std::collections::{HashMap, VecDeque};

use sha2::{Digest, Sha256};

use super::message::Message;

/// Dedup cache capacity.
pub const DEDUP_CACHE_CAPACITY: usize = 10_000;
/// Dedup entries expire this many milliseconds after insertion.
pub const DEDUP_WINDOW_MILLIS: u64 = 5 * 60 * 1000;
/// Width of rendered sequence numbers.
pub const SEQUENCE_NUMBER_WIDTH: usize = 20;

/// Content-based deduplication id: SHA-256 hex of the body.
pub fn content_based_dedup_id(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

/// Render a per-queue sequence counter as the 20-digit wire form.
pub fn format_sequence_number(counter: u64) -> String {
    format!("{counter:0width$}", width = SEQUENCE_NUMBER_WIDTH)
}

/// What a duplicate send gets back instead of a fresh enqueue.
#[derive(Debug, Clone)]
pub struct DedupEntry {
    pub message_id: String,
    pub sequence_number: Option<String>,
    inserted_at: u64,
}

/// Insertion-ordered dedup cache with lazy expiry.
#[derive(Debug, Default)]
pub struct DedupCache {
    entries: HashMap<String, DedupEntry>,
    insertion_order: VecDeque<String>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live entry; expired entries are treated as absent.
    pub fn check(&mut self, dedup_id: &str, now: u64) -> Option<DedupEntry> {
        let expired = match self.entries.get(dedup_id) {
            Some(entry) => now >= entry.inserted_at + DEDUP_WINDOW_MILLIS,
            None => return None,
        };
        if expired {
            self.entries.remove(dedup_id);
            return None;
        }
        self.entries.get(dedup_id).cloned()
    }

    /// Record a fresh send. Expired and over-capacity entries are evicted
    /// in insertion order.
    pub fn record(
        &mut self,
        dedup_id: String,
        message_id: String,
        sequence_number: Option<String>,
        now: u64,
    ) {
        self.evict(now);
        if self.entries.len() >= DEDUP_CACHE_CAPACITY {
            while let Some(oldest) = self.insertion_order.pop_front() {
                if self.entries.remove(&oldest).is_some() {
                    break;
                }
            }
        }
        self.insertion_order.push_back(dedup_id.clone());
        self.entries.insert(
            dedup_id,
            DedupEntry {
                message_id,
                sequence_number,
                inserted_at: now,
            },
        );
    }

    fn evict(&mut self, now: u64) {
        while let Some(oldest) = self.insertion_order.front().cloned() {
            match self.entries.get(&oldest) {
                Some(entry) if now >= entry.inserted_at + DEDUP_WINDOW_MILLIS => {
                    self.insertion_order.pop_front();
                    self.entries.remove(&oldest);
                }
                Some(_) => break,
                // Stale order entry left behind by a lazy removal.
                None => {
                    self.insertion_order.pop_front();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-group ready/delayed pools plus lock counters.
#[derive(Debug, Default)]
pub struct GroupPools {
    ready: HashMap<String, VecDeque<Message>>,
    delayed: HashMap<String, Vec<Message>>,
    /// Group iteration order: insertion order of each group's first message.
    order: Vec<String>,
    /// Inflight message count per group; a nonzero count locks the group.
    locks: HashMap<String, u32>,
}

impl GroupPools {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_group(&mut self, group: &str) {
        if !self.order.iter().any(|g| g == group) {
            self.order.push(group.to_string());
        }
    }

    fn group_of(message: &Message) -> String {
        message.group_id.clone().unwrap_or_default()
    }

    pub fn push_ready_back(&mut self, message: Message) {
        let group = Self::group_of(&message);
        self.ensure_group(&group);
        self.ready.entry(group).or_default().push_back(message);
    }

    /// Redelivery path: the message goes back to the head of its group.
    pub fn push_ready_front(&mut self, message: Message) {
        let group = Self::group_of(&message);
        self.ensure_group(&group);
        self.ready.entry(group).or_default().push_front(message);
    }

    pub fn push_delayed(&mut self, message: Message) {
        let group = Self::group_of(&message);
        self.ensure_group(&group);
        self.delayed.entry(group).or_default().push(message);
    }

    /// Drain delayed messages now due, in delay order.
    pub fn take_due_delayed(&mut self, now: u64) -> Vec<Message> {
        let mut due = Vec::new();
        for messages in self.delayed.values_mut() {
            let mut idx = 0;
            while idx < messages.len() {
                if messages[idx].delay_until.is_none_or(|t| t <= now) {
                    due.push(messages.remove(idx));
                } else {
                    idx += 1;
                }
            }
        }
        due.sort_by_key(|m| m.delay_until.unwrap_or(0));
        due
    }

    /// Pop the next visible message, iterating groups in insertion order
    /// and skipping locked groups. Does not lock the group.
    pub fn pop_next_ready(&mut self) -> Option<Message> {
        let group = self
            .order
            .iter()
            .find(|g| {
                !self.is_locked(g) && self.ready.get(g.as_str()).is_some_and(|q| !q.is_empty())
            })
            .map(|g| g.to_string())?;
        let message = self.ready.get_mut(&group)?.pop_front();
        self.prune(&group);
        message
    }

    pub fn is_locked(&self, group: &str) -> bool {
        self.locks.get(group).copied().unwrap_or(0) > 0
    }

    pub fn lock(&mut self, group: &str) {
        *self.locks.entry(group.to_string()).or_insert(0) += 1;
    }

    /// Decrement the group's lock; returns true when the group became
    /// unlocked and still has ready messages.
    pub fn unlock(&mut self, group: &str) -> bool {
        let remaining = match self.locks.get_mut(group) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            self.locks.remove(group);
            self.prune(group);
            return self.ready.get(group).is_some_and(|q| !q.is_empty());
        }
        false
    }

    /// Drop bookkeeping for a group with nothing left anywhere, so a later
    /// send re-enters the iteration order at the back.
    fn prune(&mut self, group: &str) {
        let empty_ready = self.ready.get(group).is_none_or(|q| q.is_empty());
        let empty_delayed = self.delayed.get(group).is_none_or(|v| v.is_empty());
        if empty_ready && empty_delayed && !self.is_locked(group) {
            self.ready.remove(group);
            self.delayed.remove(group);
            self.order.retain(|g| g != group);
        }
    }

    pub fn ready_len(&self) -> usize {
        self.ready.values().map(VecDeque::len).sum()
    }

    pub fn delayed_len(&self) -> usize {
        self.delayed.values().map(Vec::len).sum()
    }

    pub fn ready_messages(&self) -> Vec<Message> {
        self.order
            .iter()
            .filter_map(|g| self.ready.get(g))
            .flat_map(|q| q.iter().cloned())
            .collect()
    }

    pub fn delayed_messages(&self) -> Vec<Message> {
        self.delayed.values().flat_map(|v| v.iter().cloned()).collect()
    }

    pub fn clear(&mut self) {
        self.ready.clear();
        self.delayed.clear();
        self.order.clear();
        self.locks.clear();
    }
}
