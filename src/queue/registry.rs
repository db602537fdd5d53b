//! Queue registry: URL/name/ARN indexes and the service-level operations
//! the shell calls with decoded request structs.
//!
//! The registry exclusively owns queues. Cross-queue work (DLQ routing)
//! happens here, after the source queue's lock is released, so queue locks
//! never nest.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::arn;
use crate::clock::Clock;
use crate::error::{Result, ServiceError};
use crate::spy::SpyBus;

use super::attributes::{QueueAttributes, VISIBILITY_TIMEOUT_MAX, WAIT_TIME_MAX};
use super::queue::{
    DlqRedrive, Queue, QueueSnapshot, ReceivedMessage, SendMessageParams, SendOutcome,
    MAX_RECEIVE_BATCH,
};

/// Page size for ListQueues.
pub const LIST_QUEUES_PAGE_SIZE: usize = 1000;
/// Maximum entries in any batch operation.
pub const MAX_BATCH_ENTRIES: usize = 10;

/// Decoded CreateQueue request.
#[derive(Debug, Clone, Default)]
pub struct CreateQueueRequest {
    pub name: String,
    pub attributes: HashMap<String, String>,
    pub tags: Vec<(String, String)>,
    pub region: String,
    /// Host header of the request, reused for the queue URL when no
    /// external host is configured.
    pub request_host: String,
}

/// Decoded ReceiveMessage request.
#[derive(Debug, Clone, Default)]
pub struct ReceiveMessageRequest {
    pub max_messages: Option<u32>,
    pub visibility_timeout: Option<u32>,
    pub wait_time_seconds: Option<u32>,
}

/// Per-entry outcome of a batch operation.
#[derive(Debug)]
pub struct BatchEntryOutcome<T> {
    pub id: String,
    pub result: Result<T>,
}

/// Whole-batch validation shared by the send/delete/change-visibility
/// batch APIs: bounds, id charset, distinctness.
pub fn validate_batch_entry_ids<'a, I>(ids: I) -> Result<()>
where
    I: ExactSizeIterator<Item = &'a str>,
{
    if ids.len() == 0 {
        return Err(ServiceError::EmptyBatchRequest);
    }
    if ids.len() > MAX_BATCH_ENTRIES {
        return Err(ServiceError::TooManyEntriesInBatchRequest);
    }
    let mut seen = HashSet::new();
    for id in ids {
        let valid = !id.is_empty()
            && id.len() <= 80
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ServiceError::InvalidBatchEntryId(id.to_string()));
        }
        if !seen.insert(id) {
            return Err(ServiceError::BatchEntryIdsNotDistinct);
        }
    }
    Ok(())
}

struct Indexes {
    by_url: HashMap<String, Arc<Queue>>,
    /// Keyed by `region` + `name`; names are unique within a region.
    by_name: HashMap<(String, String), Arc<Queue>>,
    by_arn: HashMap<String, Arc<Queue>>,
}

/// Registry of every queue in the process.
pub struct QueueRegistry {
    clock: Arc<dyn Clock>,
    spy: Arc<SpyBus>,
    external_host: Option<String>,
    account: String,
    state: RwLock<Indexes>,
}

impl QueueRegistry {
    pub fn new(clock: Arc<dyn Clock>, spy: Arc<SpyBus>, external_host: Option<String>) -> Self {
        Self {
            clock,
            spy,
            external_host,
            account: arn::DEFAULT_ACCOUNT.to_string(),
            state: RwLock::new(Indexes {
                by_url: HashMap::new(),
                by_name: HashMap::new(),
                by_arn: HashMap::new(),
            }),
        }
    }

    fn queue_url(&self, region: &str, request_host: &str, name: &str) -> String {
        match &self.external_host {
            Some(host) => format!("http://sqs.{region}.{host}/{}/{name}", self.account),
            None => format!("http://{request_host}/{}/{name}", self.account),
        }
    }

    /// Idempotent create: an existing queue is returned unchanged when all
    /// provided settable attributes match; any difference is a conflict.
    pub async fn create_queue(&self, request: CreateQueueRequest) -> Result<Arc<Queue>> {
        if !arn::is_valid_resource_name(&request.name) {
            return Err(ServiceError::InvalidParameterValue(format!(
                "Queue name is not valid: {}",
                request.name
            )));
        }
        let fifo_suffix = arn::is_fifo_name(&request.name);
        let fifo_attr = request.attributes.get("FifoQueue").map(String::as_str) == Some("true");
        if fifo_attr && !fifo_suffix {
            return Err(ServiceError::InvalidParameterValue(
                "The name of a FIFO queue can only include alphanumeric characters, hyphens, or underscores, must end with .fifo suffix".to_string(),
            ));
        }

        let key = (request.region.clone(), request.name.clone());
        {
            let state = self.state.read().await;
            if let Some(existing) = state.by_name.get(&key) {
                return match existing.conflicting_attribute(&request.attributes).await {
                    Some(attribute) => Err(ServiceError::QueueNameExists(attribute)),
                    None => Ok(existing.clone()),
                };
            }
        }

        let mut attributes = QueueAttributes::default();
        attributes.apply(&request.attributes)?;
        attributes.fifo_queue = fifo_suffix;
        attributes.apply_fifo_defaults();

        let url = self.queue_url(&request.region, &request.request_host, &request.name);
        let queue_arn = arn::queue_arn(&request.region, &self.account, &request.name);
        let queue = Arc::new(Queue::new(
            request.name.clone(),
            url.clone(),
            queue_arn.clone(),
            request.region.clone(),
            attributes,
            self.clock.clone(),
            self.spy.clone(),
        ));
        if !request.tags.is_empty() {
            queue.tag(request.tags).await;
        }

        let mut state = self.state.write().await;
        // A racing create may have won; fall back to the idempotency check.
        if let Some(existing) = state.by_name.get(&key) {
            let existing = existing.clone();
            drop(state);
            return match existing.conflicting_attribute(&request.attributes).await {
                Some(attribute) => Err(ServiceError::QueueNameExists(attribute)),
                None => Ok(existing),
            };
        }
        state.by_url.insert(url.clone(), queue.clone());
        state.by_name.insert(key, queue.clone());
        state.by_arn.insert(queue_arn.clone(), queue.clone());
        info!(queue = %request.name, url = %url, fifo = queue.fifo, "queue created");
        Ok(queue)
    }

    pub async fn resolve(&self, url: &str) -> Result<Arc<Queue>> {
        self.state
            .read()
            .await
            .by_url
            .get(url)
            .cloned()
            .ok_or_else(|| ServiceError::NonExistentQueue(url.to_string()))
    }

    pub async fn resolve_arn(&self, queue_arn: &str) -> Option<Arc<Queue>> {
        self.state.read().await.by_arn.get(queue_arn).cloned()
    }

    pub async fn get_queue_url(&self, region: &str, name: &str) -> Result<String> {
        let key = (region.to_string(), name.to_string());
        self.state
            .read()
            .await
            .by_name
            .get(&key)
            .map(|q| q.url.clone())
            .ok_or_else(|| ServiceError::NonExistentQueue(name.to_string()))
    }

    /// Delete the queue and wake its long-pollers, which observe an empty
    /// result rather than an error.
    pub async fn delete_queue(&self, url: &str) -> Result<()> {
        let queue = {
            let mut state = self.state.write().await;
            let queue = state
                .by_url
                .remove(url)
                .ok_or_else(|| ServiceError::NonExistentQueue(url.to_string()))?;
            state
                .by_name
                .remove(&(queue.region.clone(), queue.name.clone()));
            state.by_arn.remove(&queue.arn);
            queue
        };
        queue.cancel_waiters().await;
        info!(queue = %queue.name, "queue deleted");
        Ok(())
    }

    /// List queue URLs sorted by ARN; the continuation token is the last
    /// returned ARN.
    pub async fn list_queues(
        &self,
        name_prefix: Option<&str>,
        next_token: Option<&str>,
        max_results: Option<usize>,
    ) -> (Vec<String>, Option<String>) {
        let state = self.state.read().await;
        let mut entries: Vec<(&String, &Arc<Queue>)> = state
            .by_arn
            .iter()
            .filter(|(_, q)| name_prefix.is_none_or(|p| q.name.starts_with(p)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let page_size = max_results
            .unwrap_or(LIST_QUEUES_PAGE_SIZE)
            .clamp(1, LIST_QUEUES_PAGE_SIZE);
        let page: Vec<(&String, &Arc<Queue>)> = entries
            .into_iter()
            .filter(|(queue_arn, _)| next_token.is_none_or(|t| queue_arn.as_str() > t))
            .take(page_size + 1)
            .collect();

        let has_more = page.len() > page_size;
        let page = &page[..page.len().min(page_size)];
        let token = if has_more {
            page.last().map(|(queue_arn, _)| (*queue_arn).clone())
        } else {
            None
        };
        (page.iter().map(|(_, q)| q.url.clone()).collect(), token)
    }

    pub async fn send_message(&self, url: &str, params: SendMessageParams) -> Result<SendOutcome> {
        let queue = self.resolve(url).await?;
        queue.send(params).await
    }

    pub async fn send_message_batch(
        &self,
        url: &str,
        entries: Vec<(String, SendMessageParams)>,
    ) -> Result<Vec<BatchEntryOutcome<SendOutcome>>> {
        let queue = self.resolve(url).await?;
        validate_batch_entry_ids(entries.iter().map(|(id, _)| id.as_str()))?;
        let mut outcomes = Vec::with_capacity(entries.len());
        for (id, params) in entries {
            let result = queue.send(params).await;
            outcomes.push(BatchEntryOutcome { id, result });
        }
        Ok(outcomes)
    }

    /// Receive with optional long-polling. The loop re-runs the dequeue on
    /// every waiter wake-up; deadline expiry and queue deletion resolve to
    /// an empty batch.
    pub async fn receive_message(
        &self,
        url: &str,
        request: ReceiveMessageRequest,
    ) -> Result<Vec<ReceivedMessage>> {
        let queue = self.resolve(url).await?;

        let max = match request.max_messages {
            None => 1,
            Some(n @ 1..=10) => n as usize,
            Some(n) => {
                return Err(ServiceError::InvalidParameterValue(format!(
                    "MaxNumberOfMessages must be between 1 and {MAX_RECEIVE_BATCH}, got {n}"
                )))
            }
        };
        if let Some(v) = request.visibility_timeout {
            if v > VISIBILITY_TIMEOUT_MAX {
                return Err(ServiceError::InvalidParameterValue(format!(
                    "VisibilityTimeout must be between 0 and {VISIBILITY_TIMEOUT_MAX}"
                )));
            }
        }
        let wait_seconds = match request.wait_time_seconds {
            None => {
                queue
                    .attribute_defaults()
                    .await
                    .receive_message_wait_time_seconds
            }
            Some(w) if w <= WAIT_TIME_MAX => w,
            Some(w) => {
                return Err(ServiceError::InvalidParameterValue(format!(
                    "WaitTimeSeconds must be between 0 and {WAIT_TIME_MAX}, got {w}"
                )))
            }
        };

        let deadline = self.clock.now_millis() + u64::from(wait_seconds) * 1000;
        loop {
            if queue.is_deleted().await {
                return Ok(Vec::new());
            }
            let (messages, redrives) = queue.dequeue(max, request.visibility_timeout).await;
            if !redrives.is_empty() {
                self.route_redrives(&queue, redrives).await;
            }
            if !messages.is_empty() {
                return Ok(messages);
            }
            let now = self.clock.now_millis();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let (waiter_id, rx) = queue.register_waiter().await;
            let remaining = Duration::from_millis(deadline - now);
            if tokio::time::timeout(remaining, rx).await.is_err() {
                queue.deregister_waiter(waiter_id).await;
            }
        }
    }

    /// Move redriven messages into their DLQ, emitting the `dlq` spy event
    /// under the source queue's name.
    async fn route_redrives(&self, source: &Arc<Queue>, redrives: Vec<DlqRedrive>) {
        for redrive in redrives {
            self.spy.add(source.dlq_event(&redrive.message)).await;
            match self.resolve_arn(&redrive.target_arn).await {
                Some(dlq) => {
                    let mut message = redrive.message;
                    // The copy in the DLQ starts a fresh delivery life.
                    message.delay_until = None;
                    message.sequence_number = None;
                    dlq.enqueue(message).await;
                }
                None => {
                    warn!(
                        source = %source.name,
                        target = %redrive.target_arn,
                        "dead-letter target does not exist; message dropped"
                    );
                }
            }
        }
    }

    pub async fn delete_message(&self, url: &str, receipt_handle: &str) -> Result<()> {
        let queue = self.resolve(url).await?;
        // Unknown handles are treated as success, matching the service.
        let _ = queue.delete_message(receipt_handle).await;
        Ok(())
    }

    pub async fn delete_message_batch(
        &self,
        url: &str,
        entries: Vec<(String, String)>,
    ) -> Result<Vec<BatchEntryOutcome<()>>> {
        let queue = self.resolve(url).await?;
        validate_batch_entry_ids(entries.iter().map(|(id, _)| id.as_str()))?;
        let mut outcomes = Vec::with_capacity(entries.len());
        for (id, receipt_handle) in entries {
            let _ = queue.delete_message(&receipt_handle).await;
            outcomes.push(BatchEntryOutcome { id, result: Ok(()) });
        }
        Ok(outcomes)
    }

    pub async fn change_visibility(
        &self,
        url: &str,
        receipt_handle: &str,
        seconds: u32,
    ) -> Result<()> {
        let queue = self.resolve(url).await?;
        queue.change_visibility(receipt_handle, seconds).await
    }

    pub async fn change_visibility_batch(
        &self,
        url: &str,
        entries: Vec<(String, String, u32)>,
    ) -> Result<Vec<BatchEntryOutcome<()>>> {
        let queue = self.resolve(url).await?;
        validate_batch_entry_ids(entries.iter().map(|(id, _, _)| id.as_str()))?;
        let mut outcomes = Vec::with_capacity(entries.len());
        for (id, receipt_handle, seconds) in entries {
            let result = queue.change_visibility(&receipt_handle, seconds).await;
            outcomes.push(BatchEntryOutcome { id, result });
        }
        Ok(outcomes)
    }

    pub async fn purge_queue(&self, url: &str) -> Result<()> {
        self.resolve(url).await?.purge().await;
        Ok(())
    }

    /// Attribute read with name filtering; `All` selects everything.
    pub async fn get_queue_attributes(
        &self,
        url: &str,
        names: &[String],
    ) -> Result<HashMap<String, String>> {
        let queue = self.resolve(url).await?;
        let all = queue.attributes_map().await;
        if names.is_empty() {
            return Ok(HashMap::new());
        }
        if names.iter().any(|n| n == "All") {
            return Ok(all);
        }
        let mut selected = HashMap::new();
        for name in names {
            if let Some(value) = all.get(name) {
                selected.insert(name.clone(), value.clone());
            }
        }
        Ok(selected)
    }

    pub async fn set_queue_attributes(
        &self,
        url: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<()> {
        self.resolve(url).await?.set_attributes(attributes).await
    }

    pub async fn tag_queue(&self, url: &str, tags: Vec<(String, String)>) -> Result<()> {
        self.resolve(url).await?.tag(tags).await;
        Ok(())
    }

    pub async fn untag_queue(&self, url: &str, keys: &[String]) -> Result<()> {
        self.resolve(url).await?.untag(keys).await;
        Ok(())
    }

    pub async fn list_queue_tags(&self, url: &str) -> Result<Vec<(String, String)>> {
        Ok(self.resolve(url).await?.tags().await)
    }

    /// Non-destructive inspection of a queue's pools.
    pub async fn inspect_queue(&self, url: &str) -> Result<QueueSnapshot> {
        Ok(self.resolve(url).await?.snapshot().await)
    }
}
