//! Topic fan-out.
//!
//! Publishing resolves the topic's subscriptions in list order, applies
//! each subscription's filter policy, and enqueues either the raw message
//! or the notification envelope on the target queue. The envelope is built
//! once per publish; only `UnsubscribeURL` differs per delivery. A failing
//! subscription never affects the others.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::DateTime;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Result, ServiceError};
use crate::queue::{
    validate_batch_entry_ids, BatchEntryOutcome, MessageAttributeValue, Queue, QueueRegistry,
    SendMessageParams,
};
use crate::spy::{SpyBus, SpyEvent, SpyStatus};

use super::filter::{self, FilterScope};
use super::registry::{Subscription, TopicRegistry};

/// Maximum published message size in bytes.
pub const MAX_MESSAGE_BYTES: usize = 262_144;
/// Fixed certificate URL carried by every envelope.
pub const SIGNING_CERT_URL: &str =
    "https://sns.us-east-1.amazonaws.com/SimpleNotificationService-000000000000.pem";

const UNSUBSCRIBE_PLACEHOLDER: &str = "__UNSUBSCRIBE_URL__";

/// Lookup seam between the topic and queue services: the publisher only
/// needs to resolve a queue ARN to a delivery target.
#[async_trait]
pub trait QueueSink: Send + Sync {
    async fn queue_by_arn(&self, queue_arn: &str) -> Option<Arc<Queue>>;
}

#[async_trait]
impl QueueSink for QueueRegistry {
    async fn queue_by_arn(&self, queue_arn: &str) -> Option<Arc<Queue>> {
        self.resolve_arn(queue_arn).await
    }
}

/// Decoded Publish request.
#[derive(Debug, Clone, Default)]
pub struct PublishRequest {
    pub topic_arn: String,
    pub message: String,
    pub attributes: HashMap<String, MessageAttributeValue>,
    pub subject: Option<String>,
    pub group_id: Option<String>,
    pub dedup_id: Option<String>,
}

/// One entry of a PublishBatch request.
#[derive(Debug, Clone, Default)]
pub struct PublishBatchEntry {
    pub id: String,
    pub message: String,
    pub attributes: HashMap<String, MessageAttributeValue>,
    pub subject: Option<String>,
    pub group_id: Option<String>,
    pub dedup_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub message_id: String,
    pub sequence_number: Option<String>,
}

/// Fan-out pipeline from topics into queues.
pub struct Publisher {
    topics: Arc<TopicRegistry>,
    queues: Arc<dyn QueueSink>,
    spy: Arc<SpyBus>,
    clock: Arc<dyn Clock>,
    /// Host used when rendering per-subscription unsubscribe URLs.
    endpoint_host: String,
}

impl Publisher {
    pub fn new(
        topics: Arc<TopicRegistry>,
        queues: Arc<dyn QueueSink>,
        spy: Arc<SpyBus>,
        clock: Arc<dyn Clock>,
        endpoint_host: String,
    ) -> Self {
        Self {
            topics,
            queues,
            spy,
            clock,
            endpoint_host,
        }
    }

    pub async fn publish(&self, request: PublishRequest) -> Result<PublishOutcome> {
        let topic = self.topics.get_topic(&request.topic_arn).await?;

        if request.message.is_empty() {
            return Err(ServiceError::InvalidParameter("Empty message".to_string()));
        }
        if request.message.len() > MAX_MESSAGE_BYTES {
            return Err(ServiceError::InvalidParameterValue(format!(
                "Message must be shorter than {MAX_MESSAGE_BYTES} bytes"
            )));
        }

        let mut dedup_id = request.dedup_id.clone();
        let mut sequence_number = None;
        if topic.is_fifo() {
            if request.group_id.is_none() {
                return Err(ServiceError::InvalidParameter(
                    "MessageGroupId is required for FIFO topics".to_string(),
                ));
            }
            if dedup_id.is_none() {
                if topic.content_based_dedup() {
                    dedup_id = Some(crate::queue::fifo::content_based_dedup_id(
                        &request.message,
                    ));
                } else {
                    return Err(ServiceError::InvalidParameter(
                        "The topic should either have ContentBasedDeduplication enabled or MessageDeduplicationId provided explicitly".to_string(),
                    ));
                }
            }
            let counter = self.topics.next_topic_sequence(&topic.arn).await?;
            sequence_number = Some(crate::queue::fifo::format_sequence_number(counter));
        }

        let message_id = Uuid::new_v4().to_string();
        self.spy
            .add(SpyEvent::Sns {
                topic_arn: topic.arn.clone(),
                topic_name: topic.name.clone(),
                message_id: message_id.clone(),
                body: request.message.clone(),
                message_attributes: attributes_json(&request.attributes),
                status: SpyStatus::Published,
            })
            .await;

        // Identical for every subscription except UnsubscribeURL.
        let envelope = self.build_envelope(&message_id, &topic.arn, &request);

        let subscriptions = self.topics.topic_subscriptions(&topic.arn).await?;
        for subscription in subscriptions {
            self.deliver(&subscription, &request, &envelope, dedup_id.as_deref())
                .await;
        }

        Ok(PublishOutcome {
            message_id,
            sequence_number,
        })
    }

    /// Entries are processed independently; one entry's fault is reported
    /// in its own slot and never aborts the batch.
    pub async fn publish_batch(
        &self,
        topic_arn: &str,
        entries: Vec<PublishBatchEntry>,
    ) -> Result<Vec<BatchEntryOutcome<PublishOutcome>>> {
        self.topics.get_topic(topic_arn).await?;
        validate_batch_entry_ids(entries.iter().map(|e| e.id.as_str()))?;
        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            let result = self
                .publish(PublishRequest {
                    topic_arn: topic_arn.to_string(),
                    message: entry.message,
                    attributes: entry.attributes,
                    subject: entry.subject,
                    group_id: entry.group_id,
                    dedup_id: entry.dedup_id,
                })
                .await;
            outcomes.push(BatchEntryOutcome {
                id: entry.id,
                result,
            });
        }
        Ok(outcomes)
    }

    async fn deliver(
        &self,
        subscription: &Subscription,
        request: &PublishRequest,
        envelope: &Value,
        dedup_id: Option<&str>,
    ) {
        if !subscription.confirmed || subscription.protocol != "sqs" {
            return;
        }
        if let Some(policy) = subscription.filter_policy() {
            let scope = FilterScope::parse(subscription.filter_policy_scope());
            if !filter::evaluate(policy, scope, &request.attributes, &request.message) {
                debug!(subscription = %subscription.arn, "filter policy rejected message");
                return;
            }
        }
        let Some(queue) = self.queues.queue_by_arn(&subscription.endpoint).await else {
            warn!(
                subscription = %subscription.arn,
                endpoint = %subscription.endpoint,
                "subscribed queue does not exist; skipping delivery"
            );
            return;
        };

        let (body, attributes) = if subscription.raw_delivery() {
            (request.message.clone(), request.attributes.clone())
        } else {
            let unsubscribe = format!(
                "http://{}/?Action=Unsubscribe&SubscriptionArn={}",
                self.endpoint_host, subscription.arn
            );
            let mut enveloped = envelope.clone();
            enveloped["UnsubscribeURL"] = Value::String(unsubscribe);
            (enveloped.to_string(), HashMap::new())
        };

        let params = SendMessageParams {
            body,
            attributes,
            delay_seconds: None,
            group_id: if queue.fifo {
                request.group_id.clone()
            } else {
                None
            },
            dedup_id: if queue.fifo {
                dedup_id.map(str::to_string)
            } else {
                None
            },
        };
        match queue.send(params).await {
            Ok(outcome) if outcome.duplicate => {
                debug!(queue = %queue.name, "duplicate suppressed by target queue");
            }
            Ok(_) => {}
            Err(error) => {
                warn!(
                    queue = %queue.name,
                    subscription = %subscription.arn,
                    error = %error,
                    "delivery to subscribed queue failed"
                );
            }
        }
    }

    fn build_envelope(
        &self,
        message_id: &str,
        topic_arn: &str,
        request: &PublishRequest,
    ) -> Value {
        let timestamp = DateTime::from_timestamp_millis(self.clock.now_millis() as i64)
            .unwrap_or_default()
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string();

        let mut envelope = json!({
            "Type": "Notification",
            "MessageId": message_id,
            "TopicArn": topic_arn,
            "Subject": request.subject,
            "Message": request.message,
            "Timestamp": timestamp,
            "SignatureVersion": "1",
            "Signature": "EXAMPLE",
            "SigningCertURL": SIGNING_CERT_URL,
            "UnsubscribeURL": UNSUBSCRIBE_PLACEHOLDER,
        });
        if !request.attributes.is_empty() {
            let mut rendered = Map::new();
            for (name, attr) in &request.attributes {
                let value = if attr.data_type.starts_with("Binary") {
                    attr.binary_value
                        .as_deref()
                        .map(|b| BASE64.encode(b))
                        .unwrap_or_default()
                } else {
                    attr.string_value.clone().unwrap_or_default()
                };
                rendered.insert(
                    name.clone(),
                    json!({"Type": attr.data_type, "Value": value}),
                );
            }
            envelope["MessageAttributes"] = Value::Object(rendered);
        }
        envelope
    }
}

fn attributes_json(attributes: &HashMap<String, MessageAttributeValue>) -> HashMap<String, Value> {
    attributes
        .iter()
        .filter_map(|(name, attr)| serde_json::to_value(attr).ok().map(|v| (name.clone(), v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::queue::CreateQueueRequest;

    struct Fixture {
        queues: Arc<QueueRegistry>,
        topics: Arc<TopicRegistry>,
        publisher: Publisher,
        spy: Arc<SpyBus>,
    }

    fn fixture() -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let spy = Arc::new(SpyBus::new(100));
        let queues = Arc::new(QueueRegistry::new(clock.clone(), spy.clone(), None));
        let topics = Arc::new(TopicRegistry::new());
        let publisher = Publisher::new(
            topics.clone(),
            queues.clone(),
            spy.clone(),
            clock,
            "localhost:4566".to_string(),
        );
        Fixture {
            queues,
            topics,
            publisher,
            spy,
        }
    }

    async fn make_queue(fixture: &Fixture, name: &str) -> Arc<Queue> {
        fixture
            .queues
            .create_queue(CreateQueueRequest {
                name: name.to_string(),
                region: "us-east-1".to_string(),
                request_host: "localhost:4566".to_string(),
                ..Default::default()
            })
            .await
            .expect("create queue")
    }

    #[tokio::test]
    async fn test_publish_envelops_message_by_default() {
        let fixture = fixture();
        let queue = make_queue(&fixture, "audit").await;
        let topic = fixture
            .topics
            .create_topic("events", "us-east-1", HashMap::new(), Vec::new())
            .await
            .expect("topic");
        let sub = fixture
            .topics
            .subscribe(&topic.arn, "sqs", &queue.arn, HashMap::new())
            .await
            .expect("subscribe");

        let outcome = fixture
            .publisher
            .publish(PublishRequest {
                topic_arn: topic.arn.clone(),
                message: "hello".to_string(),
                subject: Some("greeting".to_string()),
                ..Default::default()
            })
            .await
            .expect("publish");

        let snapshot = queue.snapshot().await;
        assert_eq!(snapshot.ready.len(), 1);
        let envelope: Value =
            serde_json::from_str(&snapshot.ready[0].body).expect("envelope JSON");
        assert_eq!(envelope["Type"], "Notification");
        assert_eq!(envelope["Message"], "hello");
        assert_eq!(envelope["Subject"], "greeting");
        assert_eq!(envelope["MessageId"], Value::String(outcome.message_id));
        assert_eq!(envelope["Signature"], "EXAMPLE");
        let unsubscribe = envelope["UnsubscribeURL"].as_str().expect("url");
        assert!(unsubscribe.contains(&sub.arn));
    }

    #[tokio::test]
    async fn test_raw_delivery_passes_body_and_attributes() {
        let fixture = fixture();
        let queue = make_queue(&fixture, "raw").await;
        let topic = fixture
            .topics
            .create_topic("events", "us-east-1", HashMap::new(), Vec::new())
            .await
            .expect("topic");
        let mut attrs = HashMap::new();
        attrs.insert("RawMessageDelivery".to_string(), "true".to_string());
        fixture
            .topics
            .subscribe(&topic.arn, "sqs", &queue.arn, attrs)
            .await
            .expect("subscribe");

        let mut message_attrs = HashMap::new();
        message_attrs.insert("kind".to_string(), MessageAttributeValue::string("x"));
        fixture
            .publisher
            .publish(PublishRequest {
                topic_arn: topic.arn.clone(),
                message: "payload".to_string(),
                attributes: message_attrs.clone(),
                ..Default::default()
            })
            .await
            .expect("publish");

        let snapshot = queue.snapshot().await;
        assert_eq!(snapshot.ready[0].body, "payload");
        assert_eq!(snapshot.ready[0].attributes, message_attrs);
    }

    #[tokio::test]
    async fn test_filter_policy_skips_non_matching_subscription() {
        let fixture = fixture();
        let matching = make_queue(&fixture, "matching").await;
        let filtered = make_queue(&fixture, "filtered").await;
        let topic = fixture
            .topics
            .create_topic("events", "us-east-1", HashMap::new(), Vec::new())
            .await
            .expect("topic");
        fixture
            .topics
            .subscribe(&topic.arn, "sqs", &matching.arn, HashMap::new())
            .await
            .expect("subscribe");
        let mut attrs = HashMap::new();
        attrs.insert(
            "FilterPolicy".to_string(),
            r#"{"fileExtension":["json"]}"#.to_string(),
        );
        fixture
            .topics
            .subscribe(&topic.arn, "sqs", &filtered.arn, attrs)
            .await
            .expect("subscribe filtered");

        let mut message_attrs = HashMap::new();
        message_attrs.insert(
            "fileExtension".to_string(),
            MessageAttributeValue::string("txt"),
        );
        fixture
            .publisher
            .publish(PublishRequest {
                topic_arn: topic.arn.clone(),
                message: "doc".to_string(),
                attributes: message_attrs,
                ..Default::default()
            })
            .await
            .expect("publish");

        assert_eq!(matching.snapshot().await.ready.len(), 1);
        assert_eq!(filtered.snapshot().await.ready.len(), 0);
    }

    #[tokio::test]
    async fn test_publish_emits_sns_spy_event_even_without_subscribers() {
        let fixture = fixture();
        let topic = fixture
            .topics
            .create_topic("lonely", "us-east-1", HashMap::new(), Vec::new())
            .await
            .expect("topic");
        fixture
            .publisher
            .publish(PublishRequest {
                topic_arn: topic.arn.clone(),
                message: "nobody listens".to_string(),
                ..Default::default()
            })
            .await
            .expect("publish");
        let events = fixture.spy.events().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SpyEvent::Sns { .. }));
    }

    #[tokio::test]
    async fn test_fifo_topic_requires_group_and_dedup() {
        let fixture = fixture();
        let mut attrs = HashMap::new();
        attrs.insert("FifoTopic".to_string(), "true".to_string());
        let topic = fixture
            .topics
            .create_topic("stream.fifo", "us-east-1", attrs, Vec::new())
            .await
            .expect("topic");

        let missing_group = fixture
            .publisher
            .publish(PublishRequest {
                topic_arn: topic.arn.clone(),
                message: "x".to_string(),
                ..Default::default()
            })
            .await;
        assert!(missing_group.is_err());

        let missing_dedup = fixture
            .publisher
            .publish(PublishRequest {
                topic_arn: topic.arn.clone(),
                message: "x".to_string(),
                group_id: Some("g".to_string()),
                ..Default::default()
            })
            .await;
        assert!(missing_dedup.is_err());

        let explicit = fixture
            .publisher
            .publish(PublishRequest {
                topic_arn: topic.arn.clone(),
                message: "x".to_string(),
                group_id: Some("g".to_string()),
                dedup_id: Some("d1".to_string()),
                ..Default::default()
            })
            .await
            .expect("publish");
        assert_eq!(
            explicit.sequence_number.as_deref().map(str::len),
            Some(20)
        );
    }

    #[tokio::test]
    async fn test_publish_batch_isolates_entry_failures() {
        let fixture = fixture();
        let topic = fixture
            .topics
            .create_topic("batch", "us-east-1", HashMap::new(), Vec::new())
            .await
            .expect("topic");
        let outcomes = fixture
            .publisher
            .publish_batch(
                &topic.arn,
                vec![
                    PublishBatchEntry {
                        id: "ok".to_string(),
                        message: "fine".to_string(),
                        ..Default::default()
                    },
                    PublishBatchEntry {
                        id: "bad".to_string(),
                        message: String::new(),
                        ..Default::default()
                    },
                ],
            )
            .await
            .expect("batch accepted");
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[1].result.is_err());
    }
}
