//! Topic and subscription registry.
//!
//! The registry owns both sides of the topic↔subscription relationship;
//! each side refers to the other only by ARN. Creation is idempotent with
//! deliberately asymmetric conflict rules: `create_topic` compares only the
//! attribute keys the caller provided, while `subscribe` requires the full
//! attribute set to be identical.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::arn;
use crate::error::{Result, ServiceError};

/// Page size for topic/subscription listings.
pub const LIST_PAGE_SIZE: usize = 100;

/// A topic and the ordered list of its subscription ARNs.
#[derive(Debug, Clone)]
pub struct Topic {
    pub arn: String,
    pub name: String,
    pub attributes: HashMap<String, String>,
    pub tags: Vec<(String, String)>,
    pub subscription_arns: Vec<String>,
    /// Per-topic counter behind FIFO publish sequence numbers.
    pub sequence_counter: u64,
}

impl Topic {
    pub fn is_fifo(&self) -> bool {
        self.attributes.get("FifoTopic").map(String::as_str) == Some("true")
    }

    pub fn content_based_dedup(&self) -> bool {
        self.attributes.get("ContentBasedDeduplication").map(String::as_str) == Some("true")
    }
}

/// A subscription; only `protocol = "sqs"` endpoints are ever delivered.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub arn: String,
    pub topic_arn: String,
    pub protocol: String,
    pub endpoint: String,
    pub confirmed: bool,
    pub attributes: HashMap<String, String>,
}

impl Subscription {
    pub fn raw_delivery(&self) -> bool {
        self.attributes.get("RawMessageDelivery").map(String::as_str) == Some("true")
    }

    pub fn filter_policy(&self) -> Option<&str> {
        self.attributes.get("FilterPolicy").map(String::as_str)
    }

    pub fn filter_policy_scope(&self) -> &str {
        self.attributes
            .get("FilterPolicyScope")
            .map(String::as_str)
            .unwrap_or("MessageAttributes")
    }
}

struct TopicState {
    topics: HashMap<String, Topic>,
    subscriptions: HashMap<String, Subscription>,
}

/// Registry of topics and subscriptions, keyed by ARN.
pub struct TopicRegistry {
    account: String,
    state: RwLock<TopicState>,
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self {
            account: arn::DEFAULT_ACCOUNT.to_string(),
            state: RwLock::new(TopicState {
                topics: HashMap::new(),
                subscriptions: HashMap::new(),
            }),
        }
    }

    /// Idempotent create. For an existing topic, each caller-provided
    /// attribute must match the stored value (keys not mentioned are
    /// ignored); tags, when provided, must match exactly.
    pub async fn create_topic(
        &self,
        name: &str,
        region: &str,
        attributes: HashMap<String, String>,
        tags: Vec<(String, String)>,
    ) -> Result<Topic> {
        if !arn::is_valid_resource_name(name) {
            return Err(ServiceError::InvalidParameter(format!(
                "Invalid topic name: {name}"
            )));
        }
        let fifo_suffix = arn::is_fifo_name(name);
        let fifo_attr = attributes.get("FifoTopic").map(String::as_str) == Some("true");
        if fifo_attr && !fifo_suffix {
            return Err(ServiceError::InvalidParameter(
                "FIFO topic names must end with .fifo".to_string(),
            ));
        }

        let topic_arn = arn::topic_arn(region, &self.account, name);
        let mut state = self.state.write().await;
        if let Some(existing) = state.topics.get(&topic_arn) {
            for (key, value) in &attributes {
                if existing.attributes.get(key) != Some(value) {
                    return Err(ServiceError::InvalidParameter(format!(
                        "Topic already exists with different attributes: {key}"
                    )));
                }
            }
            if !tags.is_empty() && tags != existing.tags {
                return Err(ServiceError::InvalidParameter(
                    "Topic already exists with different tags".to_string(),
                ));
            }
            return Ok(existing.clone());
        }

        let mut attributes = attributes;
        if fifo_suffix {
            attributes.insert("FifoTopic".to_string(), "true".to_string());
        }
        let topic = Topic {
            arn: topic_arn.clone(),
            name: name.to_string(),
            attributes,
            tags,
            subscription_arns: Vec::new(),
            sequence_counter: 0,
        };
        state.topics.insert(topic_arn.clone(), topic.clone());
        info!(topic = %name, arn = %topic_arn, "topic created");
        Ok(topic)
    }

    pub async fn get_topic(&self, topic_arn: &str) -> Result<Topic> {
        self.state
            .read()
            .await
            .topics
            .get(topic_arn)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(topic_arn.to_string()))
    }

    /// Delete a topic together with its subscriptions.
    pub async fn delete_topic(&self, topic_arn: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let topic = state
            .topics
            .remove(topic_arn)
            .ok_or_else(|| ServiceError::NotFound(topic_arn.to_string()))?;
        for sub_arn in &topic.subscription_arns {
            state.subscriptions.remove(sub_arn);
        }
        info!(topic = %topic.name, "topic deleted");
        Ok(())
    }

    /// Attribute view including the computed subscription counters and the
    /// fixed delivery policy the real service always reports.
    pub async fn get_topic_attributes(&self, topic_arn: &str) -> Result<HashMap<String, String>> {
        let state = self.state.read().await;
        let topic = state
            .topics
            .get(topic_arn)
            .ok_or_else(|| ServiceError::NotFound(topic_arn.to_string()))?;
        let confirmed = topic
            .subscription_arns
            .iter()
            .filter_map(|a| state.subscriptions.get(a))
            .filter(|s| s.confirmed)
            .count();
        let pending = topic.subscription_arns.len() - confirmed;

        let mut map = topic.attributes.clone();
        map.insert("TopicArn".to_string(), topic.arn.clone());
        map.insert("Owner".to_string(), self.account.clone());
        map.insert("SubscriptionsConfirmed".to_string(), confirmed.to_string());
        map.insert("SubscriptionsPending".to_string(), pending.to_string());
        map.insert("SubscriptionsDeleted".to_string(), "0".to_string());
        map.entry("DisplayName".to_string()).or_default();
        map.insert(
            "EffectiveDeliveryPolicy".to_string(),
            r#"{"http":{"defaultHealthyRetryPolicy":{"minDelayTarget":20,"maxDelayTarget":20,"numRetries":3,"numMaxDelayRetries":0,"numNoDelayRetries":0,"numMinDelayRetries":0,"backoffFunction":"linear"},"disableSubscriptionOverrides":false}}"#
                .to_string(),
        );
        Ok(map)
    }

    pub async fn set_topic_attribute(
        &self,
        topic_arn: &str,
        name: &str,
        value: String,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let topic = state
            .topics
            .get_mut(topic_arn)
            .ok_or_else(|| ServiceError::NotFound(topic_arn.to_string()))?;
        topic.attributes.insert(name.to_string(), value);
        Ok(())
    }

    /// Subscribe an endpoint. An identical existing subscription is
    /// returned as-is; the same triple with different attributes is a
    /// conflict (both directions compared).
    pub async fn subscribe(
        &self,
        topic_arn: &str,
        protocol: &str,
        endpoint: &str,
        attributes: HashMap<String, String>,
    ) -> Result<Subscription> {
        let mut state = self.state.write().await;
        if !state.topics.contains_key(topic_arn) {
            return Err(ServiceError::NotFound(topic_arn.to_string()));
        }

        let existing = state
            .subscriptions
            .values()
            .find(|s| {
                s.topic_arn == topic_arn && s.protocol == protocol && s.endpoint == endpoint
            })
            .cloned();
        if let Some(existing) = existing {
            if existing.attributes == attributes {
                return Ok(existing);
            }
            return Err(ServiceError::InvalidParameter(
                "Subscription already exists with different attributes".to_string(),
            ));
        }

        let sub_arn = arn::subscription_arn(topic_arn, &Uuid::new_v4().to_string());
        let subscription = Subscription {
            arn: sub_arn.clone(),
            topic_arn: topic_arn.to_string(),
            protocol: protocol.to_string(),
            endpoint: endpoint.to_string(),
            confirmed: protocol == "sqs",
            attributes,
        };
        state
            .subscriptions
            .insert(sub_arn.clone(), subscription.clone());
        if let Some(topic) = state.topics.get_mut(topic_arn) {
            topic.subscription_arns.push(sub_arn.clone());
        }
        info!(topic = %topic_arn, endpoint = %endpoint, protocol = %protocol, "subscription created");
        Ok(subscription)
    }

    pub async fn unsubscribe(&self, sub_arn: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let subscription = state
            .subscriptions
            .remove(sub_arn)
            .ok_or_else(|| ServiceError::NotFound(sub_arn.to_string()))?;
        if let Some(topic) = state.topics.get_mut(&subscription.topic_arn) {
            topic.subscription_arns.retain(|a| a != sub_arn);
        }
        Ok(())
    }

    /// No-op for sqs subscriptions; returns the subscription ARN.
    pub async fn confirm_subscription(&self, topic_arn: &str) -> Result<String> {
        let state = self.state.read().await;
        let topic = state
            .topics
            .get(topic_arn)
            .ok_or_else(|| ServiceError::NotFound(topic_arn.to_string()))?;
        topic
            .subscription_arns
            .first()
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(topic_arn.to_string()))
    }

    pub async fn get_subscription(&self, sub_arn: &str) -> Result<Subscription> {
        self.state
            .read()
            .await
            .subscriptions
            .get(sub_arn)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(sub_arn.to_string()))
    }

    pub async fn set_subscription_attribute(
        &self,
        sub_arn: &str,
        name: &str,
        value: String,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let subscription = state
            .subscriptions
            .get_mut(sub_arn)
            .ok_or_else(|| ServiceError::NotFound(sub_arn.to_string()))?;
        subscription.attributes.insert(name.to_string(), value);
        Ok(())
    }

    /// Subscriptions of a topic in the order they were added.
    pub async fn topic_subscriptions(&self, topic_arn: &str) -> Result<Vec<Subscription>> {
        let state = self.state.read().await;
        let topic = state
            .topics
            .get(topic_arn)
            .ok_or_else(|| ServiceError::NotFound(topic_arn.to_string()))?;
        Ok(topic
            .subscription_arns
            .iter()
            .filter_map(|a| state.subscriptions.get(a))
            .cloned()
            .collect())
    }

    /// Claim the next FIFO sequence number for a topic.
    pub async fn next_topic_sequence(&self, topic_arn: &str) -> Result<u64> {
        let mut state = self.state.write().await;
        let topic = state
            .topics
            .get_mut(topic_arn)
            .ok_or_else(|| ServiceError::NotFound(topic_arn.to_string()))?;
        topic.sequence_counter += 1;
        Ok(topic.sequence_counter)
    }

    // -- paginated listings (sorted by ARN, token = cursor ARN) -----------

    pub async fn list_topics(&self, next_token: Option<&str>) -> (Vec<String>, Option<String>) {
        let state = self.state.read().await;
        let mut arns: Vec<String> = state.topics.keys().cloned().collect();
        arns.sort();
        paginate(arns, next_token)
    }

    pub async fn list_subscriptions(
        &self,
        next_token: Option<&str>,
    ) -> (Vec<Subscription>, Option<String>) {
        let state = self.state.read().await;
        let mut arns: Vec<String> = state.subscriptions.keys().cloned().collect();
        arns.sort();
        let (page, token) = paginate(arns, next_token);
        (
            page.iter()
                .filter_map(|a| state.subscriptions.get(a))
                .cloned()
                .collect(),
            token,
        )
    }

    pub async fn list_subscriptions_by_topic(
        &self,
        topic_arn: &str,
        next_token: Option<&str>,
    ) -> Result<(Vec<Subscription>, Option<String>)> {
        let state = self.state.read().await;
        let topic = state
            .topics
            .get(topic_arn)
            .ok_or_else(|| ServiceError::NotFound(topic_arn.to_string()))?;
        let mut arns: Vec<String> = topic.subscription_arns.clone();
        arns.sort();
        let (page, token) = paginate(arns, next_token);
        Ok((
            page.iter()
                .filter_map(|a| state.subscriptions.get(a))
                .cloned()
                .collect(),
            token,
        ))
    }

    // -- tags --------------------------------------------------------------

    pub async fn tag_resource(&self, topic_arn: &str, tags: Vec<(String, String)>) -> Result<()> {
        let mut state = self.state.write().await;
        let topic = state
            .topics
            .get_mut(topic_arn)
            .ok_or_else(|| ServiceError::NotFound(topic_arn.to_string()))?;
        for (key, value) in tags {
            match topic.tags.iter_mut().find(|(k, _)| *k == key) {
                Some(existing) => existing.1 = value,
                None => topic.tags.push((key, value)),
            }
        }
        Ok(())
    }

    pub async fn untag_resource(&self, topic_arn: &str, keys: &[String]) -> Result<()> {
        let mut state = self.state.write().await;
        let topic = state
            .topics
            .get_mut(topic_arn)
            .ok_or_else(|| ServiceError::NotFound(topic_arn.to_string()))?;
        topic.tags.retain(|(k, _)| !keys.contains(k));
        Ok(())
    }

    pub async fn list_tags(&self, topic_arn: &str) -> Result<Vec<(String, String)>> {
        Ok(self.get_topic(topic_arn).await?.tags)
    }
}

/// Shared registry handle.
pub type SharedTopicRegistry = Arc<TopicRegistry>;

fn paginate(sorted: Vec<String>, next_token: Option<&str>) -> (Vec<String>, Option<String>) {
    let remaining: Vec<String> = sorted
        .into_iter()
        .filter(|a| next_token.is_none_or(|t| a.as_str() > t))
        .collect();
    let has_more = remaining.len() > LIST_PAGE_SIZE;
    let page: Vec<String> = remaining.into_iter().take(LIST_PAGE_SIZE).collect();
    let token = if has_more { page.last().cloned() } else { None };
    (page, token)
}
