//! Declarative init config.
//!
//! A JSON document describing queues, topics, subscriptions, and buckets,
//! applied in dependency order through the idempotent create paths, so
//! re-applying the same config is a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::arn;
use crate::error::{Result, ServiceError};
use crate::queue::{CreateQueueRequest, QueueRegistry};
use crate::store::ObjectStore;
use crate::topic::TopicRegistry;

/// Top-level init document. `region` is the default for every resource;
/// each resource may override it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InitConfig {
    pub region: Option<String>,
    pub queues: Vec<QueueInit>,
    pub topics: Vec<TopicInit>,
    pub subscriptions: Vec<SubscriptionInit>,
    pub buckets: Vec<BucketInit>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueInit {
    pub name: String,
    pub region: Option<String>,
    pub attributes: HashMap<String, String>,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TopicInit {
    pub name: String,
    pub region: Option<String>,
    pub attributes: HashMap<String, String>,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubscriptionInit {
    /// Topic name within the effective region.
    pub topic: String,
    /// Queue name within the effective region.
    pub queue: String,
    pub region: Option<String>,
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BucketInit {
    pub name: String,
}

impl InitConfig {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| ServiceError::InvalidParameter(format!("Invalid init config: {e}")))
    }
}

fn sorted_tags(tags: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = tags
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    pairs.sort();
    pairs
}

/// Applies an init config to the live registries.
pub struct InitApplier {
    queues: Arc<QueueRegistry>,
    topics: Arc<TopicRegistry>,
    store: Arc<ObjectStore>,
    default_region: String,
    host: String,
}

impl InitApplier {
    pub fn new(
        queues: Arc<QueueRegistry>,
        topics: Arc<TopicRegistry>,
        store: Arc<ObjectStore>,
        default_region: String,
        host: String,
    ) -> Self {
        Self {
            queues,
            topics,
            store,
            default_region,
            host,
        }
    }

    /// Apply in dependency order: queues, topics, subscriptions, buckets.
    pub async fn apply(&self, config: &InitConfig) -> Result<()> {
        let default_region = config
            .region
            .clone()
            .unwrap_or_else(|| self.default_region.clone());
        let region_of =
            |overridden: &Option<String>| overridden.clone().unwrap_or_else(|| default_region.clone());

        for queue in &config.queues {
            self.queues
                .create_queue(CreateQueueRequest {
                    name: queue.name.clone(),
                    attributes: queue.attributes.clone(),
                    tags: sorted_tags(&queue.tags),
                    region: region_of(&queue.region),
                    request_host: self.host.clone(),
                })
                .await?;
        }

        for topic in &config.topics {
            self.topics
                .create_topic(
                    &topic.name,
                    &region_of(&topic.region),
                    topic.attributes.clone(),
                    sorted_tags(&topic.tags),
                )
                .await?;
        }

        for subscription in &config.subscriptions {
            let region = region_of(&subscription.region);
            let topic_arn = arn::topic_arn(&region, arn::DEFAULT_ACCOUNT, &subscription.topic);
            let endpoint = arn::queue_arn(&region, arn::DEFAULT_ACCOUNT, &subscription.queue);
            self.topics
                .subscribe(&topic_arn, "sqs", &endpoint, subscription.attributes.clone())
                .await?;
        }

        for bucket in &config.buckets {
            self.store.create_bucket(&bucket.name).await?;
        }

        info!(
            queues = config.queues.len(),
            topics = config.topics.len(),
            subscriptions = config.subscriptions.len(),
            buckets = config.buckets.len(),
            "init config applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::spy::SpyBus;

    fn applier() -> (InitApplier, Arc<QueueRegistry>, Arc<TopicRegistry>, Arc<ObjectStore>) {
        let clock: Arc<dyn crate::clock::Clock> = Arc::new(SystemClock);
        let spy = Arc::new(SpyBus::new(100));
        let queues = Arc::new(QueueRegistry::new(clock.clone(), spy.clone(), None));
        let topics = Arc::new(TopicRegistry::new());
        let store = Arc::new(ObjectStore::new(clock, spy));
        let applier = InitApplier::new(
            queues.clone(),
            topics.clone(),
            store.clone(),
            "us-east-1".to_string(),
            "localhost:4566".to_string(),
        );
        (applier, queues, topics, store)
    }

    fn sample_config() -> InitConfig {
        InitConfig::parse(
            r#"{
                "region": "us-east-1",
                "queues": [{"name": "orders"}],
                "topics": [{"name": "events"}],
                "subscriptions": [{"topic": "events", "queue": "orders"}],
                "buckets": [{"name": "artifacts"}]
            }"#,
        )
        .expect("parse")
    }

    #[tokio::test]
    async fn test_apply_creates_everything_in_order() {
        let (applier, queues, topics, store) = applier();
        applier.apply(&sample_config()).await.expect("apply");

        assert!(queues
            .get_queue_url("us-east-1", "orders")
            .await
            .is_ok());
        let topic_arn = arn::topic_arn("us-east-1", arn::DEFAULT_ACCOUNT, "events");
        let subs = topics.topic_subscriptions(&topic_arn).await.expect("subs");
        assert_eq!(subs.len(), 1);
        store.head_bucket("artifacts").await.expect("bucket exists");
    }

    #[tokio::test]
    async fn test_reapply_is_a_noop() {
        let (applier, queues, topics, _) = applier();
        let config = sample_config();
        applier.apply(&config).await.expect("first apply");

        // Enqueue between applies; the message must survive the second one.
        let url = queues
            .get_queue_url("us-east-1", "orders")
            .await
            .expect("url");
        queues
            .send_message(
                &url,
                crate::queue::SendMessageParams {
                    body: "survivor".to_string(),
                    ..Default::default()
                },
            )
            .await
            .expect("send");

        applier.apply(&config).await.expect("second apply");
        let snapshot = queues.inspect_queue(&url).await.expect("snapshot");
        assert_eq!(snapshot.ready.len(), 1);
        assert_eq!(snapshot.ready[0].body, "survivor");

        let topic_arn = arn::topic_arn("us-east-1", arn::DEFAULT_ACCOUNT, "events");
        let subs = topics.topic_subscriptions(&topic_arn).await.expect("subs");
        assert_eq!(subs.len(), 1, "subscription not duplicated");
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        assert!(InitConfig::parse("{nope").is_err());
    }
}
