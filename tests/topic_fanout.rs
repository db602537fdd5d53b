//! End-to-end topic fan-out: filter policies, envelopes, and spy
//! observation across the topic→queue boundary.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value};

use minicloud::queue::MessageAttributeValue;
use minicloud::topic::PublishRequest;
use minicloud::{SpyFilter, SpyStatus};

use common::{create_queue, receive, test_app};

#[tokio::test]
async fn test_filtered_fanout_delivers_selectively() {
    let app = test_app();
    let audit = create_queue(&app, "audit", &[]).await;
    let analytics = create_queue(&app, "analytics", &[]).await;

    let topic = app
        .topics
        .create_topic("t", "us-east-1", HashMap::new(), Vec::new())
        .await
        .expect("topic");
    app.topics
        .subscribe(&topic.arn, "sqs", &audit.arn, HashMap::new())
        .await
        .expect("subscribe audit");
    let mut filter_attrs = HashMap::new();
    filter_attrs.insert(
        "FilterPolicy".to_string(),
        r#"{"fileExtension":["json"]}"#.to_string(),
    );
    app.topics
        .subscribe(&topic.arn, "sqs", &analytics.arn, filter_attrs)
        .await
        .expect("subscribe analytics");

    let mut attributes = HashMap::new();
    attributes.insert(
        "fileExtension".to_string(),
        MessageAttributeValue::string("txt"),
    );
    app.publisher
        .publish(PublishRequest {
            topic_arn: topic.arn.clone(),
            message: "report ready".to_string(),
            attributes,
            ..Default::default()
        })
        .await
        .expect("publish");

    // audit receives exactly one enveloped message.
    let messages = receive(&app, &audit.url, 10, None, None).await;
    assert_eq!(messages.len(), 1);
    let envelope: Value = serde_json::from_str(&messages[0].body).expect("envelope");
    assert_eq!(envelope["Type"], "Notification");
    assert_eq!(envelope["Message"], "report ready");

    // analytics receives nothing within the watch window.
    app.spy
        .expect_no_message(
            SpyFilter::partial(json!({"service": "sqs", "queueName": "analytics"})),
            Some(SpyStatus::Published),
            Duration::from_millis(200),
        )
        .await
        .expect("analytics stays quiet");
    assert!(receive(&app, &analytics.url, 10, None, None).await.is_empty());
}

#[tokio::test]
async fn test_body_scope_filter() {
    let app = test_app();
    let queue = create_queue(&app, "body-filtered", &[]).await;
    let topic = app
        .topics
        .create_topic("states", "us-east-1", HashMap::new(), Vec::new())
        .await
        .expect("topic");
    let mut attrs = HashMap::new();
    attrs.insert(
        "FilterPolicy".to_string(),
        r#"{"detail": {"state": ["running"]}}"#.to_string(),
    );
    attrs.insert("FilterPolicyScope".to_string(), "MessageBody".to_string());
    attrs.insert("RawMessageDelivery".to_string(), "true".to_string());
    app.topics
        .subscribe(&topic.arn, "sqs", &queue.arn, attrs)
        .await
        .expect("subscribe");

    app.publisher
        .publish(PublishRequest {
            topic_arn: topic.arn.clone(),
            message: r#"{"detail": {"state": "stopped"}}"#.to_string(),
            ..Default::default()
        })
        .await
        .expect("publish non-matching");
    app.publisher
        .publish(PublishRequest {
            topic_arn: topic.arn.clone(),
            message: r#"{"detail": {"state": "running"}}"#.to_string(),
            ..Default::default()
        })
        .await
        .expect("publish matching");

    let messages = receive(&app, &queue.url, 10, None, None).await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].body.contains("running"));
}

#[tokio::test]
async fn test_fanout_into_fifo_queue_deduplicates() {
    let app = test_app();
    let queue = create_queue(&app, "stream.fifo", &[("FifoQueue", "true")]).await;
    let mut topic_attrs = HashMap::new();
    topic_attrs.insert("FifoTopic".to_string(), "true".to_string());
    let topic = app
        .topics
        .create_topic("stream.fifo", "us-east-1", topic_attrs, Vec::new())
        .await
        .expect("topic");
    let mut sub_attrs = HashMap::new();
    sub_attrs.insert("RawMessageDelivery".to_string(), "true".to_string());
    app.topics
        .subscribe(&topic.arn, "sqs", &queue.arn, sub_attrs)
        .await
        .expect("subscribe");

    for _ in 0..2 {
        app.publisher
            .publish(PublishRequest {
                topic_arn: topic.arn.clone(),
                message: "tick".to_string(),
                group_id: Some("g".to_string()),
                dedup_id: Some("same-id".to_string()),
                ..Default::default()
            })
            .await
            .expect("publish");
    }

    let snapshot = app.queues.inspect_queue(&queue.url).await.expect("inspect");
    assert_eq!(snapshot.ready.len(), 1, "duplicate publish suppressed");
}

#[tokio::test]
async fn test_subscription_order_preserved_in_fanout() {
    let app = test_app();
    let first = create_queue(&app, "first", &[]).await;
    let second = create_queue(&app, "second", &[]).await;
    let topic = app
        .topics
        .create_topic("ordered", "us-east-1", HashMap::new(), Vec::new())
        .await
        .expect("topic");
    app.topics
        .subscribe(&topic.arn, "sqs", &first.arn, HashMap::new())
        .await
        .expect("subscribe first");
    app.topics
        .subscribe(&topic.arn, "sqs", &second.arn, HashMap::new())
        .await
        .expect("subscribe second");

    app.publisher
        .publish(PublishRequest {
            topic_arn: topic.arn.clone(),
            message: "ping".to_string(),
            ..Default::default()
        })
        .await
        .expect("publish");

    // Delivery follows subscription list order: sns publish, then the two
    // queue publish events in subscribe order.
    let events = app.spy.events().await;
    let queue_names: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            minicloud::SpyEvent::Sqs { queue_name, .. } => Some(queue_name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(queue_names, vec!["first".to_string(), "second".to_string()]);
}

#[tokio::test]
async fn test_unsubscribed_and_missing_queues_are_skipped() {
    let app = test_app();
    let queue = create_queue(&app, "survivor", &[]).await;
    let topic = app
        .topics
        .create_topic("mixed", "us-east-1", HashMap::new(), Vec::new())
        .await
        .expect("topic");
    app.topics
        .subscribe(
            &topic.arn,
            "sqs",
            "arn:aws:sqs:us-east-1:000000000000:ghost",
            HashMap::new(),
        )
        .await
        .expect("subscribe ghost");
    app.topics
        .subscribe(&topic.arn, "sqs", &queue.arn, HashMap::new())
        .await
        .expect("subscribe survivor");

    app.publisher
        .publish(PublishRequest {
            topic_arn: topic.arn.clone(),
            message: "still delivered".to_string(),
            ..Default::default()
        })
        .await
        .expect("publish succeeds despite missing endpoint");

    assert_eq!(receive(&app, &queue.url, 10, None, None).await.len(), 1);
}
