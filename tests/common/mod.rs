//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use minicloud::queue::{
    CreateQueueRequest, Queue, ReceiveMessageRequest, ReceivedMessage, SendMessageParams,
    SendOutcome,
};
use minicloud::{App, AppConfig};

pub const TEST_HOST: &str = "localhost:4566";

pub fn test_app() -> Arc<App> {
    Arc::new(App::new(AppConfig::default()))
}

pub async fn create_queue(app: &App, name: &str, attributes: &[(&str, &str)]) -> Arc<Queue> {
    let attributes: HashMap<String, String> = attributes
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    app.queues
        .create_queue(CreateQueueRequest {
            name: name.to_string(),
            attributes,
            tags: Vec::new(),
            region: "us-east-1".to_string(),
            request_host: TEST_HOST.to_string(),
        })
        .await
        .expect("create queue")
}

pub async fn send(app: &App, url: &str, body: &str) -> SendOutcome {
    app.queues
        .send_message(
            url,
            SendMessageParams {
                body: body.to_string(),
                ..Default::default()
            },
        )
        .await
        .expect("send message")
}

pub async fn send_grouped(app: &App, url: &str, body: &str, group: &str) -> SendOutcome {
    app.queues
        .send_message(
            url,
            SendMessageParams {
                body: body.to_string(),
                group_id: Some(group.to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("send grouped message")
}

pub async fn receive(
    app: &App,
    url: &str,
    max: u32,
    visibility: Option<u32>,
    wait: Option<u32>,
) -> Vec<ReceivedMessage> {
    app.queues
        .receive_message(
            url,
            ReceiveMessageRequest {
                max_messages: Some(max),
                visibility_timeout: visibility,
                wait_time_seconds: wait,
            },
        )
        .await
        .expect("receive messages")
}
