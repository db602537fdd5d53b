//! Queue service shell: the `x-amz-json-1.0` protocol.
//!
//! Decodes `AmazonSQS.<Action>` JSON payloads into core request structs
//! and renders core results back as protocol JSON. No queue semantics live
//! here.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::app::App;
use crate::error::{Fault, Result, ServiceError};
use crate::queue::{
    BatchEntryOutcome, CreateQueueRequest, MessageAttributeValue, ReceiveMessageRequest,
    ReceivedMessage, SendMessageParams, SendOutcome,
};

use super::{region_from_headers, request_host, sqs_error_response};

const TARGET_PREFIX: &str = "AmazonSQS.";

pub(crate) async fn handle(app: &Arc<App>, headers: &HeaderMap, body: &[u8]) -> Response {
    let action = headers
        .get("x-amz-target")
        .and_then(|v| v.to_str().ok())
        .and_then(|t| t.strip_prefix(TARGET_PREFIX))
        .map(str::to_string);
    let Some(action) = action else {
        return sqs_error_response(&ServiceError::InvalidParameterValue(
            "Missing or malformed x-amz-target header".to_string(),
        ));
    };

    let region = region_from_headers(app, headers);
    let host = request_host(app, headers);
    let payload = if body.is_empty() { b"{}" as &[u8] } else { body };
    debug!(action = %action, region = %region, "queue action");

    match route(app, &action, &region, &host, payload).await {
        Ok(value) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "application/x-amz-json-1.0")],
            value.to_string(),
        )
            .into_response(),
        Err(error) => sqs_error_response(&error),
    }
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| {
        ServiceError::InvalidParameterValue(format!("Malformed request payload: {e}"))
    })
}

async fn route(
    app: &Arc<App>,
    action: &str,
    region: &str,
    host: &str,
    payload: &[u8],
) -> Result<Value> {
    match action {
        "CreateQueue" => create_queue(app, region, host, decode(payload)?).await,
        "DeleteQueue" => delete_queue(app, decode(payload)?).await,
        "GetQueueUrl" => get_queue_url(app, region, decode(payload)?).await,
        "ListQueues" => list_queues(app, decode(payload)?).await,
        "GetQueueAttributes" => get_queue_attributes(app, decode(payload)?).await,
        "SetQueueAttributes" => set_queue_attributes(app, decode(payload)?).await,
        "PurgeQueue" => purge_queue(app, decode(payload)?).await,
        "SendMessage" => send_message(app, decode(payload)?).await,
        "SendMessageBatch" => send_message_batch(app, decode(payload)?).await,
        "ReceiveMessage" => receive_message(app, decode(payload)?).await,
        "DeleteMessage" => delete_message(app, decode(payload)?).await,
        "DeleteMessageBatch" => delete_message_batch(app, decode(payload)?).await,
        "ChangeMessageVisibility" => change_visibility(app, decode(payload)?).await,
        "ChangeMessageVisibilityBatch" => change_visibility_batch(app, decode(payload)?).await,
        "TagQueue" => tag_queue(app, decode(payload)?).await,
        "UntagQueue" => untag_queue(app, decode(payload)?).await,
        "ListQueueTags" => list_queue_tags(app, decode(payload)?).await,
        other => Err(ServiceError::InvalidParameterValue(format!(
            "Unknown action: {other}"
        ))),
    }
}

// -- queue management ------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateQueueInput {
    #[serde(rename = "QueueName")]
    queue_name: String,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
    #[serde(rename = "tags", default)]
    tags: HashMap<String, String>,
}

async fn create_queue(
    app: &Arc<App>,
    region: &str,
    host: &str,
    input: CreateQueueInput,
) -> Result<Value> {
    let mut tags: Vec<(String, String)> = input.tags.into_iter().collect();
    tags.sort();
    let queue = app
        .queues
        .create_queue(CreateQueueRequest {
            name: input.queue_name,
            attributes: input.attributes,
            tags,
            region: region.to_string(),
            request_host: host.to_string(),
        })
        .await?;
    Ok(json!({"QueueUrl": queue.url}))
}

#[derive(Debug, Deserialize)]
struct QueueUrlInput {
    #[serde(rename = "QueueUrl")]
    queue_url: String,
}

async fn delete_queue(app: &Arc<App>, input: QueueUrlInput) -> Result<Value> {
    app.queues.delete_queue(&input.queue_url).await?;
    Ok(json!({}))
}

#[derive(Debug, Deserialize)]
struct GetQueueUrlInput {
    #[serde(rename = "QueueName")]
    queue_name: String,
}

async fn get_queue_url(app: &Arc<App>, region: &str, input: GetQueueUrlInput) -> Result<Value> {
    let url = app.queues.get_queue_url(region, &input.queue_name).await?;
    Ok(json!({"QueueUrl": url}))
}

#[derive(Debug, Default, Deserialize)]
struct ListQueuesInput {
    #[serde(rename = "QueueNamePrefix", default)]
    prefix: Option<String>,
    #[serde(rename = "NextToken", default)]
    next_token: Option<String>,
    #[serde(rename = "MaxResults", default)]
    max_results: Option<usize>,
}

async fn list_queues(app: &Arc<App>, input: ListQueuesInput) -> Result<Value> {
    let (urls, token) = app
        .queues
        .list_queues(
            input.prefix.as_deref(),
            input.next_token.as_deref(),
            input.max_results,
        )
        .await;
    let mut output = Map::new();
    output.insert("QueueUrls".to_string(), json!(urls));
    if let Some(token) = token {
        output.insert("NextToken".to_string(), json!(token));
    }
    Ok(Value::Object(output))
}

#[derive(Debug, Deserialize)]
struct GetQueueAttributesInput {
    #[serde(rename = "QueueUrl")]
    queue_url: String,
    #[serde(rename = "AttributeNames", default)]
    attribute_names: Vec<String>,
}

async fn get_queue_attributes(app: &Arc<App>, input: GetQueueAttributesInput) -> Result<Value> {
    let attributes = app
        .queues
        .get_queue_attributes(&input.queue_url, &input.attribute_names)
        .await?;
    Ok(json!({"Attributes": attributes}))
}

#[derive(Debug, Deserialize)]
struct SetQueueAttributesInput {
    #[serde(rename = "QueueUrl")]
    queue_url: String,
    #[serde(rename = "Attributes")]
    attributes: HashMap<String, String>,
}

async fn set_queue_attributes(app: &Arc<App>, input: SetQueueAttributesInput) -> Result<Value> {
    app.queues
        .set_queue_attributes(&input.queue_url, &input.attributes)
        .await?;
    Ok(json!({}))
}

async fn purge_queue(app: &Arc<App>, input: QueueUrlInput) -> Result<Value> {
    app.queues.purge_queue(&input.queue_url).await?;
    Ok(json!({}))
}

// -- messaging -------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SendMessageInput {
    #[serde(rename = "QueueUrl")]
    queue_url: String,
    #[serde(rename = "MessageBody", default)]
    message_body: String,
    #[serde(rename = "DelaySeconds", default)]
    delay_seconds: Option<u32>,
    #[serde(rename = "MessageAttributes", default)]
    message_attributes: HashMap<String, MessageAttributeValue>,
    #[serde(rename = "MessageGroupId", default)]
    message_group_id: Option<String>,
    #[serde(rename = "MessageDeduplicationId", default)]
    message_deduplication_id: Option<String>,
}

impl SendMessageInput {
    fn into_params(self) -> (String, SendMessageParams) {
        (
            self.queue_url,
            SendMessageParams {
                body: self.message_body,
                attributes: self.message_attributes,
                delay_seconds: self.delay_seconds,
                group_id: self.message_group_id,
                dedup_id: self.message_deduplication_id,
            },
        )
    }
}

fn send_outcome_json(outcome: &SendOutcome) -> Map<String, Value> {
    let mut output = Map::new();
    output.insert("MessageId".to_string(), json!(outcome.message_id));
    output.insert(
        "MD5OfMessageBody".to_string(),
        json!(outcome.body_digest),
    );
    if let Some(ref digest) = outcome.attributes_digest {
        output.insert("MD5OfMessageAttributes".to_string(), json!(digest));
    }
    if let Some(ref sequence) = outcome.sequence_number {
        output.insert("SequenceNumber".to_string(), json!(sequence));
    }
    output
}

async fn send_message(app: &Arc<App>, input: SendMessageInput) -> Result<Value> {
    let (queue_url, params) = input.into_params();
    let outcome = app.queues.send_message(&queue_url, params).await?;
    Ok(Value::Object(send_outcome_json(&outcome)))
}

#[derive(Debug, Deserialize)]
struct SendMessageBatchInput {
    #[serde(rename = "QueueUrl")]
    queue_url: String,
    #[serde(rename = "Entries", default)]
    entries: Vec<SendMessageBatchEntry>,
}

#[derive(Debug, Deserialize)]
struct SendMessageBatchEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "MessageBody", default)]
    message_body: String,
    #[serde(rename = "DelaySeconds", default)]
    delay_seconds: Option<u32>,
    #[serde(rename = "MessageAttributes", default)]
    message_attributes: HashMap<String, MessageAttributeValue>,
    #[serde(rename = "MessageGroupId", default)]
    message_group_id: Option<String>,
    #[serde(rename = "MessageDeduplicationId", default)]
    message_deduplication_id: Option<String>,
}

fn batch_response<T>(
    outcomes: Vec<BatchEntryOutcome<T>>,
    mut success_json: impl FnMut(&str, &T) -> Value,
) -> Value {
    let mut successful = Vec::new();
    let mut failed = Vec::new();
    for outcome in &outcomes {
        match &outcome.result {
            Ok(value) => successful.push(success_json(&outcome.id, value)),
            Err(error) => failed.push(json!({
                "Id": outcome.id,
                "SenderFault": error.fault() == Fault::Sender,
                "Code": error.code(),
                "Message": error.to_string(),
            })),
        }
    }
    json!({"Successful": successful, "Failed": failed})
}

async fn send_message_batch(app: &Arc<App>, input: SendMessageBatchInput) -> Result<Value> {
    let entries = input
        .entries
        .into_iter()
        .map(|entry| {
            (
                entry.id,
                SendMessageParams {
                    body: entry.message_body,
                    attributes: entry.message_attributes,
                    delay_seconds: entry.delay_seconds,
                    group_id: entry.message_group_id,
                    dedup_id: entry.message_deduplication_id,
                },
            )
        })
        .collect();
    let outcomes = app
        .queues
        .send_message_batch(&input.queue_url, entries)
        .await?;
    Ok(batch_response(outcomes, |id, outcome| {
        let mut entry = send_outcome_json(outcome);
        entry.insert("Id".to_string(), json!(id));
        Value::Object(entry)
    }))
}

#[derive(Debug, Deserialize)]
struct ReceiveMessageInput {
    #[serde(rename = "QueueUrl")]
    queue_url: String,
    #[serde(rename = "MaxNumberOfMessages", default)]
    max_messages: Option<u32>,
    #[serde(rename = "VisibilityTimeout", default)]
    visibility_timeout: Option<u32>,
    #[serde(rename = "WaitTimeSeconds", default)]
    wait_time_seconds: Option<u32>,
}

fn received_message_json(message: &ReceivedMessage) -> Value {
    let mut system: Map<String, Value> = Map::new();
    system.insert(
        "ApproximateReceiveCount".to_string(),
        json!(message.receive_count.to_string()),
    );
    system.insert(
        "SentTimestamp".to_string(),
        json!(message.sent_timestamp.to_string()),
    );
    system.insert(
        "ApproximateFirstReceiveTimestamp".to_string(),
        json!(message.first_receive_timestamp.to_string()),
    );
    if let Some(ref group) = message.group_id {
        system.insert("MessageGroupId".to_string(), json!(group));
    }
    if let Some(ref dedup) = message.dedup_id {
        system.insert("MessageDeduplicationId".to_string(), json!(dedup));
    }
    if let Some(ref sequence) = message.sequence_number {
        system.insert("SequenceNumber".to_string(), json!(sequence));
    }

    let mut output = Map::new();
    output.insert("MessageId".to_string(), json!(message.message_id));
    output.insert(
        "ReceiptHandle".to_string(),
        json!(message.receipt_handle),
    );
    output.insert("MD5OfBody".to_string(), json!(message.body_digest));
    output.insert("Body".to_string(), json!(message.body));
    output.insert("Attributes".to_string(), Value::Object(system));
    if !message.attributes.is_empty() {
        if let Some(ref digest) = message.attributes_digest {
            output.insert("MD5OfMessageAttributes".to_string(), json!(digest));
        }
        output.insert(
            "MessageAttributes".to_string(),
            json!(message.attributes),
        );
    }
    Value::Object(output)
}

async fn receive_message(app: &Arc<App>, input: ReceiveMessageInput) -> Result<Value> {
    let messages = app
        .queues
        .receive_message(
            &input.queue_url,
            ReceiveMessageRequest {
                max_messages: input.max_messages,
                visibility_timeout: input.visibility_timeout,
                wait_time_seconds: input.wait_time_seconds,
            },
        )
        .await?;
    Ok(json!({
        "Messages": messages.iter().map(received_message_json).collect::<Vec<_>>(),
    }))
}

#[derive(Debug, Deserialize)]
struct DeleteMessageInput {
    #[serde(rename = "QueueUrl")]
    queue_url: String,
    #[serde(rename = "ReceiptHandle")]
    receipt_handle: String,
}

async fn delete_message(app: &Arc<App>, input: DeleteMessageInput) -> Result<Value> {
    app.queues
        .delete_message(&input.queue_url, &input.receipt_handle)
        .await?;
    Ok(json!({}))
}

#[derive(Debug, Deserialize)]
struct DeleteMessageBatchInput {
    #[serde(rename = "QueueUrl")]
    queue_url: String,
    #[serde(rename = "Entries", default)]
    entries: Vec<DeleteMessageBatchEntry>,
}

#[derive(Debug, Deserialize)]
struct DeleteMessageBatchEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "ReceiptHandle")]
    receipt_handle: String,
}

async fn delete_message_batch(app: &Arc<App>, input: DeleteMessageBatchInput) -> Result<Value> {
    let entries = input
        .entries
        .into_iter()
        .map(|entry| (entry.id, entry.receipt_handle))
        .collect();
    let outcomes = app
        .queues
        .delete_message_batch(&input.queue_url, entries)
        .await?;
    Ok(batch_response(outcomes, |id, _| json!({"Id": id})))
}

#[derive(Debug, Deserialize)]
struct ChangeVisibilityInput {
    #[serde(rename = "QueueUrl")]
    queue_url: String,
    #[serde(rename = "ReceiptHandle")]
    receipt_handle: String,
    #[serde(rename = "VisibilityTimeout")]
    visibility_timeout: u32,
}

async fn change_visibility(app: &Arc<App>, input: ChangeVisibilityInput) -> Result<Value> {
    app.queues
        .change_visibility(
            &input.queue_url,
            &input.receipt_handle,
            input.visibility_timeout,
        )
        .await?;
    Ok(json!({}))
}

#[derive(Debug, Deserialize)]
struct ChangeVisibilityBatchInput {
    #[serde(rename = "QueueUrl")]
    queue_url: String,
    #[serde(rename = "Entries", default)]
    entries: Vec<ChangeVisibilityBatchEntry>,
}

#[derive(Debug, Deserialize)]
struct ChangeVisibilityBatchEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "ReceiptHandle")]
    receipt_handle: String,
    #[serde(rename = "VisibilityTimeout", default)]
    visibility_timeout: u32,
}

async fn change_visibility_batch(
    app: &Arc<App>,
    input: ChangeVisibilityBatchInput,
) -> Result<Value> {
    let entries = input
        .entries
        .into_iter()
        .map(|entry| (entry.id, entry.receipt_handle, entry.visibility_timeout))
        .collect();
    let outcomes = app
        .queues
        .change_visibility_batch(&input.queue_url, entries)
        .await?;
    Ok(batch_response(outcomes, |id, _| json!({"Id": id})))
}

// -- tags ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TagQueueInput {
    #[serde(rename = "QueueUrl")]
    queue_url: String,
    #[serde(rename = "Tags", default)]
    tags: HashMap<String, String>,
}

async fn tag_queue(app: &Arc<App>, input: TagQueueInput) -> Result<Value> {
    let mut tags: Vec<(String, String)> = input.tags.into_iter().collect();
    tags.sort();
    app.queues.tag_queue(&input.queue_url, tags).await?;
    Ok(json!({}))
}

#[derive(Debug, Deserialize)]
struct UntagQueueInput {
    #[serde(rename = "QueueUrl")]
    queue_url: String,
    #[serde(rename = "TagKeys", default)]
    tag_keys: Vec<String>,
}

async fn untag_queue(app: &Arc<App>, input: UntagQueueInput) -> Result<Value> {
    app.queues
        .untag_queue(&input.queue_url, &input.tag_keys)
        .await?;
    Ok(json!({}))
}

async fn list_queue_tags(app: &Arc<App>, input: QueueUrlInput) -> Result<Value> {
    let tags = app.queues.list_queue_tags(&input.queue_url).await?;
    let mut output = Map::new();
    for (key, value) in tags {
        output.insert(key, json!(value));
    }
    Ok(json!({"Tags": output}))
}
