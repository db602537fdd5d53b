//! Topic service shell: the form-urlencoded query protocol.
//!
//! Decodes `Action=` form bodies, calls the topic registry / publisher,
//! and renders the public XML response schemas. Also answers the
//! `GetCallerIdentity` stub so SDK credential chains resolve.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::debug;
use uuid::Uuid;

use crate::app::App;
use crate::arn::DEFAULT_ACCOUNT;
use crate::error::{Fault, Result, ServiceError};
use crate::queue::MessageAttributeValue;
use crate::topic::{PublishBatchEntry, PublishRequest};

use super::xml::{text_element, XML_DECL};
use super::{region_from_headers, sns_error_response};

const SNS_XMLNS: &str = "http://sns.amazonaws.com/doc/2010-03-31/";
const STS_XMLNS: &str = "https://sts.amazonaws.com/doc/2011-06-15/";

pub(crate) async fn handle(app: &Arc<App>, headers: &HeaderMap, body: &[u8]) -> Response {
    let form: HashMap<String, String> = form_urlencoded::parse(body)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let Some(action) = form.get("Action").cloned() else {
        return sns_error_response(&ServiceError::MissingParameter("Action".to_string()));
    };
    if action == "GetCallerIdentity" {
        return caller_identity_response();
    }

    let region = region_from_headers(app, headers);
    debug!(action = %action, region = %region, "topic action");
    match route(app, &action, &region, &form).await {
        Ok(result) => xml_ok(&action, &result),
        Err(error) => sns_error_response(&error),
    }
}

fn xml_ok(action: &str, result_inner: &str) -> Response {
    let request_id = text_element("RequestId", &Uuid::new_v4().to_string());
    let result = if result_inner.is_empty() {
        String::new()
    } else {
        format!("<{action}Result>{result_inner}</{action}Result>")
    };
    let body = format!(
        "{XML_DECL}<{action}Response xmlns=\"{SNS_XMLNS}\">{result}<ResponseMetadata>{request_id}</ResponseMetadata></{action}Response>"
    );
    (StatusCode::OK, [(CONTENT_TYPE, "text/xml")], body).into_response()
}

fn caller_identity_response() -> Response {
    let body = format!(
        "{XML_DECL}<GetCallerIdentityResponse xmlns=\"{STS_XMLNS}\"><GetCallerIdentityResult>{}{}{}</GetCallerIdentityResult><ResponseMetadata>{}</ResponseMetadata></GetCallerIdentityResponse>",
        text_element("UserId", DEFAULT_ACCOUNT),
        text_element("Account", DEFAULT_ACCOUNT),
        text_element("Arn", &format!("arn:aws:iam::{DEFAULT_ACCOUNT}:root")),
        text_element("RequestId", &Uuid::new_v4().to_string()),
    );
    (StatusCode::OK, [(CONTENT_TYPE, "text/xml")], body).into_response()
}

fn require<'a>(form: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    form.get(name)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ServiceError::MissingParameter(name.to_string()))
}

/// Collect `base.N.field` form entries grouped by index, in index order.
fn indexed_entries(
    form: &HashMap<String, String>,
    base: &str,
) -> Vec<HashMap<String, String>> {
    let mut by_index: BTreeMap<usize, HashMap<String, String>> = BTreeMap::new();
    for (key, value) in form {
        let Some(rest) = key
            .strip_prefix(base)
            .and_then(|r| r.strip_prefix('.'))
        else {
            continue;
        };
        let Some((index, field)) = rest.split_once('.') else {
            continue;
        };
        if let Ok(index) = index.parse::<usize>() {
            by_index
                .entry(index)
                .or_default()
                .insert(field.to_string(), value.clone());
        }
    }
    by_index.into_values().collect()
}

/// `base.entry.N.key` / `base.entry.N.value` pairs as a map.
fn keyed_attributes(form: &HashMap<String, String>, base: &str) -> HashMap<String, String> {
    indexed_entries(form, &format!("{base}.entry"))
        .into_iter()
        .filter_map(|entry| {
            Some((entry.get("key")?.clone(), entry.get("value").cloned().unwrap_or_default()))
        })
        .collect()
}

/// `Tags.member.N.Key` / `.Value` pairs in member order.
fn member_tags(form: &HashMap<String, String>, base: &str) -> Vec<(String, String)> {
    indexed_entries(form, &format!("{base}.member"))
        .into_iter()
        .filter_map(|entry| {
            Some((
                entry.get("Key")?.clone(),
                entry.get("Value").cloned().unwrap_or_default(),
            ))
        })
        .collect()
}

/// `MessageAttributes.entry.N.Name` + `.Value.DataType`/`.Value.StringValue`
/// /`.Value.BinaryValue` (base64) into the core attribute map.
fn message_attributes(
    form: &HashMap<String, String>,
    base: &str,
) -> HashMap<String, MessageAttributeValue> {
    indexed_entries(form, &format!("{base}.entry"))
        .into_iter()
        .filter_map(|entry| {
            let name = entry.get("Name")?.clone();
            let data_type = entry.get("Value.DataType")?.clone();
            let binary_value = entry
                .get("Value.BinaryValue")
                .and_then(|b| BASE64.decode(b.as_bytes()).ok());
            Some((
                name,
                MessageAttributeValue {
                    data_type,
                    string_value: entry.get("Value.StringValue").cloned(),
                    binary_value,
                },
            ))
        })
        .collect()
}

fn attributes_xml(attributes: &HashMap<String, String>) -> String {
    let mut sorted: Vec<(&String, &String)> = attributes.iter().collect();
    sorted.sort();
    let entries: String = sorted
        .into_iter()
        .map(|(key, value)| {
            format!(
                "<entry>{}{}</entry>",
                text_element("key", key),
                text_element("value", value)
            )
        })
        .collect();
    format!("<Attributes>{entries}</Attributes>")
}

fn subscriptions_xml(subscriptions: &[crate::topic::Subscription]) -> String {
    let members: String = subscriptions
        .iter()
        .map(|sub| {
            format!(
                "<member>{}{}{}{}{}</member>",
                text_element("SubscriptionArn", &sub.arn),
                text_element("Owner", DEFAULT_ACCOUNT),
                text_element("Protocol", &sub.protocol),
                text_element("Endpoint", &sub.endpoint),
                text_element("TopicArn", &sub.topic_arn),
            )
        })
        .collect();
    format!("<Subscriptions>{members}</Subscriptions>")
}

async fn route(
    app: &Arc<App>,
    action: &str,
    region: &str,
    form: &HashMap<String, String>,
) -> Result<String> {
    match action {
        "CreateTopic" => {
            let name = require(form, "Name")?;
            let attributes = keyed_attributes(form, "Attributes");
            let tags = member_tags(form, "Tags");
            let topic = app
                .topics
                .create_topic(name, region, attributes, tags)
                .await?;
            Ok(text_element("TopicArn", &topic.arn))
        }
        "DeleteTopic" => {
            app.topics.delete_topic(require(form, "TopicArn")?).await?;
            Ok(String::new())
        }
        "ListTopics" => {
            let (arns, token) = app
                .topics
                .list_topics(form.get("NextToken").map(String::as_str))
                .await;
            let members: String = arns
                .iter()
                .map(|arn| format!("<member>{}</member>", text_element("TopicArn", arn)))
                .collect();
            let mut result = format!("<Topics>{members}</Topics>");
            if let Some(token) = token {
                result.push_str(&text_element("NextToken", &token));
            }
            Ok(result)
        }
        "GetTopicAttributes" => {
            let attributes = app
                .topics
                .get_topic_attributes(require(form, "TopicArn")?)
                .await?;
            Ok(attributes_xml(&attributes))
        }
        "SetTopicAttributes" => {
            app.topics
                .set_topic_attribute(
                    require(form, "TopicArn")?,
                    require(form, "AttributeName")?,
                    form.get("AttributeValue").cloned().unwrap_or_default(),
                )
                .await?;
            Ok(String::new())
        }
        "Subscribe" => {
            let subscription = app
                .topics
                .subscribe(
                    require(form, "TopicArn")?,
                    require(form, "Protocol")?,
                    require(form, "Endpoint")?,
                    keyed_attributes(form, "Attributes"),
                )
                .await?;
            Ok(text_element("SubscriptionArn", &subscription.arn))
        }
        "Unsubscribe" => {
            app.topics
                .unsubscribe(require(form, "SubscriptionArn")?)
                .await?;
            Ok(String::new())
        }
        "ConfirmSubscription" => {
            let arn = app
                .topics
                .confirm_subscription(require(form, "TopicArn")?)
                .await?;
            Ok(text_element("SubscriptionArn", &arn))
        }
        "ListSubscriptions" => {
            let (subscriptions, token) = app
                .topics
                .list_subscriptions(form.get("NextToken").map(String::as_str))
                .await;
            let mut result = subscriptions_xml(&subscriptions);
            if let Some(token) = token {
                result.push_str(&text_element("NextToken", &token));
            }
            Ok(result)
        }
        "ListSubscriptionsByTopic" => {
            let (subscriptions, token) = app
                .topics
                .list_subscriptions_by_topic(
                    require(form, "TopicArn")?,
                    form.get("NextToken").map(String::as_str),
                )
                .await?;
            let mut result = subscriptions_xml(&subscriptions);
            if let Some(token) = token {
                result.push_str(&text_element("NextToken", &token));
            }
            Ok(result)
        }
        "GetSubscriptionAttributes" => {
            let subscription = app
                .topics
                .get_subscription(require(form, "SubscriptionArn")?)
                .await?;
            let mut attributes = subscription.attributes.clone();
            attributes.insert("SubscriptionArn".to_string(), subscription.arn.clone());
            attributes.insert("TopicArn".to_string(), subscription.topic_arn.clone());
            attributes.insert("Protocol".to_string(), subscription.protocol.clone());
            attributes.insert("Endpoint".to_string(), subscription.endpoint.clone());
            attributes.insert("Owner".to_string(), DEFAULT_ACCOUNT.to_string());
            attributes.insert(
                "ConfirmationWasAuthenticated".to_string(),
                subscription.confirmed.to_string(),
            );
            attributes.insert(
                "PendingConfirmation".to_string(),
                (!subscription.confirmed).to_string(),
            );
            Ok(attributes_xml(&attributes))
        }
        "SetSubscriptionAttributes" => {
            app.topics
                .set_subscription_attribute(
                    require(form, "SubscriptionArn")?,
                    require(form, "AttributeName")?,
                    form.get("AttributeValue").cloned().unwrap_or_default(),
                )
                .await?;
            Ok(String::new())
        }
        "Publish" => {
            let outcome = app
                .publisher
                .publish(PublishRequest {
                    topic_arn: require(form, "TopicArn")?.to_string(),
                    message: form.get("Message").cloned().unwrap_or_default(),
                    attributes: message_attributes(form, "MessageAttributes"),
                    subject: form.get("Subject").cloned().filter(|s| !s.is_empty()),
                    group_id: form.get("MessageGroupId").cloned(),
                    dedup_id: form.get("MessageDeduplicationId").cloned(),
                })
                .await?;
            let mut result = text_element("MessageId", &outcome.message_id);
            if let Some(ref sequence) = outcome.sequence_number {
                result.push_str(&text_element("SequenceNumber", sequence));
            }
            Ok(result)
        }
        "PublishBatch" => {
            let topic_arn = require(form, "TopicArn")?;
            let entries = indexed_entries(form, "PublishBatchRequestEntries.member")
                .into_iter()
                .map(|entry| PublishBatchEntry {
                    id: entry.get("Id").cloned().unwrap_or_default(),
                    message: entry.get("Message").cloned().unwrap_or_default(),
                    attributes: nested_message_attributes(&entry),
                    subject: entry.get("Subject").cloned(),
                    group_id: entry.get("MessageGroupId").cloned(),
                    dedup_id: entry.get("MessageDeduplicationId").cloned(),
                })
                .collect();
            let outcomes = app.publisher.publish_batch(topic_arn, entries).await?;
            let mut successful = String::new();
            let mut failed = String::new();
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(publish) => {
                        let mut member = text_element("Id", &outcome.id);
                        member.push_str(&text_element("MessageId", &publish.message_id));
                        if let Some(ref sequence) = publish.sequence_number {
                            member.push_str(&text_element("SequenceNumber", sequence));
                        }
                        successful.push_str(&format!("<member>{member}</member>"));
                    }
                    Err(error) => {
                        let sender = error.fault() == Fault::Sender;
                        failed.push_str(&format!(
                            "<member>{}{}{}{}</member>",
                            text_element("Id", &outcome.id),
                            text_element("Code", error.code()),
                            text_element("Message", &error.to_string()),
                            text_element("SenderFault", &sender.to_string()),
                        ));
                    }
                }
            }
            Ok(format!(
                "<Successful>{successful}</Successful><Failed>{failed}</Failed>"
            ))
        }
        "TagResource" => {
            app.topics
                .tag_resource(require(form, "ResourceArn")?, member_tags(form, "Tags"))
                .await?;
            Ok(String::new())
        }
        "UntagResource" => {
            let keys = flat_members(form, "TagKeys.member");
            app.topics
                .untag_resource(require(form, "ResourceArn")?, &keys)
                .await?;
            Ok(String::new())
        }
        "ListTagsForResource" => {
            let tags = app.topics.list_tags(require(form, "ResourceArn")?).await?;
            let members: String = tags
                .iter()
                .map(|(key, value)| {
                    format!(
                        "<member>{}{}</member>",
                        text_element("Key", key),
                        text_element("Value", value)
                    )
                })
                .collect();
            Ok(format!("<Tags>{members}</Tags>"))
        }
        other => Err(ServiceError::InvalidParameter(format!(
            "Unknown action: {other}"
        ))),
    }
}

/// `base.N` values with no trailing field (flat string lists).
fn flat_members(form: &HashMap<String, String>, base: &str) -> Vec<String> {
    let mut indexed: Vec<(usize, String)> = form
        .iter()
        .filter_map(|(key, value)| {
            let rest = key.strip_prefix(base)?.strip_prefix('.')?;
            rest.parse::<usize>().ok().map(|i| (i, value.clone()))
        })
        .collect();
    indexed.sort_by_key(|(i, _)| *i);
    indexed.into_iter().map(|(_, v)| v).collect()
}

/// Message attributes nested inside a batch entry's collected fields
/// (`MessageAttributes.entry.M.Name`, …).
fn nested_message_attributes(
    entry: &HashMap<String, String>,
) -> HashMap<String, MessageAttributeValue> {
    let scoped: HashMap<String, String> = entry
        .iter()
        .filter(|(key, _)| key.starts_with("MessageAttributes."))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    message_attributes(&scoped, "MessageAttributes")
}
