//! Typed queue attributes with range validation.
//!
//! Attributes arrive and leave as string maps; internally they are typed so
//! the state machine never re-parses. `FifoQueue` is fixed at creation.

use std::collections::HashMap;

use serde_json::json;

use crate::error::{Result, ServiceError};

/// Bounds and defaults, per the public queue contract.
pub const VISIBILITY_TIMEOUT_DEFAULT: u32 = 30;
pub const VISIBILITY_TIMEOUT_MAX: u32 = 43_200;
pub const DELAY_SECONDS_MAX: u32 = 900;
pub const MESSAGE_SIZE_MIN: u32 = 1_024;
pub const MESSAGE_SIZE_MAX: u32 = 1_048_576;
pub const RETENTION_MIN: u32 = 60;
pub const RETENTION_MAX: u32 = 1_209_600;
pub const RETENTION_DEFAULT: u32 = 345_600;
pub const WAIT_TIME_MAX: u32 = 20;

/// Dead-letter routing, stored as JSON in the `RedrivePolicy` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedrivePolicy {
    pub dead_letter_target_arn: String,
    pub max_receive_count: u32,
}

impl RedrivePolicy {
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
            ServiceError::InvalidAttributeValue(format!("Invalid RedrivePolicy JSON: {e}"))
        })?;
        let arn = value
            .get("deadLetterTargetArn")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ServiceError::InvalidAttributeValue(
                    "RedrivePolicy must contain deadLetterTargetArn".to_string(),
                )
            })?
            .to_string();
        let max_receive_count = value
            .get("maxReceiveCount")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .ok_or_else(|| {
                ServiceError::InvalidAttributeValue(
                    "RedrivePolicy must contain maxReceiveCount".to_string(),
                )
            })? as u32;
        if max_receive_count < 1 {
            return Err(ServiceError::InvalidAttributeValue(
                "maxReceiveCount must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            dead_letter_target_arn: arn,
            max_receive_count,
        })
    }

    pub fn to_json(&self) -> String {
        json!({
            "deadLetterTargetArn": self.dead_letter_target_arn,
            "maxReceiveCount": self.max_receive_count,
        })
        .to_string()
    }
}

/// Typed view of a queue's settable attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAttributes {
    pub visibility_timeout: u32,
    pub delay_seconds: u32,
    pub maximum_message_size: u32,
    pub message_retention_period: u32,
    pub receive_message_wait_time_seconds: u32,
    pub redrive_policy: Option<RedrivePolicy>,
    pub fifo_queue: bool,
    pub content_based_deduplication: bool,
    pub deduplication_scope: Option<String>,
    pub fifo_throughput_limit: Option<String>,
    /// Opaque fields: stored and echoed back verbatim.
    pub policy: Option<String>,
    pub kms_master_key_id: Option<String>,
    pub kms_data_key_reuse_period_seconds: Option<u32>,
}

impl Default for QueueAttributes {
    fn default() -> Self {
        Self {
            visibility_timeout: VISIBILITY_TIMEOUT_DEFAULT,
            delay_seconds: 0,
            maximum_message_size: MESSAGE_SIZE_MAX,
            message_retention_period: RETENTION_DEFAULT,
            receive_message_wait_time_seconds: 0,
            redrive_policy: None,
            fifo_queue: false,
            content_based_deduplication: false,
            deduplication_scope: None,
            fifo_throughput_limit: None,
            policy: None,
            kms_master_key_id: None,
            kms_data_key_reuse_period_seconds: None,
        }
    }
}

fn parse_ranged(name: &str, value: &str, min: u32, max: u32) -> Result<u32> {
    let parsed: u32 = value.parse().map_err(|_| {
        ServiceError::InvalidAttributeValue(format!("Invalid value for {name}: {value}"))
    })?;
    if parsed < min || parsed > max {
        return Err(ServiceError::InvalidAttributeValue(format!(
            "{name} must be between {min} and {max}"
        )));
    }
    Ok(parsed)
}

impl QueueAttributes {
    /// Apply a string attribute map, validating each entry.
    pub fn apply(&mut self, attrs: &HashMap<String, String>) -> Result<()> {
        for (key, value) in attrs {
            match key.as_str() {
                "VisibilityTimeout" => {
                    self.visibility_timeout =
                        parse_ranged(key, value, 0, VISIBILITY_TIMEOUT_MAX)?;
                }
                "DelaySeconds" => {
                    self.delay_seconds = parse_ranged(key, value, 0, DELAY_SECONDS_MAX)?;
                }
                "MaximumMessageSize" => {
                    self.maximum_message_size =
                        parse_ranged(key, value, MESSAGE_SIZE_MIN, MESSAGE_SIZE_MAX)?;
                }
                "MessageRetentionPeriod" => {
                    self.message_retention_period =
                        parse_ranged(key, value, RETENTION_MIN, RETENTION_MAX)?;
                }
                "ReceiveMessageWaitTimeSeconds" => {
                    self.receive_message_wait_time_seconds =
                        parse_ranged(key, value, 0, WAIT_TIME_MAX)?;
                }
                "RedrivePolicy" => {
                    self.redrive_policy = if value.is_empty() {
                        None
                    } else {
                        Some(RedrivePolicy::from_json(value)?)
                    };
                }
                "FifoQueue" => {
                    self.fifo_queue = value == "true";
                }
                "ContentBasedDeduplication" => {
                    self.content_based_deduplication = value == "true";
                }
                "DeduplicationScope" => {
                    if value != "Queue" && value != "MessageGroup" {
                        return Err(ServiceError::InvalidAttributeValue(
                            "DeduplicationScope must be Queue or MessageGroup".to_string(),
                        ));
                    }
                    self.deduplication_scope = Some(value.clone());
                }
                "FifoThroughputLimit" => {
                    if value != "PerQueue" && value != "PerMessageGroupId" {
                        return Err(ServiceError::InvalidAttributeValue(
                            "FifoThroughputLimit must be PerQueue or PerMessageGroupId"
                                .to_string(),
                        ));
                    }
                    self.fifo_throughput_limit = Some(value.clone());
                }
                "Policy" => {
                    self.policy = if value.is_empty() {
                        None
                    } else {
                        Some(value.clone())
                    };
                }
                "KmsMasterKeyId" => {
                    self.kms_master_key_id = if value.is_empty() {
                        None
                    } else {
                        Some(value.clone())
                    };
                }
                "KmsDataKeyReusePeriodSeconds" => {
                    self.kms_data_key_reuse_period_seconds =
                        Some(parse_ranged(key, value, 60, 86_400)?);
                }
                _ => {
                    return Err(ServiceError::InvalidAttributeName(key.clone()));
                }
            }
        }
        Ok(())
    }

    /// FIFO queues pick up their FIFO-specific defaults when unset.
    pub fn apply_fifo_defaults(&mut self) {
        if self.fifo_queue {
            self.deduplication_scope
                .get_or_insert_with(|| "Queue".to_string());
            self.fifo_throughput_limit
                .get_or_insert_with(|| "PerQueue".to_string());
        }
    }

    /// Render the settable attributes as the wire-visible string map.
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(
            "VisibilityTimeout".to_string(),
            self.visibility_timeout.to_string(),
        );
        map.insert("DelaySeconds".to_string(), self.delay_seconds.to_string());
        map.insert(
            "MaximumMessageSize".to_string(),
            self.maximum_message_size.to_string(),
        );
        map.insert(
            "MessageRetentionPeriod".to_string(),
            self.message_retention_period.to_string(),
        );
        map.insert(
            "ReceiveMessageWaitTimeSeconds".to_string(),
            self.receive_message_wait_time_seconds.to_string(),
        );
        if let Some(ref policy) = self.redrive_policy {
            map.insert("RedrivePolicy".to_string(), policy.to_json());
        }
        if self.fifo_queue {
            map.insert("FifoQueue".to_string(), "true".to_string());
            map.insert(
                "ContentBasedDeduplication".to_string(),
                self.content_based_deduplication.to_string(),
            );
            if let Some(ref scope) = self.deduplication_scope {
                map.insert("DeduplicationScope".to_string(), scope.clone());
            }
            if let Some(ref limit) = self.fifo_throughput_limit {
                map.insert("FifoThroughputLimit".to_string(), limit.clone());
            }
        }
        if let Some(ref policy) = self.policy {
            map.insert("Policy".to_string(), policy.clone());
        }
        if let Some(ref key) = self.kms_master_key_id {
            map.insert("KmsMasterKeyId".to_string(), key.clone());
        }
        if let Some(reuse) = self.kms_data_key_reuse_period_seconds {
            map.insert(
                "KmsDataKeyReusePeriodSeconds".to_string(),
                reuse.to_string(),
            );
        }
        map
    }

    /// Idempotent-create comparison: every attribute the caller provided
    /// must equal the existing queue's current value.
    pub fn matches_provided(&self, provided: &HashMap<String, String>) -> Option<String> {
        let current = self.to_map();
        provided
            .iter()
            .find(|(key, value)| current.get(*key) != Some(*value))
            .map(|(key, _)| key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let attrs = QueueAttributes::default();
        assert_eq!(attrs.visibility_timeout, 30);
        assert_eq!(attrs.maximum_message_size, 1_048_576);
        assert_eq!(attrs.message_retention_period, 345_600);
        assert!(!attrs.fifo_queue);
    }

    #[test]
    fn test_apply_rejects_out_of_range() {
        let mut attrs = QueueAttributes::default();
        let mut map = HashMap::new();
        map.insert("VisibilityTimeout".to_string(), "43201".to_string());
        assert!(matches!(
            attrs.apply(&map),
            Err(ServiceError::InvalidAttributeValue(_))
        ));

        let mut map = HashMap::new();
        map.insert("MaximumMessageSize".to_string(), "1023".to_string());
        assert!(attrs.apply(&map).is_err());
    }

    #[test]
    fn test_apply_rejects_unknown_name() {
        let mut attrs = QueueAttributes::default();
        let mut map = HashMap::new();
        map.insert("NoSuchAttribute".to_string(), "1".to_string());
        assert!(matches!(
            attrs.apply(&map),
            Err(ServiceError::InvalidAttributeName(_))
        ));
    }

    #[test]
    fn test_redrive_policy_round_trip() {
        let raw = r#"{"deadLetterTargetArn":"arn:aws:sqs:us-east-1:000000000000:dlq","maxReceiveCount":3}"#;
        let policy = RedrivePolicy::from_json(raw).expect("parse");
        assert_eq!(policy.max_receive_count, 3);
        let back = RedrivePolicy::from_json(&policy.to_json()).expect("reparse");
        assert_eq!(back, policy);
    }

    #[test]
    fn test_redrive_policy_accepts_string_count() {
        let raw = r#"{"deadLetterTargetArn":"arn:aws:sqs:us-east-1:000000000000:dlq","maxReceiveCount":"5"}"#;
        assert_eq!(
            RedrivePolicy::from_json(raw).expect("parse").max_receive_count,
            5
        );
    }

    #[test]
    fn test_fifo_defaults_applied() {
        let mut attrs = QueueAttributes {
            fifo_queue: true,
            ..Default::default()
        };
        attrs.apply_fifo_defaults();
        assert_eq!(attrs.deduplication_scope.as_deref(), Some("Queue"));
        assert_eq!(attrs.fifo_throughput_limit.as_deref(), Some("PerQueue"));
        let map = attrs.to_map();
        assert_eq!(map.get("FifoQueue").map(String::as_str), Some("true"));
    }

    #[test]
    fn test_matches_provided_ignores_unmentioned_keys() {
        let mut attrs = QueueAttributes::default();
        let mut set = HashMap::new();
        set.insert("VisibilityTimeout".to_string(), "60".to_string());
        attrs.apply(&set).expect("apply");

        let mut provided = HashMap::new();
        provided.insert("VisibilityTimeout".to_string(), "60".to_string());
        assert_eq!(attrs.matches_provided(&provided), None);

        provided.insert("DelaySeconds".to_string(), "5".to_string());
        assert_eq!(
            attrs.matches_provided(&provided),
            Some("DelaySeconds".to_string())
        );
    }
}
