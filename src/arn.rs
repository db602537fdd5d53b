//! ARN construction and parsing.
//!
//! All resources live under one partition and a single emulated account.
//! ARNs are opaque to clients; internally the trailing segment carries the
//! resource name.

/// Account id used for every emulated resource.
pub const DEFAULT_ACCOUNT: &str = "000000000000";
/// Region applied when neither the request nor the config names one.
pub const DEFAULT_REGION: &str = "us-east-1";
/// Partition for all generated ARNs.
pub const PARTITION: &str = "aws";

/// `arn:aws:sqs:<region>:<account>:<name>`
pub fn queue_arn(region: &str, account: &str, name: &str) -> String {
    format!("arn:{PARTITION}:sqs:{region}:{account}:{name}")
}

/// `arn:aws:sns:<region>:<account>:<name>`
pub fn topic_arn(region: &str, account: &str, name: &str) -> String {
    format!("arn:{PARTITION}:sns:{region}:{account}:{name}")
}

/// `arn:aws:sns:<region>:<account>:<topicName>:<uuid>`
pub fn subscription_arn(topic_arn: &str, id: &str) -> String {
    format!("{topic_arn}:{id}")
}

/// Last `:`-separated segment of an ARN, which names the resource.
pub fn resource_name(arn: &str) -> Option<&str> {
    arn.rsplit(':').next().filter(|s| !s.is_empty())
}

/// Topic ARN embedded in a subscription ARN (everything before the last segment).
pub fn subscription_topic_arn(sub_arn: &str) -> Option<&str> {
    sub_arn.rfind(':').map(|idx| &sub_arn[..idx])
}

/// FIFO queues and topics are named with a mandatory suffix.
pub fn is_fifo_name(name: &str) -> bool {
    name.ends_with(".fifo")
}

/// Valid queue/topic name: alphanumeric, hyphen, underscore, 1–80 chars,
/// with an optional `.fifo` suffix.
pub fn is_valid_resource_name(name: &str) -> bool {
    let base = name.strip_suffix(".fifo").unwrap_or(name);
    !base.is_empty()
        && name.len() <= 80
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_arn_shape() {
        assert_eq!(
            queue_arn("us-east-1", DEFAULT_ACCOUNT, "orders"),
            "arn:aws:sqs:us-east-1:000000000000:orders"
        );
    }

    #[test]
    fn test_resource_name_is_last_segment() {
        assert_eq!(
            resource_name("arn:aws:sqs:us-east-1:000000000000:orders.fifo"),
            Some("orders.fifo")
        );
        assert_eq!(resource_name(""), None);
    }

    #[test]
    fn test_subscription_arn_round_trip() {
        let topic = topic_arn("us-east-1", DEFAULT_ACCOUNT, "alerts");
        let sub = subscription_arn(&topic, "a-b-c");
        assert_eq!(subscription_topic_arn(&sub), Some(topic.as_str()));
        assert_eq!(resource_name(&sub), Some("a-b-c"));
    }

    #[test]
    fn test_name_validation() {
        assert!(is_valid_resource_name("orders"));
        assert!(is_valid_resource_name("orders-1_2"));
        assert!(is_valid_resource_name("orders.fifo"));
        assert!(!is_valid_resource_name("orders.queue"));
        assert!(!is_valid_resource_name(""));
        assert!(!is_valid_resource_name(&"x".repeat(81)));
    }
}
