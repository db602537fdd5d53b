//! Message model, body validation, and wire digests.
//!
//! Digests must match the real service bit-exactly: the body digest is MD5
//! of the UTF-8 body, the attribute digest is MD5 of a canonical
//! big-endian, length-prefixed encoding of the sorted attribute names.

use std::collections::HashMap;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, ServiceError};

/// Transport marker for string-valued attributes in the canonical encoding.
const TRANSPORT_STRING: u8 = 0x01;
/// Transport marker for binary-valued attributes.
const TRANSPORT_BINARY: u8 = 0x02;

/// A single message attribute. `DataType` is `String`, `Number`, `Binary`,
/// or a custom-labelled variant of those (`Number.float`, `Binary.gif`, …).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAttributeValue {
    #[serde(rename = "DataType")]
    pub data_type: String,

    #[serde(rename = "StringValue", default, skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,

    #[serde(
        rename = "BinaryValue",
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes"
    )]
    pub binary_value: Option<Vec<u8>>,
}

impl MessageAttributeValue {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            data_type: "String".to_string(),
            string_value: Some(value.into()),
            binary_value: None,
        }
    }

    pub fn number(value: impl Into<String>) -> Self {
        Self {
            data_type: "Number".to_string(),
            string_value: Some(value.into()),
            binary_value: None,
        }
    }

    pub fn binary(value: Vec<u8>) -> Self {
        Self {
            data_type: "Binary".to_string(),
            string_value: None,
            binary_value: Some(value),
        }
    }

    fn is_binary(&self) -> bool {
        self.data_type == "Binary" || self.data_type.starts_with("Binary.")
    }

    /// Bytes this attribute's value contributes to the message size.
    fn value_len(&self) -> usize {
        if self.is_binary() {
            self.binary_value.as_ref().map_or(0, |v| v.len())
        } else {
            self.string_value.as_ref().map_or(0, |v| v.len())
        }
    }
}

/// Base64 transport for binary attribute values in JSON bodies.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            None => Ok(None),
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// A message held by a queue.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: String,
    pub body: String,
    pub body_digest: String,
    pub attributes: HashMap<String, MessageAttributeValue>,
    pub attributes_digest: Option<String>,
    /// Milliseconds since the epoch.
    pub sent_timestamp: u64,
    pub receive_count: u32,
    pub first_receive_timestamp: Option<u64>,
    /// When set and in the future, the message sits in the delayed pool.
    pub delay_until: Option<u64>,
    pub group_id: Option<String>,
    pub dedup_id: Option<String>,
    /// 20-digit zero-padded, per-queue monotonic. FIFO only.
    pub sequence_number: Option<String>,
}

impl Message {
    pub fn new(
        body: String,
        attributes: HashMap<String, MessageAttributeValue>,
        sent_timestamp: u64,
    ) -> Self {
        let body_digest = md5_hex(body.as_bytes());
        let attributes_digest = attributes_digest(&attributes);
        Self {
            message_id: Uuid::new_v4().to_string(),
            body,
            body_digest,
            attributes,
            attributes_digest,
            sent_timestamp,
            receive_count: 0,
            first_receive_timestamp: None,
            delay_until: None,
            group_id: None,
            dedup_id: None,
            sequence_number: None,
        }
    }

    /// Attribute map rendered for spy events and structural filters.
    pub fn attributes_json(&self) -> HashMap<String, Value> {
        self.attributes
            .iter()
            .filter_map(|(name, attr)| {
                serde_json::to_value(attr).ok().map(|v| (name.clone(), v))
            })
            .collect()
    }
}

/// MD5 digest rendered as lowercase hex.
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Canonical attribute digest: for each name in ascending order, append
/// {u32-be name length, name, u32-be type length, type, transport byte,
/// u32-be value length, value bytes}; the digest is MD5 of that buffer.
/// Empty attribute sets have no digest.
pub fn attributes_digest(attrs: &HashMap<String, MessageAttributeValue>) -> Option<String> {
    if attrs.is_empty() {
        return None;
    }
    let mut names: Vec<&String> = attrs.keys().collect();
    names.sort();

    let mut buf: Vec<u8> = Vec::new();
    for name in names {
        let attr = &attrs[name];
        buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(&(attr.data_type.len() as u32).to_be_bytes());
        buf.extend_from_slice(attr.data_type.as_bytes());
        if attr.is_binary() {
            let value = attr.binary_value.as_deref().unwrap_or_default();
            buf.push(TRANSPORT_BINARY);
            buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
            buf.extend_from_slice(value);
        } else {
            let value = attr.string_value.as_deref().unwrap_or_default();
            buf.push(TRANSPORT_STRING);
            buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
            buf.extend_from_slice(value.as_bytes());
        }
    }
    Some(md5_hex(&buf))
}

/// Reject bodies containing code points outside the allowed XML subset:
/// #x9, #xA, #xD, #x20–#xD7FF, #xE000–#xFFFD, #x10000–#x10FFFF.
pub fn validate_body_characters(body: &str) -> Result<()> {
    let allowed = |c: char| {
        matches!(c, '\u{9}' | '\u{A}' | '\u{D}')
            || ('\u{20}'..='\u{D7FF}').contains(&c)
            || ('\u{E000}'..='\u{FFFD}').contains(&c)
            || ('\u{10000}'..='\u{10FFFF}').contains(&c)
    };
    if body.chars().all(allowed) {
        Ok(())
    } else {
        Err(ServiceError::InvalidMessageContents)
    }
}

/// Validate attribute well-formedness: a data type is present and the value
/// slot matches it.
pub fn validate_attributes(attrs: &HashMap<String, MessageAttributeValue>) -> Result<()> {
    for (name, attr) in attrs {
        if name.is_empty() {
            return Err(ServiceError::InvalidParameterValue(
                "Message attribute name must not be empty".to_string(),
            ));
        }
        if attr.data_type.is_empty() {
            return Err(ServiceError::InvalidParameterValue(format!(
                "Message attribute '{name}' must have a DataType"
            )));
        }
        if attr.is_binary() {
            if attr.binary_value.is_none() {
                return Err(ServiceError::InvalidParameterValue(format!(
                    "Message attribute '{name}' of type {} requires a BinaryValue",
                    attr.data_type
                )));
            }
        } else if attr.string_value.is_none() {
            return Err(ServiceError::InvalidParameterValue(format!(
                "Message attribute '{name}' of type {} requires a StringValue",
                attr.data_type
            )));
        }
    }
    Ok(())
}

/// Queue-message size: UTF-8 body bytes plus, per attribute, name bytes +
/// DataType bytes + value bytes.
pub fn message_size(body: &str, attrs: &HashMap<String, MessageAttributeValue>) -> usize {
    body.len()
        + attrs
            .iter()
            .map(|(name, attr)| name.len() + attr.data_type.len() + attr.value_len())
            .sum::<usize>()
}
