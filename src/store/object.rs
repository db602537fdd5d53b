//! Stored objects, byte ranges, and conditional-request evaluation.

use bytes::Bytes;

use crate::error::{Result, ServiceError};
use crate::queue::message::md5_hex;

/// One stored object. `etag` is kept unquoted; the shell adds quotes.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub etag: String,
    /// Milliseconds since the epoch.
    pub last_modified: u64,
    pub content_type: Option<String>,
    /// User metadata from `x-amz-meta-*` headers, lowercased names.
    pub metadata: Vec<(String, String)>,
}

impl StoredObject {
    pub fn new(
        data: Bytes,
        now: u64,
        content_type: Option<String>,
        metadata: Vec<(String, String)>,
    ) -> Self {
        let etag = md5_hex(&data);
        Self {
            data,
            etag,
            last_modified: now,
            content_type,
            metadata,
        }
    }
}

/// Inclusive byte range within an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

/// Resolve an HTTP `Range` header value against an object length.
/// Only single `bytes=` ranges are supported; unsatisfiable ranges fail.
pub fn resolve_range(spec: &str, len: u64) -> Result<ByteRange> {
    let spec = spec
        .strip_prefix("bytes=")
        .ok_or(ServiceError::InvalidRange)?;
    let (raw_start, raw_end) = spec.split_once('-').ok_or(ServiceError::InvalidRange)?;

    if raw_start.is_empty() {
        // Suffix range: last N bytes.
        let suffix: u64 = raw_end.parse().map_err(|_| ServiceError::InvalidRange)?;
        if suffix == 0 || len == 0 {
            return Err(ServiceError::InvalidRange);
        }
        return Ok(ByteRange {
            start: len.saturating_sub(suffix),
            end: len - 1,
        });
    }

    let start: u64 = raw_start.parse().map_err(|_| ServiceError::InvalidRange)?;
    if start >= len {
        return Err(ServiceError::InvalidRange);
    }
    let end = if raw_end.is_empty() {
        len - 1
    } else {
        let end: u64 = raw_end.parse().map_err(|_| ServiceError::InvalidRange)?;
        if end < start {
            return Err(ServiceError::InvalidRange);
        }
        end.min(len - 1)
    };
    Ok(ByteRange { start, end })
}

/// Conditional request headers, decoded by the shell. Timestamps are
/// milliseconds since the epoch; HTTP dates have second precision, so
/// comparisons truncate to seconds.
#[derive(Debug, Clone, Default)]
pub struct Conditions {
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<u64>,
    pub if_unmodified_since: Option<u64>,
}

impl Conditions {
    pub fn is_empty(&self) -> bool {
        self.if_match.is_none()
            && self.if_none_match.is_none()
            && self.if_modified_since.is_none()
            && self.if_unmodified_since.is_none()
    }
}

/// Outcome of conditional evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    Proceed,
    NotModified,
    Failed,
}

fn etag_matches(candidate: &str, etag: &str) -> bool {
    candidate
        .split(',')
        .map(|part| part.trim().trim_matches('"'))
        .any(|part| part == "*" || part == etag)
}

/// RFC 7232 precedence: `If-Match` before `If-Unmodified-Since`,
/// `If-None-Match` before `If-Modified-Since`.
pub fn evaluate_conditions(
    conditions: &Conditions,
    etag: &str,
    last_modified: u64,
) -> Precondition {
    let modified_secs = last_modified / 1000;

    if let Some(ref expected) = conditions.if_match {
        if !etag_matches(expected, etag) {
            return Precondition::Failed;
        }
    } else if let Some(since) = conditions.if_unmodified_since {
        if modified_secs > since / 1000 {
            return Precondition::Failed;
        }
    }

    if let Some(ref unexpected) = conditions.if_none_match {
        if etag_matches(unexpected, etag) {
            return Precondition::NotModified;
        }
    } else if let Some(since) = conditions.if_modified_since {
        if modified_secs <= since / 1000 {
            return Precondition::NotModified;
        }
    }

    Precondition::Proceed
}
