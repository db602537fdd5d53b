//! Object service shell: S3-compatible REST endpoints.
//!
//! Paths are already path-style when they arrive here (the dispatcher
//! rewrites virtual-hosted requests). Query-string flags select the
//! multipart and bulk-delete operations; everything else is routed by
//! method and the presence of a key.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::header::{
    CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, IF_MATCH, IF_MODIFIED_SINCE,
    IF_NONE_MATCH, IF_UNMODIFIED_SINCE, LAST_MODIFIED, RANGE,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::DateTime;
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use tracing::debug;

use crate::app::App;
use crate::arn::DEFAULT_ACCOUNT;
use crate::error::{Result, ServiceError};
use crate::store::bucket::{GetObjectResult, ListResult, ObjectContent};
use crate::store::multipart::CompletedPartRef;
use crate::store::object::Conditions;

use super::xml::{text_element, XML_DECL};
use super::s3_error_response;

pub(crate) async fn handle(
    app: &Arc<App>,
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let query: HashMap<String, String> = form_urlencoded::parse(query.unwrap_or("").as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return match *method {
            Method::GET => list_buckets(app).await,
            _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        };
    }
    let (bucket, key) = match trimmed.split_once('/') {
        Some((bucket, key)) if !key.is_empty() => {
            (bucket.to_string(), Some(decode_component(key)))
        }
        _ => (trimmed.trim_end_matches('/').to_string(), None),
    };
    debug!(method = %method, bucket = %bucket, key = ?key, "object action");

    let result = match key {
        None => bucket_op(app, method, &bucket, &query, &body).await,
        Some(key) => object_op(app, method, &bucket, &key, &query, headers, body).await,
    };
    result.unwrap_or_else(|error| s3_error_response(&error))
}

fn decode_component(raw: &str) -> String {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

// -- formatting helpers ----------------------------------------------------

fn quoted(etag: &str) -> String {
    format!("\"{etag}\"")
}

fn http_date(millis: u64) -> String {
    DateTime::from_timestamp_millis(millis as i64)
        .unwrap_or_default()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn iso_date(millis: u64) -> String {
    DateTime::from_timestamp_millis(millis as i64)
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}

fn parse_http_date(value: &str) -> Option<u64> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.timestamp_millis() as u64)
}

fn conditions_from_headers(headers: &HeaderMap) -> Conditions {
    let header_str =
        |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
    Conditions {
        if_match: header_str(IF_MATCH),
        if_none_match: header_str(IF_NONE_MATCH),
        if_modified_since: header_str(IF_MODIFIED_SINCE)
            .as_deref()
            .and_then(parse_http_date),
        if_unmodified_since: header_str(IF_UNMODIFIED_SINCE)
            .as_deref()
            .and_then(parse_http_date),
    }
}

fn user_metadata(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut metadata: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().strip_prefix("x-amz-meta-")?;
            Some((name.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect();
    metadata.sort();
    metadata
}

fn xml_response(status: StatusCode, body: String) -> Response {
    (status, [(CONTENT_TYPE, "application/xml")], body).into_response()
}

fn object_headers(content: &ObjectContent) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&quoted(&content.etag)) {
        headers.insert(ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&http_date(content.last_modified)) {
        headers.insert(LAST_MODIFIED, value);
    }
    let content_type = content
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    if let Ok(value) = HeaderValue::from_str(content_type) {
        headers.insert(CONTENT_TYPE, value);
    }
    headers.insert(
        HeaderName::from_static("accept-ranges"),
        HeaderValue::from_static("bytes"),
    );
    for (name, value) in &content.metadata {
        let header = HeaderName::from_bytes(format!("x-amz-meta-{name}").as_bytes());
        if let (Ok(header), Ok(value)) = (header, HeaderValue::from_str(value)) {
            headers.insert(header, value);
        }
    }
    headers
}

// -- chunked transfer ------------------------------------------------------

fn is_aws_chunked(headers: &HeaderMap) -> bool {
    let sha = headers
        .get("x-amz-content-sha256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let encoding = headers
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    sha.starts_with("STREAMING-") || encoding.split(',').any(|e| e.trim() == "aws-chunked")
}

/// Strip the aws-chunked framing: `<hex-size>[;sig]\r\n<data>\r\n … 0;…`.
fn decode_aws_chunked(body: &[u8]) -> Option<Bytes> {
    let mut decoded = Vec::with_capacity(body.len());
    let mut rest = body;
    loop {
        let line_end = rest.windows(2).position(|w| w == b"\r\n")?;
        let header = std::str::from_utf8(&rest[..line_end]).ok()?;
        let size = usize::from_str_radix(header.split(';').next()?.trim(), 16).ok()?;
        rest = &rest[line_end + 2..];
        if size == 0 {
            return Some(Bytes::from(decoded));
        }
        if rest.len() < size + 2 {
            return None;
        }
        decoded.extend_from_slice(&rest[..size]);
        rest = &rest[size + 2..];
    }
}

// -- bucket operations -----------------------------------------------------

async fn list_buckets(app: &Arc<App>) -> Response {
    let buckets: String = app
        .store
        .list_buckets()
        .await
        .into_iter()
        .map(|(name, created_at)| {
            format!(
                "<Bucket>{}{}</Bucket>",
                text_element("Name", &name),
                text_element("CreationDate", &iso_date(created_at))
            )
        })
        .collect();
    let body = format!(
        "{XML_DECL}<ListAllMyBucketsResult><Owner>{}{}</Owner><Buckets>{buckets}</Buckets></ListAllMyBucketsResult>",
        text_element("ID", DEFAULT_ACCOUNT),
        text_element("DisplayName", DEFAULT_ACCOUNT),
    );
    xml_response(StatusCode::OK, body)
}

#[derive(Debug, Deserialize)]
struct DeleteRequestXml {
    #[serde(rename = "Object", default)]
    objects: Vec<ObjectIdentXml>,
    #[serde(rename = "Quiet", default)]
    quiet: bool,
}

#[derive(Debug, Deserialize)]
struct ObjectIdentXml {
    #[serde(rename = "Key")]
    key: String,
}

async fn bucket_op(
    app: &Arc<App>,
    method: &Method,
    bucket: &str,
    query: &HashMap<String, String>,
    body: &Bytes,
) -> Result<Response> {
    match *method {
        Method::PUT => {
            app.store.create_bucket(bucket).await?;
            Ok(StatusCode::OK.into_response())
        }
        Method::HEAD => {
            app.store.head_bucket(bucket).await?;
            Ok(StatusCode::OK.into_response())
        }
        Method::DELETE => {
            app.store.delete_bucket(bucket).await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        Method::GET => {
            if query.get("list-type").map(String::as_str) == Some("2") {
                let listing = app
                    .store
                    .list_objects_v2(
                        bucket,
                        query.get("prefix").map(String::as_str),
                        query.get("delimiter").map(String::as_str),
                        query.get("continuation-token").map(String::as_str),
                        query.get("max-keys").and_then(|v| v.parse().ok()),
                    )
                    .await?;
                Ok(xml_response(
                    StatusCode::OK,
                    list_result_xml(bucket, query, &listing, true),
                ))
            } else {
                let listing = app
                    .store
                    .list_objects(
                        bucket,
                        query.get("prefix").map(String::as_str),
                        query.get("delimiter").map(String::as_str),
                        query.get("marker").map(String::as_str),
                        query.get("max-keys").and_then(|v| v.parse().ok()),
                    )
                    .await?;
                Ok(xml_response(
                    StatusCode::OK,
                    list_result_xml(bucket, query, &listing, false),
                ))
            }
        }
        Method::POST if query.contains_key("delete") => {
            let request: DeleteRequestXml = quick_xml::de::from_str(
                std::str::from_utf8(body).unwrap_or_default(),
            )
            .map_err(|e| {
                ServiceError::InvalidParameterValue(format!("Malformed Delete request: {e}"))
            })?;
            let keys: Vec<String> = request.objects.into_iter().map(|o| o.key).collect();
            let deleted = app.store.delete_objects(bucket, keys).await?;
            let entries: String = if request.quiet {
                String::new()
            } else {
                deleted
                    .iter()
                    .map(|key| format!("<Deleted>{}</Deleted>", text_element("Key", key)))
                    .collect()
            };
            Ok(xml_response(
                StatusCode::OK,
                format!("{XML_DECL}<DeleteResult>{entries}</DeleteResult>"),
            ))
        }
        _ => Ok(StatusCode::METHOD_NOT_ALLOWED.into_response()),
    }
}

fn list_result_xml(
    bucket: &str,
    query: &HashMap<String, String>,
    listing: &ListResult,
    v2: bool,
) -> String {
    let mut inner = String::new();
    inner.push_str(&text_element("Name", bucket));
    inner.push_str(&text_element(
        "Prefix",
        query.get("prefix").map(String::as_str).unwrap_or(""),
    ));
    inner.push_str(&text_element(
        "MaxKeys",
        &query
            .get("max-keys")
            .cloned()
            .unwrap_or_else(|| "1000".to_string()),
    ));
    inner.push_str(&text_element(
        "IsTruncated",
        &listing.is_truncated.to_string(),
    ));
    if v2 {
        inner.push_str(&text_element(
            "KeyCount",
            &(listing.contents.len() + listing.common_prefixes.len()).to_string(),
        ));
        if let Some(token) = query.get("continuation-token") {
            inner.push_str(&text_element("ContinuationToken", token));
        }
        if let Some(ref token) = listing.next_continuation_token {
            inner.push_str(&text_element("NextContinuationToken", token));
        }
    } else {
        inner.push_str(&text_element(
            "Marker",
            query.get("marker").map(String::as_str).unwrap_or(""),
        ));
        if let Some(ref marker) = listing.next_marker {
            inner.push_str(&text_element("NextMarker", marker));
        }
    }
    for object in &listing.contents {
        inner.push_str(&format!(
            "<Contents>{}{}{}{}{}</Contents>",
            text_element("Key", &object.key),
            text_element("LastModified", &iso_date(object.last_modified)),
            text_element("ETag", &quoted(&object.etag)),
            text_element("Size", &object.size.to_string()),
            text_element("StorageClass", "STANDARD"),
        ));
    }
    for prefix in &listing.common_prefixes {
        inner.push_str(&format!(
            "<CommonPrefixes>{}</CommonPrefixes>",
            text_element("Prefix", prefix)
        ));
    }
    format!("{XML_DECL}<ListBucketResult>{inner}</ListBucketResult>")
}

// -- object operations -----------------------------------------------------

#[derive(Debug, Deserialize)]
struct CompleteMultipartXml {
    #[serde(rename = "Part", default)]
    parts: Vec<PartXml>,
}

#[derive(Debug, Deserialize)]
struct PartXml {
    #[serde(rename = "PartNumber")]
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: String,
}

async fn object_op(
    app: &Arc<App>,
    method: &Method,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response> {
    match *method {
        Method::POST if query.contains_key("uploads") => {
            let upload_id = app
                .store
                .create_multipart_upload(
                    bucket,
                    key,
                    headers
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string),
                    user_metadata(headers),
                )
                .await?;
            let body = format!(
                "{XML_DECL}<InitiateMultipartUploadResult>{}{}{}</InitiateMultipartUploadResult>",
                text_element("Bucket", bucket),
                text_element("Key", key),
                text_element("UploadId", &upload_id),
            );
            Ok(xml_response(StatusCode::OK, body))
        }
        Method::PUT if query.contains_key("uploadId") && query.contains_key("partNumber") => {
            let upload_id = &query["uploadId"];
            let part_number: u32 = query["partNumber"].parse().map_err(|_| {
                ServiceError::InvalidPart("partNumber must be an integer".to_string())
            })?;
            let etag = app
                .store
                .upload_part(bucket, upload_id, part_number, body)
                .await?;
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(&quoted(&etag)) {
                headers.insert(ETAG, value);
            }
            Ok((StatusCode::OK, headers).into_response())
        }
        Method::POST if query.contains_key("uploadId") => {
            let upload_id = &query["uploadId"];
            let request: CompleteMultipartXml = quick_xml::de::from_str(
                std::str::from_utf8(&body).unwrap_or_default(),
            )
            .map_err(|e| {
                ServiceError::InvalidPart(format!("Malformed completion request: {e}"))
            })?;
            let parts: Vec<CompletedPartRef> = request
                .parts
                .into_iter()
                .map(|p| CompletedPartRef {
                    part_number: p.part_number,
                    etag: p.etag,
                })
                .collect();
            let (completed_key, etag) = app
                .store
                .complete_multipart_upload(bucket, upload_id, &parts)
                .await?;
            let body = format!(
                "{XML_DECL}<CompleteMultipartUploadResult>{}{}{}</CompleteMultipartUploadResult>",
                text_element("Bucket", bucket),
                text_element("Key", &completed_key),
                text_element("ETag", &quoted(&etag)),
            );
            Ok(xml_response(StatusCode::OK, body))
        }
        Method::DELETE if query.contains_key("uploadId") => {
            app.store
                .abort_multipart_upload(bucket, &query["uploadId"])
                .await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        Method::PUT if headers.contains_key("x-amz-copy-source") => {
            let source = headers
                .get("x-amz-copy-source")
                .and_then(|v| v.to_str().ok())
                .map(decode_component)
                .unwrap_or_default();
            let source = source.trim_start_matches('/');
            let (src_bucket, src_key) = source.split_once('/').ok_or_else(|| {
                ServiceError::InvalidParameterValue(format!(
                    "Invalid copy source: {source}"
                ))
            })?;
            let (etag, last_modified) = app
                .store
                .copy_object(src_bucket, src_key, bucket, key)
                .await?;
            let body = format!(
                "{XML_DECL}<CopyObjectResult>{}{}</CopyObjectResult>",
                text_element("ETag", &quoted(&etag)),
                text_element("LastModified", &iso_date(last_modified)),
            );
            Ok(xml_response(StatusCode::OK, body))
        }
        Method::PUT => {
            let data = if is_aws_chunked(headers) {
                decode_aws_chunked(&body).ok_or_else(|| {
                    ServiceError::InvalidParameterValue(
                        "Malformed aws-chunked payload".to_string(),
                    )
                })?
            } else {
                body
            };
            let etag = app
                .store
                .put_object(
                    bucket,
                    key,
                    data,
                    headers
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string),
                    user_metadata(headers),
                )
                .await?;
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(&quoted(&etag)) {
                headers.insert(ETAG, value);
            }
            Ok((StatusCode::OK, headers).into_response())
        }
        Method::GET => {
            let range = headers.get(RANGE).and_then(|v| v.to_str().ok());
            let conditions = conditions_from_headers(headers);
            match app.store.get_object(bucket, key, range, &conditions).await? {
                GetObjectResult::NotModified {
                    etag,
                    last_modified,
                } => Ok(not_modified_response(&etag, last_modified)),
                GetObjectResult::Content(content) => {
                    let mut headers = object_headers(&content);
                    let status = match content.range {
                        Some((start, end, total)) => {
                            if let Ok(value) = HeaderValue::from_str(&format!(
                                "bytes {start}-{end}/{total}"
                            )) {
                                headers.insert(CONTENT_RANGE, value);
                            }
                            StatusCode::PARTIAL_CONTENT
                        }
                        None => StatusCode::OK,
                    };
                    Ok((status, headers, content.data).into_response())
                }
            }
        }
        Method::HEAD => {
            let conditions = conditions_from_headers(headers);
            match app.store.head_object(bucket, key, &conditions).await? {
                GetObjectResult::NotModified {
                    etag,
                    last_modified,
                } => Ok(not_modified_response(&etag, last_modified)),
                GetObjectResult::Content(content) => {
                    let mut headers = object_headers(&content);
                    if let Ok(value) =
                        HeaderValue::from_str(&content.total_size.to_string())
                    {
                        headers.insert(CONTENT_LENGTH, value);
                    }
                    Ok((StatusCode::OK, headers).into_response())
                }
            }
        }
        Method::DELETE => {
            app.store.delete_object(bucket, key).await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        _ => Ok(StatusCode::METHOD_NOT_ALLOWED.into_response()),
    }
}

fn not_modified_response(etag: &str, last_modified: u64) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&quoted(etag)) {
        headers.insert(ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&http_date(last_modified)) {
        headers.insert(LAST_MODIFIED, value);
    }
    (StatusCode::NOT_MODIFIED, headers).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_aws_chunked() {
        let framed = b"5;chunk-signature=abc\r\nhello\r\n5;chunk-signature=def\r\nworld\r\n0;chunk-signature=end\r\n\r\n";
        let decoded = decode_aws_chunked(framed).expect("decode");
        assert_eq!(&decoded[..], b"helloworld");
    }

    #[test]
    fn test_decode_aws_chunked_rejects_truncated() {
        assert!(decode_aws_chunked(b"5\r\nhel").is_none());
        assert!(decode_aws_chunked(b"nothex\r\n").is_none());
    }

    #[test]
    fn test_http_date_format() {
        // 2024-01-01T00:00:00Z
        assert_eq!(http_date(1_704_067_200_000), "Mon, 01 Jan 2024 00:00:00 GMT");
        assert_eq!(
            parse_http_date("Mon, 01 Jan 2024 00:00:00 GMT"),
            Some(1_704_067_200_000)
        );
    }

    #[test]
    fn test_delete_request_xml() {
        let raw = "<Delete><Object><Key>a</Key></Object><Object><Key>b</Key></Object><Quiet>true</Quiet></Delete>";
        let parsed: DeleteRequestXml = quick_xml::de::from_str(raw).expect("parse");
        assert!(parsed.quiet);
        assert_eq!(parsed.objects.len(), 2);
        assert_eq!(parsed.objects[0].key, "a");
    }

    #[test]
    fn test_complete_multipart_xml() {
        let raw = "<CompleteMultipartUpload><Part><PartNumber>1</PartNumber><ETag>\"e1\"</ETag></Part><Part><PartNumber>2</PartNumber><ETag>e2</ETag></Part></CompleteMultipartUpload>";
        let parsed: CompleteMultipartXml = quick_xml::de::from_str(raw).expect("parse");
        assert_eq!(parsed.parts.len(), 2);
        assert_eq!(parsed.parts[0].part_number, 1);
        assert_eq!(parsed.parts[1].etag, "e2");
    }
}
