//! Bucket map and object-store operations.
//!
//! Keys live in a `BTreeMap` so listings come out in lexicographic order
//! without sorting. All mutation happens under the store lock; spy events
//! are emitted after it is released.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Result, ServiceError};
use crate::spy::{SpyBus, SpyEvent, SpyStatus};

use super::multipart::{assemble, CompletedPartRef, MultipartUpload};
use super::object::{
    evaluate_conditions, resolve_range, Conditions, Precondition, StoredObject,
};

/// Default and maximum page size for listings.
pub const LIST_MAX_KEYS: usize = 1_000;

#[derive(Debug)]
struct Bucket {
    created_at: u64,
    objects: BTreeMap<String, StoredObject>,
    uploads: HashMap<String, MultipartUpload>,
}

/// Summary row in a listing.
#[derive(Debug, Clone)]
pub struct ObjectSummary {
    pub key: String,
    pub etag: String,
    pub size: u64,
    pub last_modified: u64,
}

/// Result of ListObjects / ListObjectsV2.
#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub contents: Vec<ObjectSummary>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    /// v1 cursor: the last key or common prefix of a truncated page.
    pub next_marker: Option<String>,
    /// v2 cursor: base64 of the last returned key.
    pub next_continuation_token: Option<String>,
}

/// Resolved object content for GET/HEAD.
#[derive(Debug, Clone)]
pub struct ObjectContent {
    pub data: Bytes,
    pub etag: String,
    pub last_modified: u64,
    pub content_type: Option<String>,
    pub metadata: Vec<(String, String)>,
    /// `(start, end, total)` when a Range was applied.
    pub range: Option<(u64, u64, u64)>,
    pub total_size: u64,
}

/// GET/HEAD outcome after conditional evaluation.
#[derive(Debug, Clone)]
pub enum GetObjectResult {
    NotModified { etag: String, last_modified: u64 },
    Content(Box<ObjectContent>),
}

/// The in-memory object store.
pub struct ObjectStore {
    clock: Arc<dyn Clock>,
    spy: Arc<SpyBus>,
    buckets: RwLock<HashMap<String, Bucket>>,
}

fn valid_bucket_name(name: &str) -> bool {
    (3..=63).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && !name.starts_with(['-', '.'])
        && !name.ends_with(['-', '.'])
}

impl ObjectStore {
    pub fn new(clock: Arc<dyn Clock>, spy: Arc<SpyBus>) -> Self {
        Self {
            clock,
            spy,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    fn s3_event(bucket: &str, key: &str, status: SpyStatus) -> SpyEvent {
        SpyEvent::S3 {
            bucket: bucket.to_string(),
            key: key.to_string(),
            status,
        }
    }

    // -- buckets -----------------------------------------------------------

    /// Idempotent create.
    pub async fn create_bucket(&self, name: &str) -> Result<()> {
        if !valid_bucket_name(name) {
            return Err(ServiceError::InvalidParameterValue(format!(
                "Invalid bucket name: {name}"
            )));
        }
        let mut buckets = self.buckets.write().await;
        if !buckets.contains_key(name) {
            buckets.insert(
                name.to_string(),
                Bucket {
                    created_at: self.clock.now_millis(),
                    objects: BTreeMap::new(),
                    uploads: HashMap::new(),
                },
            );
            info!(bucket = %name, "bucket created");
        }
        Ok(())
    }

    pub async fn head_bucket(&self, name: &str) -> Result<()> {
        let buckets = self.buckets.read().await;
        if buckets.contains_key(name) {
            Ok(())
        } else {
            Err(ServiceError::NoSuchBucket(name.to_string()))
        }
    }

    /// Buckets can only be deleted once empty.
    pub async fn delete_bucket(&self, name: &str) -> Result<()> {
        let mut buckets = self.buckets.write().await;
        let bucket = buckets
            .get(name)
            .ok_or_else(|| ServiceError::NoSuchBucket(name.to_string()))?;
        if !bucket.objects.is_empty() {
            return Err(ServiceError::BucketNotEmpty(name.to_string()));
        }
        buckets.remove(name);
        info!(bucket = %name, "bucket deleted");
        Ok(())
    }

    /// `(name, created_at)` pairs sorted by name.
    pub async fn list_buckets(&self) -> Vec<(String, u64)> {
        let buckets = self.buckets.read().await;
        let mut names: Vec<(String, u64)> = buckets
            .iter()
            .map(|(name, bucket)| (name.clone(), bucket.created_at))
            .collect();
        names.sort();
        names
    }

    // -- objects -----------------------------------------------------------

    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: Option<String>,
        metadata: Vec<(String, String)>,
    ) -> Result<String> {
        let now = self.clock.now_millis();
        let etag = {
            let mut buckets = self.buckets.write().await;
            let bucket_state = buckets
                .get_mut(bucket)
                .ok_or_else(|| ServiceError::NoSuchBucket(bucket.to_string()))?;
            let object = StoredObject::new(data, now, content_type, metadata);
            let etag = object.etag.clone();
            bucket_state.objects.insert(key.to_string(), object);
            etag
        };
        debug!(bucket = %bucket, key = %key, "object stored");
        self.spy
            .add(Self::s3_event(bucket, key, SpyStatus::Uploaded))
            .await;
        Ok(etag)
    }

    pub async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<&str>,
        conditions: &Conditions,
    ) -> Result<GetObjectResult> {
        let result = self.fetch(bucket, key, range, conditions).await?;
        if matches!(result, GetObjectResult::Content(_)) {
            self.spy
                .add(Self::s3_event(bucket, key, SpyStatus::Downloaded))
                .await;
        }
        Ok(result)
    }

    /// Like `get_object` but without the download spy event.
    pub async fn head_object(
        &self,
        bucket: &str,
        key: &str,
        conditions: &Conditions,
    ) -> Result<GetObjectResult> {
        self.fetch(bucket, key, None, conditions).await
    }

    async fn fetch(
        &self,
        bucket: &str,
        key: &str,
        range: Option<&str>,
        conditions: &Conditions,
    ) -> Result<GetObjectResult> {
        let buckets = self.buckets.read().await;
        let bucket_state = buckets
            .get(bucket)
            .ok_or_else(|| ServiceError::NoSuchBucket(bucket.to_string()))?;
        let object = bucket_state
            .objects
            .get(key)
            .ok_or_else(|| ServiceError::NoSuchKey(key.to_string()))?;

        match evaluate_conditions(conditions, &object.etag, object.last_modified) {
            Precondition::Failed => return Err(ServiceError::PreconditionFailed),
            Precondition::NotModified => {
                return Ok(GetObjectResult::NotModified {
                    etag: object.etag.clone(),
                    last_modified: object.last_modified,
                })
            }
            Precondition::Proceed => {}
        }

        let total = object.data.len() as u64;
        let (data, applied_range) = match range {
            Some(spec) => {
                let resolved = resolve_range(spec, total)?;
                (
                    object
                        .data
                        .slice(resolved.start as usize..=resolved.end as usize),
                    Some((resolved.start, resolved.end, total)),
                )
            }
            None => (object.data.clone(), None),
        };

        Ok(GetObjectResult::Content(Box::new(ObjectContent {
            data,
            etag: object.etag.clone(),
            last_modified: object.last_modified,
            content_type: object.content_type.clone(),
            metadata: object.metadata.clone(),
            range: applied_range,
            total_size: total,
        })))
    }

    /// Deleting a missing key succeeds; the spy event fires only when
    /// something was actually removed.
    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let existed = {
            let mut buckets = self.buckets.write().await;
            let bucket_state = buckets
                .get_mut(bucket)
                .ok_or_else(|| ServiceError::NoSuchBucket(bucket.to_string()))?;
            bucket_state.objects.remove(key).is_some()
        };
        if existed {
            self.spy
                .add(Self::s3_event(bucket, key, SpyStatus::Deleted))
                .await;
        }
        Ok(())
    }

    /// Bulk delete; every key is reported as deleted regardless of prior
    /// existence. Returns the deleted-key list for non-Quiet responses.
    pub async fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> Result<Vec<String>> {
        let removed: Vec<(String, bool)> = {
            let mut buckets = self.buckets.write().await;
            let bucket_state = buckets
                .get_mut(bucket)
                .ok_or_else(|| ServiceError::NoSuchBucket(bucket.to_string()))?;
            keys.into_iter()
                .map(|key| {
                    let existed = bucket_state.objects.remove(&key).is_some();
                    (key, existed)
                })
                .collect()
        };
        let mut deleted = Vec::with_capacity(removed.len());
        for (key, existed) in removed {
            if existed {
                self.spy
                    .add(Self::s3_event(bucket, &key, SpyStatus::Deleted))
                    .await;
            }
            deleted.push(key);
        }
        Ok(deleted)
    }

    /// Server-side copy; metadata and content type travel with the object.
    pub async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<(String, u64)> {
        let now = self.clock.now_millis();
        let etag = {
            let mut buckets = self.buckets.write().await;
            let source = buckets
                .get(src_bucket)
                .ok_or_else(|| ServiceError::NoSuchBucket(src_bucket.to_string()))?
                .objects
                .get(src_key)
                .ok_or_else(|| ServiceError::NoSuchKey(src_key.to_string()))?
                .clone();
            let destination = buckets
                .get_mut(dst_bucket)
                .ok_or_else(|| ServiceError::NoSuchBucket(dst_bucket.to_string()))?;
            let mut copied = source;
            copied.last_modified = now;
            let etag = copied.etag.clone();
            destination.objects.insert(dst_key.to_string(), copied);
            etag
        };
        self.spy
            .add(Self::s3_event(dst_bucket, dst_key, SpyStatus::Copied))
            .await;
        Ok((etag, now))
    }

    // -- listings ----------------------------------------------------------

    /// ListObjects (v1): `marker` is an exclusive key cursor.
    pub async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        delimiter: Option<&str>,
        marker: Option<&str>,
        max_keys: Option<usize>,
    ) -> Result<ListResult> {
        let mut result = self
            .list_core(bucket, prefix, delimiter, marker, max_keys)
            .await?;
        result.next_continuation_token = None;
        Ok(result)
    }

    /// ListObjectsV2: the continuation token is base64 of the last key of
    /// the previous page.
    pub async fn list_objects_v2(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        delimiter: Option<&str>,
        continuation_token: Option<&str>,
        max_keys: Option<usize>,
    ) -> Result<ListResult> {
        let decoded = continuation_token
            .and_then(|t| BASE64.decode(t.as_bytes()).ok())
            .and_then(|b| String::from_utf8(b).ok());
        let mut result = self
            .list_core(bucket, prefix, delimiter, decoded.as_deref(), max_keys)
            .await?;
        result.next_continuation_token = result
            .is_truncated
            .then(|| result.next_marker.as_deref().map(|m| BASE64.encode(m)))
            .flatten();
        result.next_marker = None;
        Ok(result)
    }

    async fn list_core(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        delimiter: Option<&str>,
        after: Option<&str>,
        max_keys: Option<usize>,
    ) -> Result<ListResult> {
        let buckets = self.buckets.read().await;
        let bucket_state = buckets
            .get(bucket)
            .ok_or_else(|| ServiceError::NoSuchBucket(bucket.to_string()))?;
        let prefix = prefix.unwrap_or("");
        let page_size = max_keys.unwrap_or(LIST_MAX_KEYS).min(LIST_MAX_KEYS);

        let mut result = ListResult::default();
        let mut last_item: Option<String> = None;
        let mut count = 0usize;
        for (key, object) in bucket_state.objects.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            // Common prefixes also count as items, so the cursor compares
            // against whichever item kind was emitted last.
            let item = match delimiter {
                Some(d) if !d.is_empty() => {
                    match key[prefix.len()..].find(d) {
                        Some(pos) => {
                            let rollup = key[..prefix.len() + pos + d.len()].to_string();
                            if after.is_some_and(|a| rollup.as_str() <= a) {
                                continue;
                            }
                            if result.common_prefixes.last() == Some(&rollup) {
                                continue;
                            }
                            if count == page_size {
                                result.is_truncated = true;
                                break;
                            }
                            result.common_prefixes.push(rollup.clone());
                            rollup
                        }
                        None => {
                            if after.is_some_and(|a| key.as_str() <= a) {
                                continue;
                            }
                            if count == page_size {
                                result.is_truncated = true;
                                break;
                            }
                            result.contents.push(ObjectSummary {
                                key: key.clone(),
                                etag: object.etag.clone(),
                                size: object.data.len() as u64,
                                last_modified: object.last_modified,
                            });
                            key.clone()
                        }
                    }
                }
                _ => {
                    if after.is_some_and(|a| key.as_str() <= a) {
                        continue;
                    }
                    if count == page_size {
                        result.is_truncated = true;
                        break;
                    }
                    result.contents.push(ObjectSummary {
                        key: key.clone(),
                        etag: object.etag.clone(),
                        size: object.data.len() as u64,
                        last_modified: object.last_modified,
                    });
                    key.clone()
                }
            };
            count += 1;
            last_item = Some(item);
        }
        if result.is_truncated {
            result.next_marker = last_item;
        }
        Ok(result)
    }

    // -- multipart ---------------------------------------------------------

    pub async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        metadata: Vec<(String, String)>,
    ) -> Result<String> {
        let mut buckets = self.buckets.write().await;
        let bucket_state = buckets
            .get_mut(bucket)
            .ok_or_else(|| ServiceError::NoSuchBucket(bucket.to_string()))?;
        let upload_id = Uuid::new_v4().to_string();
        bucket_state.uploads.insert(
            upload_id.clone(),
            MultipartUpload::new(upload_id.clone(), key.to_string(), content_type, metadata),
        );
        debug!(bucket = %bucket, key = %key, upload_id = %upload_id, "multipart upload started");
        Ok(upload_id)
    }

    pub async fn upload_part(
        &self,
        bucket: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        let mut buckets = self.buckets.write().await;
        let bucket_state = buckets
            .get_mut(bucket)
            .ok_or_else(|| ServiceError::NoSuchBucket(bucket.to_string()))?;
        let upload = bucket_state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| ServiceError::NoSuchUpload(upload_id.to_string()))?;
        upload.put_part(part_number, data)
    }

    /// Verify and stitch the parts, store the object, drop the upload.
    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        upload_id: &str,
        parts: &[CompletedPartRef],
    ) -> Result<(String, String)> {
        let now = self.clock.now_millis();
        let (key, etag) = {
            let mut buckets = self.buckets.write().await;
            let bucket_state = buckets
                .get_mut(bucket)
                .ok_or_else(|| ServiceError::NoSuchBucket(bucket.to_string()))?;
            let upload = bucket_state
                .uploads
                .get(upload_id)
                .ok_or_else(|| ServiceError::NoSuchUpload(upload_id.to_string()))?;

            let (body, etag) = assemble(upload, parts)?;
            let key = upload.key.clone();
            let mut object = StoredObject::new(
                body,
                now,
                upload.content_type.clone(),
                upload.metadata.clone(),
            );
            object.etag = etag.clone();
            bucket_state.objects.insert(key.clone(), object);
            bucket_state.uploads.remove(upload_id);
            (key, etag)
        };
        info!(bucket = %bucket, key = %key, upload_id = %upload_id, "multipart upload completed");
        self.spy
            .add(Self::s3_event(bucket, &key, SpyStatus::Uploaded))
            .await;
        Ok((key, etag))
    }

    pub async fn abort_multipart_upload(&self, bucket: &str, upload_id: &str) -> Result<()> {
        let mut buckets = self.buckets.write().await;
        let bucket_state = buckets
            .get_mut(bucket)
            .ok_or_else(|| ServiceError::NoSuchBucket(bucket.to_string()))?;
        bucket_state
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| ServiceError::NoSuchUpload(upload_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn store() -> ObjectStore {
        ObjectStore::new(Arc::new(SystemClock), Arc::new(SpyBus::new(100)))
    }

    async fn content(result: GetObjectResult) -> ObjectContent {
        match result {
            GetObjectResult::Content(content) => *content,
            GetObjectResult::NotModified { .. } => panic!("expected content"),
        }
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let store = store();
        store.create_bucket("files").await.expect("bucket");
        let etag = store
            .put_object(
                "files",
                "a.txt",
                Bytes::from_static(b"hello"),
                Some("text/plain".to_string()),
                vec![("owner".to_string(), "me".to_string())],
            )
            .await
            .expect("put");
        assert_eq!(etag, "5d41402abc4b2a76b9719d911017c592");

        let got = content(
            store
                .get_object("files", "a.txt", None, &Conditions::default())
                .await
                .expect("get"),
        )
        .await;
        assert_eq!(&got.data[..], b"hello");
        assert_eq!(got.etag, etag);
        assert_eq!(got.content_type.as_deref(), Some("text/plain"));
        assert_eq!(got.metadata, vec![("owner".to_string(), "me".to_string())]);
    }

    #[tokio::test]
    async fn test_missing_bucket_and_key() {
        let store = store();
        assert!(matches!(
            store
                .get_object("nope", "k", None, &Conditions::default())
                .await,
            Err(ServiceError::NoSuchBucket(_))
        ));
        store.create_bucket("files").await.expect("bucket");
        assert!(matches!(
            store
                .get_object("files", "k", None, &Conditions::default())
                .await,
            Err(ServiceError::NoSuchKey(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_bucket_requires_empty() {
        let store = store();
        store.create_bucket("files").await.expect("bucket");
        store
            .put_object("files", "k", Bytes::from_static(b"x"), None, Vec::new())
            .await
            .expect("put");
        assert!(matches!(
            store.delete_bucket("files").await,
            Err(ServiceError::BucketNotEmpty(_))
        ));
        store.delete_object("files", "k").await.expect("delete");
        store.delete_bucket("files").await.expect("now empty");
    }

    #[tokio::test]
    async fn test_ranged_get() {
        let store = store();
        store.create_bucket("files").await.expect("bucket");
        store
            .put_object(
                "files",
                "k",
                Bytes::from_static(b"0123456789"),
                None,
                Vec::new(),
            )
            .await
            .expect("put");
        let got = content(
            store
                .get_object("files", "k", Some("bytes=2-5"), &Conditions::default())
                .await
                .expect("ranged get"),
        )
        .await;
        assert_eq!(&got.data[..], b"2345");
        assert_eq!(got.range, Some((2, 5, 10)));
        assert!(matches!(
            store
                .get_object("files", "k", Some("bytes=10-"), &Conditions::default())
                .await,
            Err(ServiceError::InvalidRange)
        ));
    }

    #[tokio::test]
    async fn test_conditional_get() {
        let store = store();
        store.create_bucket("files").await.expect("bucket");
        let etag = store
            .put_object("files", "k", Bytes::from_static(b"v"), None, Vec::new())
            .await
            .expect("put");

        let conditions = Conditions {
            if_none_match: Some(etag.clone()),
            ..Default::default()
        };
        assert!(matches!(
            store
                .get_object("files", "k", None, &conditions)
                .await
                .expect("not modified"),
            GetObjectResult::NotModified { .. }
        ));

        let conditions = Conditions {
            if_match: Some("mismatch".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            store.get_object("files", "k", None, &conditions).await,
            Err(ServiceError::PreconditionFailed)
        ));
    }

    #[tokio::test]
    async fn test_list_with_delimiter_rolls_up_prefixes() {
        let store = store();
        store.create_bucket("files").await.expect("bucket");
        for key in ["a/1", "a/2", "b/1", "top"] {
            store
                .put_object("files", key, Bytes::from_static(b"x"), None, Vec::new())
                .await
                .expect("put");
        }
        let listing = store
            .list_objects("files", None, Some("/"), None, None)
            .await
            .expect("list");
        assert_eq!(listing.common_prefixes, vec!["a/", "b/"]);
        let keys: Vec<&str> = listing.contents.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["top"]);
        assert!(!listing.is_truncated);
    }

    #[tokio::test]
    async fn test_list_v1_pagination_with_marker() {
        let store = store();
        store.create_bucket("files").await.expect("bucket");
        for key in ["a", "b", "c"] {
            store
                .put_object("files", key, Bytes::from_static(b"x"), None, Vec::new())
                .await
                .expect("put");
        }
        let page = store
            .list_objects("files", None, None, None, Some(2))
            .await
            .expect("page 1");
        assert_eq!(page.contents.len(), 2);
        assert!(page.is_truncated);
        let marker = page.next_marker.expect("marker");
        assert_eq!(marker, "b");
        let rest = store
            .list_objects("files", None, None, Some(&marker), None)
            .await
            .expect("page 2");
        assert_eq!(rest.contents.len(), 1);
        assert_eq!(rest.contents[0].key, "c");
        assert!(!rest.is_truncated);
    }

    #[tokio::test]
    async fn test_list_v2_continuation_token_is_base64_key() {
        let store = store();
        store.create_bucket("files").await.expect("bucket");
        for key in ["a", "b", "c"] {
            store
                .put_object("files", key, Bytes::from_static(b"x"), None, Vec::new())
                .await
                .expect("put");
        }
        let page = store
            .list_objects_v2("files", None, None, None, Some(2))
            .await
            .expect("page 1");
        let token = page.next_continuation_token.expect("token");
        assert_eq!(BASE64.decode(&token).expect("decode"), b"b");
        let rest = store
            .list_objects_v2("files", None, None, Some(&token), None)
            .await
            .expect("page 2");
        assert_eq!(rest.contents[0].key, "c");
    }

    #[tokio::test]
    async fn test_copy_object_keeps_bytes_and_refreshes_timestamp() {
        let store = store();
        store.create_bucket("src").await.expect("bucket");
        store.create_bucket("dst").await.expect("bucket");
        let etag = store
            .put_object("src", "k", Bytes::from_static(b"payload"), None, Vec::new())
            .await
            .expect("put");
        let (copied_etag, _) = store
            .copy_object("src", "k", "dst", "k2")
            .await
            .expect("copy");
        assert_eq!(copied_etag, etag);
        let got = content(
            store
                .get_object("dst", "k2", None, &Conditions::default())
                .await
                .expect("get copy"),
        )
        .await;
        assert_eq!(&got.data[..], b"payload");
    }

    #[tokio::test]
    async fn test_multipart_lifecycle() {
        let store = store();
        store.create_bucket("files").await.expect("bucket");
        let upload_id = store
            .create_multipart_upload("files", "big", None, Vec::new())
            .await
            .expect("create");
        let etag1 = store
            .upload_part("files", &upload_id, 1, Bytes::from_static(b"abcde"))
            .await
            .expect("part 1");
        let etag2 = store
            .upload_part("files", &upload_id, 2, Bytes::from_static(b"fghij"))
            .await
            .expect("part 2");
        let (key, etag) = store
            .complete_multipart_upload(
                "files",
                &upload_id,
                &[
                    CompletedPartRef {
                        part_number: 1,
                        etag: etag1,
                    },
                    CompletedPartRef {
                        part_number: 2,
                        etag: etag2,
                    },
                ],
            )
            .await
            .expect("complete");
        assert_eq!(key, "big");
        assert!(etag.ends_with("-2"));

        let got = content(
            store
                .get_object("files", "big", None, &Conditions::default())
                .await
                .expect("get"),
        )
        .await;
        assert_eq!(&got.data[..], b"abcdefghij");

        // The upload is gone once completed.
        assert!(matches!(
            store.abort_multipart_upload("files", &upload_id).await,
            Err(ServiceError::NoSuchUpload(_))
        ));
    }

    #[tokio::test]
    async fn test_bulk_delete_reports_all_keys() {
        let store = store();
        store.create_bucket("files").await.expect("bucket");
        store
            .put_object("files", "a", Bytes::from_static(b"x"), None, Vec::new())
            .await
            .expect("put");
        let deleted = store
            .delete_objects("files", vec!["a".to_string(), "ghost".to_string()])
            .await
            .expect("bulk delete");
        assert_eq!(deleted, vec!["a".to_string(), "ghost".to_string()]);
    }
}
