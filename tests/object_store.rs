//! End-to-end object store behavior, including the multipart ETag
//! contract and spy observation of object lifecycle events.

mod common;

use std::time::Duration;

use bytes::Bytes;
use md5::{Digest, Md5};
use serde_json::json;

use minicloud::store::{CompletedPartRef, Conditions, GetObjectResult};
use minicloud::{SpyFilter, SpyStatus};

use common::test_app;

#[tokio::test]
async fn test_put_get_etag_and_content_length() {
    let app = test_app();
    app.store.create_bucket("bucket").await.expect("bucket");
    let payload = b"some object bytes";
    let etag = app
        .store
        .put_object(
            "bucket",
            "key",
            Bytes::from_static(payload),
            None,
            Vec::new(),
        )
        .await
        .expect("put");

    let mut hasher = Md5::new();
    hasher.update(payload);
    assert_eq!(etag, hex::encode(hasher.finalize()));

    match app
        .store
        .get_object("bucket", "key", None, &Conditions::default())
        .await
        .expect("get")
    {
        GetObjectResult::Content(content) => {
            assert_eq!(&content.data[..], payload);
            assert_eq!(content.total_size, payload.len() as u64);
            assert_eq!(content.etag, etag);
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn test_multipart_etag_contract() {
    let app = test_app();
    app.store.create_bucket("b").await.expect("bucket");
    let upload_id = app
        .store
        .create_multipart_upload("b", "k", None, Vec::new())
        .await
        .expect("initiate");

    let etag1 = app
        .store
        .upload_part("b", &upload_id, 1, Bytes::from_static(b"abcde"))
        .await
        .expect("part 1");
    assert_eq!(etag1, "ab56b4d92b40713acc5af89985d4b786");
    let etag2 = app
        .store
        .upload_part("b", &upload_id, 2, Bytes::from_static(b"fghij"))
        .await
        .expect("part 2");
    assert_eq!(etag2, "57c48dcd266eadf089325affe125151f");

    let (_, etag) = app
        .store
        .complete_multipart_upload(
            "b",
            &upload_id,
            &[
                CompletedPartRef {
                    part_number: 1,
                    etag: etag1.clone(),
                },
                CompletedPartRef {
                    part_number: 2,
                    etag: etag2.clone(),
                },
            ],
        )
        .await
        .expect("complete");

    let mut digests = Vec::new();
    digests.extend_from_slice(&hex::decode(&etag1).expect("hex"));
    digests.extend_from_slice(&hex::decode(&etag2).expect("hex"));
    let mut hasher = Md5::new();
    hasher.update(&digests);
    assert_eq!(etag, format!("{}-2", hex::encode(hasher.finalize())));

    match app
        .store
        .get_object("b", "k", None, &Conditions::default())
        .await
        .expect("get")
    {
        GetObjectResult::Content(content) => {
            assert_eq!(&content.data[..], b"abcdefghij");
            assert_eq!(content.total_size, 10);
            assert_eq!(content.etag, etag);
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn test_object_lifecycle_spy_events() {
    let app = test_app();
    app.store.create_bucket("watched").await.expect("bucket");
    app.store
        .put_object("watched", "k", Bytes::from_static(b"v"), None, Vec::new())
        .await
        .expect("put");
    app.store
        .get_object("watched", "k", None, &Conditions::default())
        .await
        .expect("get");
    app.store
        .copy_object("watched", "k", "watched", "k2")
        .await
        .expect("copy");
    app.store.delete_object("watched", "k").await.expect("delete");

    for (key, status) in [
        ("k", SpyStatus::Uploaded),
        ("k", SpyStatus::Downloaded),
        ("k2", SpyStatus::Copied),
        ("k", SpyStatus::Deleted),
    ] {
        app.spy
            .wait_for_message(
                SpyFilter::partial(json!({"service": "s3", "bucket": "watched", "key": key})),
                Some(status),
                Some(Duration::from_millis(200)),
            )
            .await
            .unwrap_or_else(|e| panic!("missing {status:?} event for {key}: {e}"));
    }
}

#[tokio::test]
async fn test_spy_ring_keeps_newest_events() {
    let app = test_app();
    app.store.create_bucket("noisy").await.expect("bucket");
    // Default capacity is 100; overflow it.
    for i in 0..120 {
        app.store
            .put_object(
                "noisy",
                &format!("k{i:03}"),
                Bytes::from_static(b"x"),
                None,
                Vec::new(),
            )
            .await
            .expect("put");
    }
    let events = app.spy.events().await;
    assert_eq!(events.len(), 100);
    match &events[0] {
        minicloud::SpyEvent::S3 { key, .. } => assert_eq!(key, "k020"),
        other => panic!("unexpected event {other:?}"),
    }
}
