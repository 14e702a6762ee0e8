// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP blob backend tests against a mock `/blobs/{key}` server.

use bytes::Bytes;
use weft_blob::{key_of, BlobStore, HttpStore};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn server_with_blob(content: &[u8]) -> (MockServer, weft_core::BlobKey) {
    let key = key_of(content);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/blobs/{key}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path(format!("/blobs/{key}")))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    (server, key)
}

// ---------------------------------------------------------------------------
// get / head
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_fetches_blob_body() {
    let (server, key) = server_with_blob(b"payload").await;
    let store = HttpStore::new(server.uri());

    let content = store.get(&key).await.unwrap();
    assert_eq!(content, Bytes::from_static(b"payload"));
    assert!(store.head(&key).await.unwrap());
}

#[tokio::test]
async fn get_miss_maps_404() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let store = HttpStore::new(server.uri());

    let err = store.get(&key_of(b"absent")).await.unwrap_err();
    assert!(err.is_miss());
}

// ---------------------------------------------------------------------------
// put: hash, head, upload exactly once
// ---------------------------------------------------------------------------

#[tokio::test]
async fn put_uploads_under_content_address() {
    let content = b"fresh content";
    let key = key_of(content);
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path(format!("/blobs/{key}")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/blobs/{key}")))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = HttpStore::new(server.uri());
    let returned = store.put(Bytes::from_static(content)).await.unwrap();
    assert_eq!(returned, key);
    server.verify().await;
}

#[tokio::test]
async fn put_skips_upload_when_present() {
    let (server, key) = server_with_blob(b"already there").await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let store = HttpStore::new(server.uri());
    let returned = store.put(Bytes::from_static(b"already there")).await.unwrap();
    assert_eq!(returned, key);
    server.verify().await;
}

// ---------------------------------------------------------------------------
// upload / download streaming round trip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upload_streams_file_and_download_recreates_it() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("out.txt");
    tokio::fs::write(&source, vec![b'x'; 50]).await.unwrap();
    let key = key_of(&vec![b'x'; 50]);

    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path(format!("/blobs/{key}")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/blobs/{key}")))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/blobs/{key}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 50]))
        .mount(&server)
        .await;

    let store = HttpStore::new(server.uri());
    let uploaded = store.upload(&source).await.unwrap();
    assert_eq!(uploaded, key);

    let restored = dir.path().join("nested/out.txt");
    store.download(&key, &restored).await.unwrap();
    assert_eq!(tokio::fs::read(&restored).await.unwrap(), vec![b'x'; 50]);
    server.verify().await;
}
