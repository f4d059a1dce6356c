// ABOUTME: Tests for StreamHandle against a mocked Durable Streams server
// ABOUTME: Covers head/create/append happy paths and their error-status mappings

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use durable_streams::client::SharedClient;
use durable_streams::stream::StreamHandle;
use durable_streams::types::AppendValue;
use durable_streams_core::ErrorKind;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn head_returns_offset_and_content_type() {
    common::init_test_logging();
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/streams/s1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Stream-Next-Offset", "42")
                .insert_header("Content-Type", "application/json"),
        )
        .mount(&server)
        .await;

    let handle = StreamHandle::new(SharedClient::default(), format!("{}/streams/s1", server.uri()));
    let head = handle.head().await.unwrap();
    assert_eq!(head.offset.unwrap().as_str(), "42");
    assert_eq!(head.content_type.as_deref(), Some("application/json"));
}

#[tokio::test]
async fn head_404_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/streams/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let handle = StreamHandle::new(SharedClient::default(), format!("{}/streams/missing", server.uri()));
    let err = handle.head().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn create_stream_conflict_is_conflict_exists() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/streams/s1"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let handle = StreamHandle::new(SharedClient::default(), format!("{}/streams/s1", server.uri()));
    let err = handle
        .create_stream("application/json", None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConflictExists);
}

#[tokio::test]
async fn create_stream_rejects_conflicting_retention_controls() {
    let handle = StreamHandle::new(SharedClient::default(), "https://example.invalid/s1".to_owned());
    let err = handle
        .create_stream("application/json", Some(3600), Some("2026-01-01T00:00:00Z"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn append_returns_next_offset() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/streams/s1"))
        .respond_with(ResponseTemplate::new(200).insert_header("Stream-Next-Offset", "7"))
        .mount(&server)
        .await;

    let handle = StreamHandle::new(SharedClient::default(), format!("{}/streams/s1", server.uri()))
        .with_content_type("text/plain");
    let result = handle.append(AppendValue::text("hello"), None, None).await.unwrap();
    assert_eq!(result.next_offset.as_str(), "7");
    assert!(!result.duplicate);
}

#[tokio::test]
async fn append_rejects_bytes_on_a_json_stream() {
    let handle = StreamHandle::new(SharedClient::default(), "https://example.invalid/s1".to_owned());
    let err = handle
        .append(AppendValue::text("hello"), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);
}

#[tokio::test]
async fn append_sequence_conflict_is_conflict_seq() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/streams/s1"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let handle = StreamHandle::new(SharedClient::default(), format!("{}/streams/s1", server.uri()))
        .with_content_type("text/plain");
    let err = handle
        .append(AppendValue::text("hello"), Some("5".to_owned()), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConflictSeq);
}

#[tokio::test]
async fn concurrent_appends_are_coalesced_into_one_batcher_flush() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/streams/s1"))
        .respond_with(ResponseTemplate::new(200).insert_header("Stream-Next-Offset", "1"))
        .mount(&server)
        .await;

    let handle = std::sync::Arc::new(
        StreamHandle::new(SharedClient::default(), format!("{}/streams/s1", server.uri()))
            .with_content_type("text/plain"),
    );

    let a = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.append(AppendValue::text("a"), None, None).await })
    };
    let b = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.append(AppendValue::text("b"), None, None).await })
    };

    let (a, b) = tokio::join!(a, b);
    assert!(a.unwrap().is_ok());
    assert!(b.unwrap().is_ok());
}

#[tokio::test]
async fn json_append_sends_a_single_element_array() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/streams/s1"))
        .respond_with(ResponseTemplate::new(200).insert_header("Stream-Next-Offset", "1"))
        .mount(&server)
        .await;

    let handle = StreamHandle::new(SharedClient::default(), format!("{}/streams/s1", server.uri()));
    let result = handle
        .append(AppendValue::Json(serde_json::json!({"a": 1})), None, None)
        .await
        .unwrap();
    assert_eq!(result.next_offset.as_str(), "1");

    let requests = server.received_requests().await.unwrap();
    let body = requests.last().unwrap().body.clone();
    assert_eq!(body, br#"[{"a":1}]"#);
}
