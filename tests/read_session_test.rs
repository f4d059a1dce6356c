// ABOUTME: Tests for ReadSession's catch-up JSON/text iteration and consumption guard
// ABOUTME: Exercises the paged (non-SSE) path against a mocked Durable Streams server

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

use durable_streams::client::SharedClient;
use durable_streams::stream::StreamHandle;
use durable_streams_core::{ErrorKind, LiveMode};
use futures_util::StreamExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn catch_up_read_stops_at_up_to_date() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/streams/s1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Stream-Next-Offset", "3")
                .insert_header("Stream-Up-To-Date", "true")
                .set_body_raw(r#"[{"a":1},{"a":2}]"#, "application/json"),
        )
        .mount(&server)
        .await;

    let handle = StreamHandle::new(SharedClient::default(), format!("{}/streams/s1", server.uri()));
    let session = handle
        .stream(None, LiveMode::CatchUp, None, None)
        .await
        .unwrap();
    let values = session.read_json().await.unwrap();
    assert_eq!(values.len(), 2);
}

#[tokio::test]
async fn iter_json_flattens_pages_as_they_arrive() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/streams/s1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Stream-Next-Offset", "1")
                .insert_header("Stream-Up-To-Date", "true")
                .set_body_raw(r#"[{"a":1}]"#, "application/json"),
        )
        .mount(&server)
        .await;

    let handle = StreamHandle::new(SharedClient::default(), format!("{}/streams/s1", server.uri()));
    let session = handle
        .stream(None, LiveMode::CatchUp, None, None)
        .await
        .unwrap();
    let stream = session.iter_json();
    futures_util::pin_mut!(stream);
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first, serde_json::json!({"a": 1}));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn second_consumption_call_is_already_consumed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/streams/s1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Stream-Next-Offset", "0")
                .insert_header("Stream-Up-To-Date", "true")
                .set_body_raw("[]", "application/json"),
        )
        .mount(&server)
        .await;

    let handle = StreamHandle::new(SharedClient::default(), format!("{}/streams/s1", server.uri()));
    let session = handle
        .stream(None, LiveMode::CatchUp, None, None)
        .await
        .unwrap();
    session.read_json().await.unwrap();
    let err = session.read_text().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyConsumed);
}

#[tokio::test]
async fn read_all_rejected_on_long_poll_session() {
    let handle = StreamHandle::new(SharedClient::default(), "https://example.invalid/s1".to_owned());
    let session = handle
        .stream(None, LiveMode::LongPoll, None, None)
        .await
        .unwrap();
    let err = session.read_json().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SseReadAllNotSupported);
}
