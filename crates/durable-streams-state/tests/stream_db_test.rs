// ABOUTME: Tests for StreamDb materialization against a mocked change-event stream
// ABOUTME: Covers insert/update/upsert application and the reserved-name/schema guards

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

use durable_streams::client::SharedClient;
use durable_streams::stream::StreamHandle;
use durable_streams_core::ErrorKind;
use durable_streams_state::schema::{CollectionDefinition, StateSchema};
use durable_streams_state::stream_db::StreamDb;
use serde::Deserialize;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Deserialize, PartialEq)]
struct User {
    name: String,
}

fn users_schema() -> StateSchema {
    let users = CollectionDefinition::<User>::new("users").unwrap();
    StateSchema::builder().with_collection(&users).unwrap().build()
}

#[tokio::test]
async fn catch_up_batch_is_materialized_into_the_collection() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/streams/changes"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Stream-Next-Offset", "2")
                .insert_header("Stream-Up-To-Date", "true")
                .set_body_raw(
                    r#"[
                        {"type":"users","key":"u1","value":{"name":"Ada"},"headers":{"operation":"insert"}},
                        {"type":"users","key":"u2","value":{"name":"Lin"},"headers":{"operation":"insert"}}
                    ]"#,
                    "application/json",
                ),
        )
        .mount(&server)
        .await;

    let handle = StreamHandle::new(SharedClient::default(), format!("{}/streams/changes", server.uri()));
    let db = StreamDb::open(handle, users_schema()).await.unwrap();
    db.wait_until_caught_up().await;

    let view = db.collection::<User>("users").unwrap();
    assert_eq!(view.len().await, 2);
    assert_eq!(view.get("u1").await.unwrap(), Some(User { name: "Ada".to_owned() }));
}

#[tokio::test]
async fn pending_changes_are_not_visible_before_up_to_date() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/streams/changes"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Stream-Next-Offset", "1")
                .set_body_raw(
                    r#"[{"type":"users","key":"u1","value":{"name":"Ada"},"headers":{"operation":"insert"}}]"#,
                    "application/json",
                ),
        )
        .mount(&server)
        .await;

    let handle = StreamHandle::new(SharedClient::default(), format!("{}/streams/changes", server.uri()));
    let db = StreamDb::open(handle, users_schema()).await.unwrap();

    // No `Stream-Up-To-Date` header: the page never commits, so the row never
    // becomes visible and `wait_until_caught_up` never returns. Give the runner
    // time to have staged (but not committed) the row, then check directly.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let view = db.collection::<User>("users").unwrap();
    assert_eq!(view.len().await, 0);
}

#[tokio::test]
async fn reset_control_event_clears_the_collection() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/streams/changes"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Stream-Next-Offset", "2")
                .insert_header("Stream-Up-To-Date", "true")
                .set_body_raw(
                    r#"[
                        {"type":"users","key":"u1","value":{"name":"Ada"},"headers":{"operation":"insert"}},
                        {"headers":{"control":"reset"}}
                    ]"#,
                    "application/json",
                ),
        )
        .mount(&server)
        .await;

    let handle = StreamHandle::new(SharedClient::default(), format!("{}/streams/changes", server.uri()));
    let db = StreamDb::open(handle, users_schema()).await.unwrap();
    db.wait_until_caught_up().await;

    let view = db.collection::<User>("users").unwrap();
    assert_eq!(view.len().await, 0);
}

#[tokio::test]
async fn empty_stream_still_signals_caught_up() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/streams/changes"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Stream-Next-Offset", "0")
                .insert_header("Stream-Up-To-Date", "true")
                .set_body_raw("[]", "application/json"),
        )
        .mount(&server)
        .await;

    let handle = StreamHandle::new(SharedClient::default(), format!("{}/streams/changes", server.uri()));
    let db = StreamDb::open(handle, users_schema()).await.unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(1), db.wait_until_caught_up())
        .await
        .expect("an empty but caught-up stream must still signal readiness");
}

#[tokio::test]
async fn unknown_collection_lookup_is_invalid_argument() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/streams/changes"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Stream-Next-Offset", "0")
                .insert_header("Stream-Up-To-Date", "true")
                .set_body_raw("[]", "application/json"),
        )
        .mount(&server)
        .await;

    let schema = StateSchema::builder().build();
    let handle = StreamHandle::new(SharedClient::default(), format!("{}/streams/changes", server.uri()));
    let db = StreamDb::open(handle, schema).await.unwrap();
    db.wait_until_caught_up().await;

    let err = db.collection::<User>("users").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn change_event_naming_an_undeclared_collection_is_silently_dropped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/streams/changes"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Stream-Next-Offset", "1")
                .insert_header("Stream-Up-To-Date", "true")
                .set_body_raw(
                    r#"[{"type":"ghosts","key":"g1","value":{"name":"boo"},"headers":{"operation":"insert"}}]"#,
                    "application/json",
                ),
        )
        .mount(&server)
        .await;

    let handle = StreamHandle::new(SharedClient::default(), format!("{}/streams/changes", server.uri()));
    let db = StreamDb::open(handle, users_schema()).await.unwrap();
    db.wait_until_caught_up().await;

    assert_eq!(db.collection::<User>("users").unwrap().len().await, 0);
}

#[test]
fn reserved_names_are_rejected_before_any_stream_is_opened() {
    let err = CollectionDefinition::<User>::new("preload").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}
