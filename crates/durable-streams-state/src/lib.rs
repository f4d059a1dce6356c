// ABOUTME: StreamDB — materializes a JSON change-event stream into typed collections
// ABOUTME: Built on top of the durable-streams read session; read-only from a caller's view

#![deny(unsafe_code)]

//! Typed in-memory collections kept current by consuming a Durable Streams
//! change-event stream.
//!
//! ```no_run
//! use durable_streams::client::SharedClient;
//! use durable_streams::stream::StreamHandle;
//! use durable_streams_state::schema::{CollectionDefinition, StateSchema};
//! use durable_streams_state::stream_db::StreamDb;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct User {
//!     name: String,
//! }
//!
//! # async fn example() -> Result<(), durable_streams_core::DurableStreamError> {
//! let users = CollectionDefinition::<User>::new("users")?;
//! let schema = StateSchema::builder().with_collection(&users)?.build();
//!
//! let client = SharedClient::new(Default::default());
//! let handle = StreamHandle::new(client, "https://example.com/streams/changes".to_owned());
//! let db = StreamDb::open(handle, schema).await?;
//! db.wait_until_caught_up().await;
//!
//! let view = db.collection::<User>("users")?;
//! let _ = view.get("u1").await?;
//! # Ok(())
//! # }
//! ```

/// Collection schema declaration and the change/control-event wire shape.
pub mod schema;

/// Per-collection staging, upsert promotion, and atomic batch application.
pub mod dispatcher;

/// `StreamDb` and its background session-runner task.
pub mod stream_db;
