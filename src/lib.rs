// ABOUTME: Async client library for the Durable Streams HTTP protocol
// ABOUTME: Catch-up/live reads, idempotent producers, and append batching
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

#![deny(unsafe_code)]

//! # Durable Streams
//!
//! Client for the Durable Streams protocol: an HTTP-native append-only log where
//! each stream is identified by a URL and exposes catch-up reads, live tailing
//! (long-poll or Server-Sent Events), ordered appends with optional writer
//! sequencing, and an idempotent producer pattern providing exactly-once write
//! semantics across retries, failover, and zombie producers.
//!
//! ## Modules
//!
//! - [`client`] — shared `reqwest::Client` construction.
//! - [`codec`] — response header parsing (`Stream-Next-Offset`, `Stream-Cursor`, ...).
//! - [`sse`] — incremental Server-Sent Events framer.
//! - [`params`] — static/dynamic header and query-param resolution.
//! - [`session`] — the one-shot read session and its iterator modes.
//! - [`stream`] — URL-scoped stream handle (`head`/`create`/`delete`/`append`) and
//!   the synchronous append batcher.
//! - [`producer`] — the idempotent producer.
//! - [`types`] — shared result/event types.
//!
//! ## Example
//!
//! ```no_run
//! use durable_streams::{client::SharedClient, stream::StreamHandle};
//! use durable_streams_core::LiveMode;
//! use futures_util::StreamExt;
//!
//! # async fn example() -> Result<(), durable_streams_core::DurableStreamError> {
//! use durable_streams::types::AppendValue;
//!
//! let client = SharedClient::new(Default::default());
//! let handle = StreamHandle::new(client, "https://example.com/streams/s1".to_owned())
//!     .with_content_type("text/plain");
//!
//! handle.append(AppendValue::text("chunk1"), None, None).await?;
//!
//! let mut session = handle.stream(None, LiveMode::CatchUp, None, None).await?;
//! let mut events = session.iter_text();
//! while let Some(chunk) = events.next().await {
//!     let _ = chunk?;
//! }
//! # Ok(())
//! # }
//! ```

/// Shared `reqwest::Client` construction and default timeouts.
pub mod client;

/// Offset/header codec: parses response headers into [`codec::ResponseMetadata`].
pub mod codec;

/// Incremental Server-Sent Events framer.
pub mod sse;

/// Static/dynamic header and query-param resolution.
pub mod params;

/// The one-shot read session and its iterator modes.
pub mod session;

/// The stream handle and its synchronous append batcher.
pub mod stream;

/// The idempotent producer.
pub mod producer;

/// Shared result/event types (`StreamEvent`, `HeadResult`, `AppendResult`).
pub mod types;

pub use durable_streams_core::{DurableStreamError, ErrorKind, LiveMode, Offset, StreamCursor};
