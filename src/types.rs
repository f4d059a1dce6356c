// ABOUTME: Shared result and event types returned from stream operations
// ABOUTME: StreamEvent, HeadResult, AppendResult, and the on_error patch type

use durable_streams_core::{Offset, StreamCursor};

/// A single item yielded by [`crate::session::ReadSession::iter_events`].
///
/// `data` is rendered in bytes / text / flattened JSON / JSON batch depending on
/// which iterator produced it.
#[derive(Debug, Clone)]
pub struct StreamEvent<T> {
    /// The event payload.
    pub data: T,
    /// The offset to resume from after this event.
    pub next_offset: Offset,
    /// Whether this event represents the current end of stream.
    pub up_to_date: bool,
    /// Optional CDN-collapsing cursor, if the server provided one.
    pub cursor: Option<StreamCursor>,
}

/// Result of a `head` operation. Existence is implied: a missing stream surfaces
/// as `Err(..NotFound..)` rather than an `exists: false` field.
#[derive(Debug, Clone)]
pub struct HeadResult {
    /// The stream's content type, if advertised.
    pub content_type: Option<String>,
    /// The tail offset (next offset after the current end of stream).
    pub offset: Option<Offset>,
    /// `ETag` for cache validation, if advertised.
    pub etag: Option<String>,
    /// `Cache-Control` header value, if advertised.
    pub cache_control: Option<String>,
}

/// Result of an `append` operation.
#[derive(Debug, Clone)]
pub struct AppendResult {
    /// The new tail offset after the append.
    pub next_offset: Offset,
    /// True when an idempotent producer detected this batch as a duplicate
    /// (the server returned 204 rather than 200).
    pub duplicate: bool,
}

/// Patch returned by an `on_error` hook: header/param overrides to merge into the
/// retried request, and to capture for every subsequent `fetch_next` call on the
/// same session.
#[derive(Debug, Clone, Default)]
pub struct HeaderParamPatch {
    /// Header overrides to merge in.
    pub headers: std::collections::HashMap<String, String>,
    /// Query-param overrides to merge in.
    pub params: std::collections::HashMap<String, String>,
}

/// A value handed to [`crate::stream::StreamHandle::append`] or
/// [`crate::producer::IdempotentProducer::append`], before batch encoding.
///
/// JSON streams only accept [`AppendValue::Json`]; non-JSON streams only accept
/// [`AppendValue::Bytes`]. Mixing kinds, or sending the wrong kind for the
/// stream's content type, is a client-side `BAD_REQUEST`.
#[derive(Debug, Clone)]
pub enum AppendValue {
    /// A native JSON value, to be carried as one element of the batch's JSON
    /// array body.
    Json(serde_json::Value),
    /// Raw bytes (or UTF-8 text), concatenated verbatim into the batch body.
    Bytes(Vec<u8>),
}

impl AppendValue {
    /// Build a [`AppendValue::Bytes`] from UTF-8 text.
    pub fn text(value: impl Into<String>) -> Self {
        Self::Bytes(value.into().into_bytes())
    }

    /// Approximate encoded size, used only to decide when a pending batch has
    /// crossed `max_batch_bytes`.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Json(value) => serde_json::to_vec(value).map(|b| b.len()).unwrap_or(0),
            Self::Bytes(bytes) => bytes.len(),
        }
    }
}
