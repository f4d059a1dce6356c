// ABOUTME: Parses Durable Streams response headers
// ABOUTME: Offset/Cursor/Up-To-Date/Closed/Content-Type are read, never defaulted

use durable_streams_core::constants::{
    STREAM_CLOSED_HEADER, STREAM_CURSOR_HEADER, STREAM_NEXT_OFFSET_HEADER,
    STREAM_SSE_DATA_ENCODING_HEADER, STREAM_UP_TO_DATE_HEADER,
};
use durable_streams_core::{Offset, StreamCursor};
use reqwest::header::HeaderMap;

/// Parsed stream metadata from a response's headers.
///
/// Missing headers are absent (`None`), never defaulted — a response that omits
/// `Stream-Next-Offset` is a protocol violation for its caller to detect, not
/// something this codec should paper over.
#[derive(Debug, Clone, Default)]
pub struct ResponseMetadata {
    /// `Stream-Next-Offset`, if present.
    pub next_offset: Option<Offset>,
    /// `Stream-Cursor`, if present.
    pub cursor: Option<StreamCursor>,
    /// Whether `Stream-Up-To-Date` was present (its value is irrelevant; presence
    /// alone means "caught up").
    pub up_to_date: bool,
    /// Whether `Stream-Closed: true` was present.
    pub closed: bool,
    /// `Content-Type`, if present.
    pub content_type: Option<String>,
    /// `Stream-SSE-Data-Encoding`, if present.
    pub sse_data_encoding: Option<String>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parse stream metadata from a response's headers.
///
/// `reqwest::header::HeaderMap` is already case-insensitive by key, so unlike the
/// source's `{k.lower(): v for k, v in headers.items()}` normalization, no explicit
/// lowercasing pass is needed here.
#[must_use]
pub fn parse_response_headers(headers: &HeaderMap) -> ResponseMetadata {
    ResponseMetadata {
        next_offset: header_str(headers, STREAM_NEXT_OFFSET_HEADER).map(Offset::new),
        cursor: header_str(headers, STREAM_CURSOR_HEADER).map(StreamCursor::new),
        up_to_date: headers.contains_key(STREAM_UP_TO_DATE_HEADER),
        closed: header_str(headers, STREAM_CLOSED_HEADER) == Some("true"),
        content_type: header_str(headers, reqwest::header::CONTENT_TYPE.as_str())
            .map(ToOwned::to_owned),
        sse_data_encoding: header_str(headers, STREAM_SSE_DATA_ENCODING_HEADER)
            .map(ToOwned::to_owned),
    }
}
