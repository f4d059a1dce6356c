// ABOUTME: Wire-level constants for the Durable Streams protocol
// ABOUTME: Header names, query parameter names, and SSE-compatible content types

/// Response header carrying the next offset to resume reading from.
pub const STREAM_NEXT_OFFSET_HEADER: &str = "Stream-Next-Offset";
/// Response header carrying an opaque CDN-collapsing cursor.
pub const STREAM_CURSOR_HEADER: &str = "Stream-Cursor";
/// Response header whose mere presence means "caught up to the current end of
/// stream".
pub const STREAM_UP_TO_DATE_HEADER: &str = "Stream-Up-To-Date";
/// Response header whose value `"true"` means end-of-stream.
pub const STREAM_CLOSED_HEADER: &str = "Stream-Closed";
/// Optional response header describing SSE data encoding.
pub const STREAM_SSE_DATA_ENCODING_HEADER: &str = "Stream-SSE-Data-Encoding";

/// Request header: caller-supplied lexicographic append sequence.
pub const STREAM_SEQ_HEADER: &str = "Stream-Seq";
/// Request header: stream TTL in seconds (mutually exclusive with
/// `Stream-Expires-At`).
pub const STREAM_TTL_HEADER: &str = "Stream-TTL";
/// Request header: stream expiry as an RFC 3339 timestamp (mutually exclusive
/// with `Stream-TTL`).
pub const STREAM_EXPIRES_AT_HEADER: &str = "Stream-Expires-At";

/// Request header: stable idempotent-producer identity.
pub const PRODUCER_ID_HEADER: &str = "Producer-Id";
/// Request header: producer fencing generation.
pub const PRODUCER_EPOCH_HEADER: &str = "Producer-Epoch";
/// Request header: producer per-epoch monotone sequence number.
pub const PRODUCER_SEQ_HEADER: &str = "Producer-Seq";
/// Response header (on 409) naming the sequence the server expected next.
pub const PRODUCER_EXPECTED_SEQ_HEADER: &str = "Producer-Expected-Seq";
/// Response header (on 409) naming the sequence the server actually received.
pub const PRODUCER_RECEIVED_SEQ_HEADER: &str = "Producer-Received-Seq";

/// Query parameter: the offset to resume reading from.
pub const OFFSET_QUERY_PARAM: &str = "offset";
/// Query parameter: the live mode (`long-poll` or `sse`).
pub const LIVE_QUERY_PARAM: &str = "live";
/// Query parameter: an opaque CDN-collapsing cursor.
pub const CURSOR_QUERY_PARAM: &str = "cursor";

/// Content type used for all JSON streams; bodies are always a JSON array on GET.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Prefixes/values of a normalized content type that are compatible with SSE mode.
///
/// SSE is only valid for `text/*` or exactly `application/json`.
#[must_use]
pub fn is_sse_compatible_content_type(content_type: &str) -> bool {
    let normalized = normalize_content_type(content_type);
    normalized.starts_with("text/") || normalized == CONTENT_TYPE_JSON
}

/// Strip any `; charset=...`-style parameters and lowercase, e.g.
/// `"application/json; charset=utf-8"` -> `"application/json"`.
#[must_use]
pub fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Whether a (normalized) content type is exactly the JSON stream type.
#[must_use]
pub fn is_json_content_type(content_type: &str) -> bool {
    normalize_content_type(content_type) == CONTENT_TYPE_JSON
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_charset_suffix() {
        assert_eq!(
            normalize_content_type("application/json; charset=utf-8"),
            "application/json"
        );
        assert_eq!(normalize_content_type("TEXT/Plain"), "text/plain");
    }

    #[test]
    fn sse_compatible_text_and_json_only() {
        assert!(is_sse_compatible_content_type("text/plain"));
        assert!(is_sse_compatible_content_type("application/json"));
        assert!(!is_sse_compatible_content_type("application/octet-stream"));
        assert!(!is_sse_compatible_content_type(""));
    }

    #[test]
    fn json_content_type_detection() {
        assert!(is_json_content_type("application/json"));
        assert!(is_json_content_type("application/json; charset=utf-8"));
        assert!(!is_json_content_type("text/plain"));
    }
}
