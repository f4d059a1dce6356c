// ABOUTME: Tagged error taxonomy for the Durable Streams protocol
// ABOUTME: Replaces the source's exception hierarchy with one enum discriminated by kind

use std::error::Error as StdError;
use std::fmt;

/// Discriminant for every error this library can surface.
///
/// Each variant documents the HTTP status it corresponds to, where applicable.
/// `#[non_exhaustive]` because the server may introduce new codes that should not
/// be a breaking change for callers who `match` on this enum.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 404. The stream does not exist.
    NotFound,
    /// 409 on `create_stream` when an existing stream has a different configuration.
    ConflictExists,
    /// 409 on `append` when `Stream-Seq` is not greater than the last appended seq.
    ConflictSeq,
    /// 403 on a producer append when the server has moved to a newer epoch.
    StaleEpoch,
    /// 409 on a producer append when `expected_seq >= our_seq` (not recoverable by
    /// waiting).
    SequenceGap,
    /// 400. Malformed request (headers, body, or producer sequencing).
    BadRequest,
    /// 410. The requested offset precedes the earliest retained position.
    RetentionGone,
    /// 429.
    RateLimited,
    /// 503.
    Busy,
    /// 401.
    Unauthorized,
    /// 403 (not a stale-epoch response).
    Forbidden,
    /// Any other non-2xx status not covered by a more specific variant.
    HttpError,
    /// SSE control frame body was not valid JSON, or some other malformed wire
    /// framing was encountered.
    ParseError,
    /// SSE was requested for a content type that isn't `text/*` or
    /// `application/json`.
    SseNotSupported,
    /// Raw byte iteration was requested on an SSE-mode session.
    SseBytesNotSupported,
    /// A read-all method was called on an SSE-mode session.
    SseReadAllNotSupported,
    /// A second consumption method was called on a read session.
    AlreadyConsumed,
    /// `append` (or another operation) was called after `close()`.
    AlreadyClosed,
    /// Connection-level failure (DNS, refused, reset, TLS).
    NetworkError,
    /// Request exceeded its configured timeout.
    Timeout,
    /// Invalid constructor/argument values (e.g. a zero `max_in_flight`).
    InvalidArgument,
    /// A protocol invariant was violated by the server (e.g. a success response
    /// missing `Stream-Next-Offset`).
    InternalError,
}

impl ErrorKind {
    /// Returns the error code string that server responses and documentation use
    /// for this kind (e.g. `"CONFLICT_SEQ"`).
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::ConflictExists => "CONFLICT_EXISTS",
            Self::ConflictSeq => "CONFLICT_SEQ",
            Self::StaleEpoch => "STALE_EPOCH",
            Self::SequenceGap => "SEQUENCE_GAP",
            Self::BadRequest => "BAD_REQUEST",
            Self::RetentionGone => "RETENTION_GONE",
            Self::RateLimited => "RATE_LIMITED",
            Self::Busy => "BUSY",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::HttpError => "HTTP_ERROR",
            Self::ParseError => "PARSE_ERROR",
            Self::SseNotSupported => "SSE_NOT_SUPPORTED",
            Self::SseBytesNotSupported => "SSE_BYTES_NOT_SUPPORTED",
            Self::SseReadAllNotSupported => "SSE_READ_ALL_NOT_SUPPORTED",
            Self::AlreadyConsumed => "ALREADY_CONSUMED",
            Self::AlreadyClosed => "ALREADY_CLOSED",
            Self::NetworkError => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// A single error type for every failure this library can produce.
///
/// Carries a [`ErrorKind`] discriminant plus the protocol-level context (`status`,
/// `code`, `details`) that the original per-exception-type hierarchy spread across
/// subclasses. Matching on `.kind()` replaces matching on exception type.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct DurableStreamError {
    kind: ErrorKind,
    message: String,
    status: Option<u16>,
    code: Option<&'static str>,
    details: Option<serde_json::Value>,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl DurableStreamError {
    /// Build an error of the given kind with a message. `status`/`code`/`details`
    /// default to unset; use the `with_*` builders to attach them.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            code: Some(kind.code()),
            details: None,
            source: None,
        }
    }

    /// Attach the HTTP status code that produced this error.
    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach response-body details (raw JSON or text-as-JSON-string).
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attach an underlying error (e.g. a `reqwest::Error` or `serde_json::Error`).
    #[must_use]
    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The error kind, for `match`-based dispatch.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The HTTP status that produced this error, if any.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    /// The machine-readable error code (e.g. `"CONFLICT_SEQ"`).
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        self.code
    }

    /// Response-body details attached to this error, if any.
    #[must_use]
    pub const fn details(&self) -> Option<&serde_json::Value> {
        self.details.as_ref()
    }

    /// Build the appropriate error for a non-2xx HTTP status, mirroring the
    /// source's `error_from_status()`. `operation` disambiguates 409 between
    /// `create_stream` (`CONFLICT_EXISTS`) and `append` (`CONFLICT_SEQ`).
    #[must_use]
    pub fn from_status(
        status: u16,
        url: &str,
        details: Option<serde_json::Value>,
        operation: Operation,
    ) -> Self {
        let err = |kind: ErrorKind, message: String| {
            let mut e = Self::new(kind, message).with_status(status);
            if let Some(d) = details.clone() {
                e = e.with_details(d);
            }
            e
        };

        match status {
            400 => err(ErrorKind::BadRequest, format!("Bad request: {url}")),
            401 => err(ErrorKind::Unauthorized, format!("Unauthorized: {url}")),
            403 => err(ErrorKind::Forbidden, format!("Forbidden: {url}")),
            404 => err(ErrorKind::NotFound, format!("Stream not found: {url}")),
            409 if matches!(operation, Operation::Create) => err(
                ErrorKind::ConflictExists,
                format!("Stream already exists: {url}"),
            ),
            409 => err(
                ErrorKind::ConflictSeq,
                "Sequence conflict: seq is lower than or equal to last appended".to_owned(),
            ),
            410 => err(
                ErrorKind::RetentionGone,
                "Offset is before the earliest retained position".to_owned(),
            ),
            429 => err(ErrorKind::RateLimited, format!("Rate limited: {url}")),
            503 => err(
                ErrorKind::Busy,
                format!("Service unavailable: {url}"),
            ),
            other => err(
                ErrorKind::HttpError,
                format!("HTTP error {other} at {url}"),
            ),
        }
    }

    /// Build an equivalent error for fanning one outcome out to several waiters
    /// (e.g. every message in a flushed append batch). `source` is dropped since
    /// it isn't `Clone`; `kind`/`message`/`status`/`code`/`details` are preserved.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            status: self.status,
            code: self.code,
            details: self.details.clone(),
            source: None,
        }
    }

    /// The `ALREADY_CONSUMED` error, naming both the originally-consuming method
    /// and the one that was just attempted.
    #[must_use]
    pub fn already_consumed(attempted_method: &str, consumed_by: &str) -> Self {
        Self::new(
            ErrorKind::AlreadyConsumed,
            format!(
                "Cannot call {attempted_method}() - stream was already consumed via {consumed_by}()"
            ),
        )
    }
}

/// Disambiguates the 409 status for [`DurableStreamError::from_status`]: a
/// `create_stream` conflict means "exists with different config"; any other
/// operation's 409 means a sequence regression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// `create_stream`.
    Create,
    /// Any other operation (`append`, `head`, `delete`, `stream`).
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_status_404_is_not_found() {
        let err = DurableStreamError::from_status(404, "https://x/s", None, Operation::Other);
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.status(), Some(404));
    }

    #[test]
    fn from_status_409_disambiguates_create_vs_append() {
        let create = DurableStreamError::from_status(409, "https://x/s", None, Operation::Create);
        assert_eq!(create.kind(), ErrorKind::ConflictExists);

        let append = DurableStreamError::from_status(409, "https://x/s", None, Operation::Other);
        assert_eq!(append.kind(), ErrorKind::ConflictSeq);
    }

    #[test]
    fn already_consumed_names_both_methods() {
        let err = DurableStreamError::already_consumed("iter_text", "iter_json");
        assert!(err.to_string().contains("iter_text"));
        assert!(err.to_string().contains("iter_json"));
        assert_eq!(err.kind(), ErrorKind::AlreadyConsumed);
    }
}
