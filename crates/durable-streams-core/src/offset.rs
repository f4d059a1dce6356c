// ABOUTME: Opaque Offset/StreamCursor wire types and the LiveMode enum
// ABOUTME: The client never parses an Offset or StreamCursor; it only echoes them

use std::fmt;

use serde::{Deserialize, Serialize};

/// The distinguished offset meaning "from the beginning of the stream".
pub const OFFSET_BEGINNING: &str = "-1";

/// An opaque, totally ordered server-issued token delimiting a prefix of a stream.
///
/// The client never parses this value — it only echoes whatever the server sent
/// back in `Stream-Next-Offset` as the next request's `offset` query parameter.
/// Modeled as a distinct newtype (rather than a bare `String`) so that invariant is
/// enforced by the type system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Offset(String);

impl Offset {
    /// The offset meaning "from the beginning of the stream".
    #[must_use]
    pub fn beginning() -> Self {
        Self(OFFSET_BEGINNING.to_owned())
    }

    /// Wrap a server-issued offset string.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Borrow the raw wire value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Default for Offset {
    fn default() -> Self {
        Self::beginning()
    }
}

/// Opaque CDN-collapsing cursor, echoed back via the `cursor` query parameter when
/// a prior response provided one.
///
/// Kept as a distinct type from [`Offset`] despite the identical representation:
/// the two are never interchangeable on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamCursor(String);

impl StreamCursor {
    /// Wrap a server-issued cursor string.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Borrow the raw wire value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Continuation strategy after the initial catch-up read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LiveMode {
    /// `live=false` (implicit). Bounded consumption, stops at the first
    /// `up_to_date`.
    #[default]
    CatchUp,
    /// `auto`: behaves like `CatchUp` on the initial request but switches to
    /// `LongPoll` on continuation once caught up.
    Auto,
    /// `live=long-poll`. Continues indefinitely past `up_to_date`.
    LongPoll,
    /// `live=sse`. Continues indefinitely via Server-Sent Events.
    Sse,
}

impl LiveMode {
    /// The wire value for the `live` query parameter, or `None` when the mode adds
    /// no parameter (`CatchUp`, and `Auto` on the very first request).
    #[must_use]
    pub const fn query_value(self) -> Option<&'static str> {
        match self {
            Self::CatchUp | Self::Auto => None,
            Self::LongPoll => Some("long-poll"),
            Self::Sse => Some("sse"),
        }
    }

    /// Whether this mode keeps consuming past the first `up_to_date` boundary.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::LongPoll | Self::Sse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beginning_offset_is_minus_one() {
        assert_eq!(Offset::beginning().as_str(), "-1");
        assert_eq!(Offset::default().as_str(), "-1");
    }

    #[test]
    fn catch_up_and_initial_auto_add_no_query_param() {
        assert_eq!(LiveMode::CatchUp.query_value(), None);
        assert_eq!(LiveMode::Auto.query_value(), None);
        assert_eq!(LiveMode::LongPoll.query_value(), Some("long-poll"));
        assert_eq!(LiveMode::Sse.query_value(), Some("sse"));
    }

    #[test]
    fn only_long_poll_and_sse_are_live() {
        assert!(!LiveMode::CatchUp.is_live());
        assert!(!LiveMode::Auto.is_live());
        assert!(LiveMode::LongPoll.is_live());
        assert!(LiveMode::Sse.is_live());
    }
}
