// ABOUTME: Incremental Server-Sent Events framer for data/control frame pairs
// ABOUTME: Carries its own UTF-8 decode state since chunks can split mid-codepoint

use durable_streams_core::{DurableStreamError, ErrorKind, Offset, StreamCursor};
use serde::Deserialize;

/// One parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A `data` event: the raw payload, already joined across multi-line `data:`
    /// fields with `\n`.
    Data {
        /// The event payload, as sent.
        data: String,
    },
    /// A `control` event: server-pushed stream metadata, sent instead of repeating
    /// it on every `data` event.
    Control {
        /// The offset to resume from after the events delivered so far.
        stream_next_offset: Offset,
        /// Opaque CDN-collapsing cursor, if provided.
        stream_cursor: Option<StreamCursor>,
        /// Whether the stream is caught up to its current end as of this control
        /// frame.
        up_to_date: bool,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ControlPayload {
    stream_next_offset: String,
    stream_cursor: Option<String>,
    #[serde(default)]
    up_to_date: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct PendingEvent {
    event_type: Option<String>,
    data_lines: Vec<String>,
}

impl PendingEvent {
    fn is_empty(&self) -> bool {
        self.event_type.is_none() && self.data_lines.is_empty()
    }
}

/// Incrementally parses an SSE byte stream into [`SseEvent`]s.
///
/// Rust's standard library has no streaming UTF-8 decoder, so chunk boundaries that
/// split a multi-byte codepoint are handled by carrying any trailing incomplete
/// bytes over to the next [`feed`](Self::feed) call, rather than by decoding
/// lossily.
#[derive(Debug, Default)]
pub struct SseParser {
    byte_carry: Vec<u8>,
    line_carry: String,
    pending: PendingEvent,
}

impl SseParser {
    /// Construct an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of bytes from the response body, returning any complete
    /// events found within it. Incomplete trailing data (a partial line, or a
    /// partial UTF-8 codepoint) is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::ParseError`] if a `control` event's data is not valid
    /// JSON, or lacks `stream_next_offset`.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, DurableStreamError> {
        self.byte_carry.extend_from_slice(chunk);

        let valid_len = match std::str::from_utf8(&self.byte_carry) {
            Ok(text) => text.len(),
            Err(e) => match e.error_len() {
                // Trailing bytes look like the start of a codepoint that just
                // hasn't arrived yet; keep them for next time.
                None => e.valid_up_to(),
                // A genuine, complete invalid sequence: not recoverable by waiting.
                Some(_) => {
                    return Err(DurableStreamError::new(
                        ErrorKind::ParseError,
                        "SSE body contained invalid UTF-8".to_owned(),
                    ))
                }
            },
        };

        let text = std::str::from_utf8(&self.byte_carry[..valid_len])
            .unwrap_or_default()
            .to_owned();
        self.byte_carry.drain(..valid_len);

        self.line_carry.push_str(&text);
        self.drain_lines()
    }

    /// Flush any buffered-but-terminated event once the body is exhausted. Callers
    /// should call this after the final `feed` to recover an event whose trailing
    /// blank line the server omitted.
    ///
    /// # Errors
    ///
    /// Same as [`feed`](Self::feed).
    pub fn finish(&mut self) -> Result<Vec<SseEvent>, DurableStreamError> {
        if !self.byte_carry.is_empty() {
            return Err(DurableStreamError::new(
                ErrorKind::ParseError,
                "SSE body ended mid-codepoint".to_owned(),
            ));
        }
        let mut events = Vec::new();
        if !self.pending.is_empty() {
            if let Some(event) = Self::finalize(std::mem::take(&mut self.pending))? {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn drain_lines(&mut self) -> Result<Vec<SseEvent>, DurableStreamError> {
        let mut events = Vec::new();
        loop {
            let Some(newline_pos) = self.line_carry.find('\n') else {
                break;
            };
            let line = self.line_carry[..newline_pos].to_owned();
            self.line_carry.drain(..=newline_pos);
            let line = line.strip_suffix('\r').unwrap_or(&line).to_owned();

            if line.is_empty() {
                if !self.pending.is_empty() {
                    if let Some(event) = Self::finalize(std::mem::take(&mut self.pending))? {
                        events.push(event);
                    }
                }
                continue;
            }

            if let Some(rest) = line.strip_prefix("event:") {
                self.pending.event_type = Some(rest.trim_start().to_owned());
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.pending.data_lines.push(rest.trim_start().to_owned());
            }
            // Other field names (`id:`, `retry:`, comments starting with `:`) carry
            // no meaning for this protocol and are ignored.
        }
        Ok(events)
    }

    fn finalize(pending: PendingEvent) -> Result<Option<SseEvent>, DurableStreamError> {
        let data = pending.data_lines.join("\n");
        match pending.event_type.as_deref() {
            Some("control") => {
                let payload: ControlPayload = serde_json::from_str(&data).map_err(|e| {
                    DurableStreamError::new(
                        ErrorKind::ParseError,
                        "control event data was not valid JSON".to_owned(),
                    )
                    .with_source(e)
                })?;
                Ok(Some(SseEvent::Control {
                    stream_next_offset: Offset::new(payload.stream_next_offset),
                    stream_cursor: payload.stream_cursor.map(StreamCursor::new),
                    up_to_date: payload.up_to_date,
                }))
            }
            _ => {
                if data.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(SseEvent::Data { data }))
                }
            }
        }
    }
}
