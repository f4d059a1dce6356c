// ABOUTME: One-shot read session and its iterator modes, covering catch-up paging,
// ABOUTME: long-poll, and SSE. A session may be consumed by exactly one iter_*/read_* method

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_stream::try_stream;
use bytes::Bytes;
use durable_streams_core::constants::{
    is_sse_compatible_content_type, CURSOR_QUERY_PARAM, LIVE_QUERY_PARAM, OFFSET_QUERY_PARAM,
};
use durable_streams_core::{DurableStreamError, ErrorKind, LiveMode, Offset, StreamCursor};
use futures_util::{Stream, StreamExt};

use crate::client::SharedClient;
use crate::codec::{parse_response_headers, ResponseMetadata};
use crate::params::ParamSet;
use crate::sse::{SseEvent, SseParser};
use crate::types::{HeaderParamPatch, StreamEvent};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Hook invoked when a page fetch fails. Returning `Some(patch)` retries once with
/// the patch merged into the session's headers/params, sticking for every later
/// request on the same session.
pub type OnErrorHook =
    Arc<dyn Fn(&DurableStreamError) -> BoxFuture<'static, Option<HeaderParamPatch>> + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct CursorState {
    offset: Offset,
    cursor: Option<StreamCursor>,
    /// Set once a response's `Stream-Up-To-Date` header has been observed under a
    /// non-live mode, so the loop stops instead of polling again.
    reached_up_to_date: bool,
}

/// A one-shot consumer of a stream's response. Obtained from
/// [`crate::stream::StreamHandle::stream`].
///
/// Exactly one of the `iter_*`/`read_*` methods may be called; calling a second one
/// returns [`ErrorKind::AlreadyConsumed`] naming both methods.
pub struct ReadSession {
    client: SharedClient,
    url: String,
    params: Mutex<ParamSet>,
    live: LiveMode,
    on_error: Option<OnErrorHook>,
    state: Mutex<CursorState>,
    consumed_by: Mutex<Option<&'static str>>,
    closed: AtomicBool,
}

impl ReadSession {
    #[must_use]
    pub(crate) fn new(
        client: SharedClient,
        url: String,
        params: ParamSet,
        live: LiveMode,
        offset: Offset,
        cursor: Option<StreamCursor>,
        on_error: Option<OnErrorHook>,
    ) -> Self {
        Self {
            client,
            url,
            params: Mutex::new(params),
            live,
            on_error,
            state: Mutex::new(CursorState {
                offset,
                cursor,
                reached_up_to_date: false,
            }),
            consumed_by: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn mark_consumed(&self, method: &'static str) -> Result<(), DurableStreamError> {
        let mut guard = self.consumed_by.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = *guard {
            return Err(DurableStreamError::already_consumed(method, existing));
        }
        *guard = Some(method);
        Ok(())
    }

    fn require_not_sse(&self, method: &'static str) -> Result<(), DurableStreamError> {
        if self.live == LiveMode::Sse {
            return Err(DurableStreamError::new(
                ErrorKind::SseBytesNotSupported,
                format!("{method}() is not supported in SSE mode"),
            ));
        }
        Ok(())
    }

    fn require_not_live(&self, method: &'static str) -> Result<(), DurableStreamError> {
        if self.live.is_live() {
            return Err(DurableStreamError::new(
                ErrorKind::SseReadAllNotSupported,
                format!("{method}() cannot be used with a live (long-poll/sse) session"),
            ));
        }
        Ok(())
    }

    /// Close the session early, stopping any in-progress iterator on its next poll.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Merge a patch into this session's params, sticking for every later request
    /// (the immediate retry and every subsequent `fetch_next`-style continuation).
    fn apply_patch(&self, patch: HeaderParamPatch) {
        let mut params = self.params.lock().unwrap_or_else(|e| e.into_inner());
        params.apply_patch(patch);
    }

    async fn fetch_page(&self) -> Result<(Bytes, ResponseMetadata), DurableStreamError> {
        let attempt = self.fetch_page_once().await;
        match attempt {
            Ok(ok) => Ok(ok),
            Err(err) => {
                if let Some(hook) = &self.on_error {
                    if let Some(patch) = hook(&err).await {
                        tracing::debug!(url = %self.url, error = %err, "retrying page fetch after on_error patch");
                        self.apply_patch(patch);
                        return self.fetch_page_once().await;
                    }
                }
                Err(err)
            }
        }
    }

    async fn fetch_page_once(&self) -> Result<(Bytes, ResponseMetadata), DurableStreamError> {
        let params = self.params.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let (headers, mut query) = params.resolve().await;
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner()).clone();

        query.insert(OFFSET_QUERY_PARAM.to_owned(), state.offset.as_str().to_owned());
        if let Some(live) = self.live.query_value() {
            query.insert(LIVE_QUERY_PARAM.to_owned(), live.to_owned());
        }
        if let Some(cursor) = &state.cursor {
            query.insert(CURSOR_QUERY_PARAM.to_owned(), cursor.as_str().to_owned());
        }

        let mut request = self.client.get().get(&self.url).query(&query);
        for (name, value) in &headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            let kind = if e.is_timeout() {
                ErrorKind::Timeout
            } else {
                ErrorKind::NetworkError
            };
            DurableStreamError::new(kind, format!("request to {} failed", self.url)).with_source(e)
        })?;

        let status = response.status();
        let meta = parse_response_headers(response.headers());
        if !status.is_success() {
            let body = response.text().await.ok();
            let details = body.map(serde_json::Value::String);
            return Err(DurableStreamError::from_status(
                status.as_u16(),
                &self.url,
                details,
                durable_streams_core::error::Operation::Other,
            ));
        }

        let body = response.bytes().await.map_err(|e| {
            DurableStreamError::new(ErrorKind::NetworkError, "failed reading response body".to_owned())
                .with_source(e)
        })?;

        self.advance_state(&meta);
        Ok((body, meta))
    }

    fn advance_state(&self, meta: &ResponseMetadata) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(offset) = &meta.next_offset {
            state.offset = offset.clone();
        }
        if let Some(cursor) = &meta.cursor {
            state.cursor = Some(cursor.clone());
        }
        state.reached_up_to_date = meta.up_to_date;
        if meta.closed {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn should_continue_paging(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        if !self.live.is_live() {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            return !state.reached_up_to_date;
        }
        true
    }

    /// Raw byte chunks, one per page fetched. Not available in SSE mode.
    pub fn iter_bytes(&self) -> impl Stream<Item = Result<Bytes, DurableStreamError>> + '_ {
        try_stream! {
            self.require_not_sse("iter_bytes")?;
            self.mark_consumed("iter_bytes")?;
            loop {
                let (body, _meta) = self.fetch_page().await?;
                if !body.is_empty() {
                    yield body;
                }
                if !self.should_continue_paging() {
                    break;
                }
            }
        }
    }

    /// UTF-8 text chunks. In SSE mode, each `data` event's payload is a chunk; in
    /// paged modes, each page's raw body decoded as UTF-8.
    pub fn iter_text(&self) -> impl Stream<Item = Result<String, DurableStreamError>> + '_ {
        try_stream! {
            self.mark_consumed("iter_text")?;
            if self.live == LiveMode::Sse {
                let mut events = self.iter_sse_events();
                futures_util::pin_mut!(events);
                while let Some(event) = events.next().await {
                    if let SseEvent::Data { data } = event? {
                        yield data;
                    }
                }
            } else {
                loop {
                    let (body, _meta) = self.fetch_page().await?;
                    if !body.is_empty() {
                        yield String::from_utf8(body.to_vec()).map_err(|e| {
                            DurableStreamError::new(ErrorKind::ParseError, "page body was not valid UTF-8".to_owned())
                                .with_source(e)
                        })?;
                    }
                    if !self.should_continue_paging() {
                        break;
                    }
                }
            }
        }
    }

    /// Individual JSON values. In paged modes, each page body is a JSON array that
    /// is flattened into its elements; in SSE mode, each `data` event is parsed as
    /// one JSON value.
    pub fn iter_json(&self) -> impl Stream<Item = Result<serde_json::Value, DurableStreamError>> + '_ {
        try_stream! {
            self.mark_consumed("iter_json")?;
            if self.live == LiveMode::Sse {
                let mut events = self.iter_sse_events();
                futures_util::pin_mut!(events);
                while let Some(event) = events.next().await {
                    if let SseEvent::Data { data } = event? {
                        yield parse_json_value(&data)?;
                    }
                }
            } else {
                loop {
                    let (body, _meta) = self.fetch_page().await?;
                    if !body.is_empty() {
                        for value in parse_json_array(&body)? {
                            yield value;
                        }
                    }
                    if !self.should_continue_paging() {
                        break;
                    }
                }
            }
        }
    }

    /// Whole pages of JSON values, one `Vec` per page/event rather than flattened.
    pub fn iter_json_batches(
        &self,
    ) -> impl Stream<Item = Result<Vec<serde_json::Value>, DurableStreamError>> + '_ {
        try_stream! {
            self.mark_consumed("iter_json_batches")?;
            if self.live == LiveMode::Sse {
                let mut events = self.iter_sse_events();
                futures_util::pin_mut!(events);
                while let Some(event) = events.next().await {
                    if let SseEvent::Data { data } = event? {
                        yield vec![parse_json_value(&data)?];
                    }
                }
            } else {
                loop {
                    let (body, _meta) = self.fetch_page().await?;
                    if !body.is_empty() {
                        yield parse_json_array(&body)?;
                    }
                    if !self.should_continue_paging() {
                        break;
                    }
                }
            }
        }
    }

    /// Whole pages of JSON values alongside the page's up-to-date flag, one item
    /// per page/control-event. Unlike [`Self::iter_json_batches`], this always
    /// yields once per page even when the page body is empty, so a caller that
    /// needs to know when the source is caught up doesn't lose that signal to an
    /// empty page.
    pub fn iter_json_pages(
        &self,
    ) -> impl Stream<Item = Result<(Vec<serde_json::Value>, bool), DurableStreamError>> + '_ {
        try_stream! {
            self.mark_consumed("iter_json_pages")?;
            if self.live == LiveMode::Sse {
                let mut events = self.iter_sse_events();
                futures_util::pin_mut!(events);
                let mut pending: Vec<serde_json::Value> = Vec::new();
                while let Some(event) = events.next().await {
                    match event? {
                        SseEvent::Data { data } => pending.push(parse_json_value(&data)?),
                        SseEvent::Control { up_to_date, .. } => {
                            yield (std::mem::take(&mut pending), up_to_date);
                        }
                    }
                }
            } else {
                loop {
                    let (body, meta) = self.fetch_page().await?;
                    let values = if body.is_empty() { Vec::new() } else { parse_json_array(&body)? };
                    yield (values, meta.up_to_date);
                    if !self.should_continue_paging() {
                        break;
                    }
                }
            }
        }
    }

    /// Events carrying both payload and resumption metadata
    /// ([`StreamEvent`]). The uniform entry point across paged and SSE modes.
    pub fn iter_events(
        &self,
    ) -> impl Stream<Item = Result<StreamEvent<serde_json::Value>, DurableStreamError>> + '_ {
        try_stream! {
            self.mark_consumed("iter_events")?;
            if self.live == LiveMode::Sse {
                let mut events = self.iter_sse_events();
                futures_util::pin_mut!(events);
                let mut pending: Vec<serde_json::Value> = Vec::new();
                while let Some(event) = events.next().await {
                    match event? {
                        SseEvent::Data { data } => pending.push(parse_json_value(&data)?),
                        SseEvent::Control { stream_next_offset, stream_cursor, up_to_date } => {
                            for data in pending.drain(..) {
                                yield StreamEvent {
                                    data,
                                    next_offset: stream_next_offset.clone(),
                                    up_to_date,
                                    cursor: stream_cursor.clone(),
                                };
                            }
                        }
                    }
                }
            } else {
                loop {
                    let (body, meta) = self.fetch_page().await?;
                    if !body.is_empty() {
                        for value in parse_json_array(&body)? {
                            yield StreamEvent {
                                data: value,
                                next_offset: meta.next_offset.clone().unwrap_or_default(),
                                up_to_date: meta.up_to_date,
                                cursor: meta.cursor.clone(),
                            };
                        }
                    }
                    if !self.should_continue_paging() {
                        break;
                    }
                }
            }
        }
    }

    /// Internal: raw SSE event stream, shared by every SSE-mode public iterator.
    fn iter_sse_events(&self) -> impl Stream<Item = Result<SseEvent, DurableStreamError>> + '_ {
        try_stream! {
            let params = self.params.lock().unwrap_or_else(|e| e.into_inner()).clone();
            let (headers, mut query) = params.resolve().await;
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner()).clone();
            query.insert(OFFSET_QUERY_PARAM.to_owned(), state.offset.as_str().to_owned());
            query.insert(LIVE_QUERY_PARAM.to_owned(), "sse".to_owned());
            if let Some(cursor) = &state.cursor {
                query.insert(CURSOR_QUERY_PARAM.to_owned(), cursor.as_str().to_owned());
            }

            let mut request = self
                .client
                .get()
                .get(&self.url)
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .query(&query);
            for (name, value) in &headers {
                request = request.header(name, value);
            }

            let response = request.send().await.map_err(|e| {
                DurableStreamError::new(ErrorKind::NetworkError, format!("SSE request to {} failed", self.url))
                    .with_source(e)
            })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.ok().map(serde_json::Value::String);
                Err(DurableStreamError::from_status(
                    status.as_u16(),
                    &self.url,
                    body,
                    durable_streams_core::error::Operation::Other,
                ))?;
            }

            if let Some(content_type) = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
            {
                if !is_sse_compatible_content_type(content_type) {
                    Err(DurableStreamError::new(
                        ErrorKind::SseNotSupported,
                        format!("content type {content_type} is not SSE-compatible"),
                    ))?;
                }
            }

            let mut parser = SseParser::new();
            let mut byte_stream = response.bytes_stream();
            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk.map_err(|e| {
                    tracing::warn!(url = %self.url, error = %e, "SSE body stream error");
                    DurableStreamError::new(ErrorKind::NetworkError, "SSE body stream error".to_owned())
                        .with_source(e)
                })?;
                for event in parser.feed(&chunk)? {
                    if let SseEvent::Control { stream_next_offset, stream_cursor, up_to_date } = &event {
                        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                        state.offset = stream_next_offset.clone();
                        state.cursor = stream_cursor.clone();
                        state.reached_up_to_date = *up_to_date;
                    }
                    yield event;
                }
                if self.is_closed() {
                    break;
                }
            }
            for event in parser.finish()? {
                yield event;
            }
        }
    }

    /// Read the whole catch-up response at once as bytes. Not available for live
    /// sessions (long-poll/sse) since there is no natural end.
    pub async fn read_bytes(&self) -> Result<Bytes, DurableStreamError> {
        self.require_not_live("read_bytes")?;
        self.require_not_sse("read_bytes")?;
        self.mark_consumed("read_bytes")?;
        let mut buffer = bytes::BytesMut::new();
        loop {
            let (body, _meta) = self.fetch_page().await?;
            buffer.extend_from_slice(&body);
            if !self.should_continue_paging() {
                break;
            }
        }
        Ok(buffer.freeze())
    }

    /// Read the whole catch-up response at once as text.
    pub async fn read_text(&self) -> Result<String, DurableStreamError> {
        self.require_not_live("read_text")?;
        self.mark_consumed("read_text")?;
        let mut buffer = String::new();
        loop {
            let (body, _meta) = self.fetch_page().await?;
            buffer.push_str(&String::from_utf8(body.to_vec()).map_err(|e| {
                DurableStreamError::new(ErrorKind::ParseError, "page body was not valid UTF-8".to_owned())
                    .with_source(e)
            })?);
            if !self.should_continue_paging() {
                break;
            }
        }
        Ok(buffer)
    }

    /// Read the whole catch-up response at once as a flattened `Vec` of JSON
    /// values.
    pub async fn read_json(&self) -> Result<Vec<serde_json::Value>, DurableStreamError> {
        self.require_not_live("read_json")?;
        self.mark_consumed("read_json")?;
        let mut values = Vec::new();
        loop {
            let (body, _meta) = self.fetch_page().await?;
            if !body.is_empty() {
                values.extend(parse_json_array(&body)?);
            }
            if !self.should_continue_paging() {
                break;
            }
        }
        Ok(values)
    }

    /// Read the whole catch-up response as per-page JSON batches.
    pub async fn read_json_batches(
        &self,
    ) -> Result<Vec<Vec<serde_json::Value>>, DurableStreamError> {
        self.require_not_live("read_json_batches")?;
        self.mark_consumed("read_json_batches")?;
        let mut batches = Vec::new();
        loop {
            let (body, _meta) = self.fetch_page().await?;
            if !body.is_empty() {
                batches.push(parse_json_array(&body)?);
            }
            if !self.should_continue_paging() {
                break;
            }
        }
        Ok(batches)
    }
}

fn parse_json_value(text: &str) -> Result<serde_json::Value, DurableStreamError> {
    serde_json::from_str(text).map_err(|e| {
        DurableStreamError::new(ErrorKind::ParseError, "event data was not valid JSON".to_owned())
            .with_source(e)
    })
}

fn parse_json_array(body: &[u8]) -> Result<Vec<serde_json::Value>, DurableStreamError> {
    let value: serde_json::Value = serde_json::from_slice(body).map_err(|e| {
        DurableStreamError::new(ErrorKind::ParseError, "page body was not valid JSON".to_owned())
            .with_source(e)
    })?;
    match value {
        serde_json::Value::Array(items) => Ok(items),
        other => Ok(vec![other]),
    }
}
