// ABOUTME: URL-scoped stream handle and its synchronous append batcher
// ABOUTME: The batcher coalesces concurrent appends behind a single in-flight request

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use durable_streams_core::constants::{is_json_content_type, CONTENT_TYPE_JSON};
use durable_streams_core::error::Operation;
use durable_streams_core::{DurableStreamError, ErrorKind, LiveMode, Offset};
use tokio::sync::{oneshot, Mutex};

use crate::client::SharedClient;
use crate::codec::parse_response_headers;
use crate::params::ParamSet;
use crate::session::{OnErrorHook, ReadSession};
use crate::types::{AppendResult, AppendValue, HeadResult};

type BoxFuture<'a, T> = futures_util::future::BoxFuture<'a, T>;

/// Encode a batch of queued values into the single request body a flush sends,
/// per the stream's content type.
///
/// JSON streams send the values as a JSON array (even a batch of one becomes
/// `[v]`); non-JSON streams concatenate the raw bytes of every value. Mixing
/// [`AppendValue::Json`] into a non-JSON stream, or [`AppendValue::Bytes`] into
/// a JSON one, is rejected rather than silently coerced.
///
/// # Errors
///
/// [`ErrorKind::InvalidArgument`] if `values` is empty; [`ErrorKind::BadRequest`]
/// if a value's kind doesn't match `content_type`.
pub(crate) fn encode_append_batch(
    values: &[AppendValue],
    content_type: &str,
) -> Result<Vec<u8>, DurableStreamError> {
    if values.is_empty() {
        return Err(DurableStreamError::new(
            ErrorKind::InvalidArgument,
            "append batch must contain at least one value".to_owned(),
        ));
    }

    if is_json_content_type(content_type) {
        let mut array = Vec::with_capacity(values.len());
        for value in values {
            match value {
                AppendValue::Json(v) => array.push(v.clone()),
                AppendValue::Bytes(_) => {
                    return Err(DurableStreamError::new(
                        ErrorKind::BadRequest,
                        "cannot append raw bytes to a JSON stream".to_owned(),
                    ))
                }
            }
        }
        serde_json::to_vec(&array).map_err(|e| {
            DurableStreamError::new(
                ErrorKind::InternalError,
                "failed to encode JSON append batch".to_owned(),
            )
            .with_source(e)
        })
    } else {
        let mut body = Vec::new();
        for value in values {
            match value {
                AppendValue::Bytes(bytes) => body.extend_from_slice(bytes),
                AppendValue::Json(_) => {
                    return Err(DurableStreamError::new(
                        ErrorKind::BadRequest,
                        "cannot append a JSON value to a non-JSON stream".to_owned(),
                    ))
                }
            }
        }
        Ok(body)
    }
}

/// A single pending append, waiting for the batcher's leader to flush it.
struct QueuedAppend {
    value: AppendValue,
    seq: Option<String>,
    completion: oneshot::Sender<Result<AppendResult, DurableStreamError>>,
}

/// Coalesces concurrent [`StreamHandle::append`] calls behind one in-flight
/// request per batching window, the way a single writer would naturally pipeline
/// its own appends.
///
/// The first caller to find the queue empty becomes the leader: it drains
/// whatever has accumulated (including appends queued while it was sending the
/// previous flush), encodes them into a single request body, issues one POST,
/// and wakes every waiter with the shared result. Every other caller just
/// enqueues and awaits its own oneshot. The loop is iterative, not recursive: a
/// leader that finishes flushing re-checks the queue itself rather than
/// spawning a new flush task, so arbitrarily long bursts don't grow the call
/// stack.
pub struct AppendBatcher {
    queue: Mutex<VecDeque<QueuedAppend>>,
    linger: Duration,
}

impl AppendBatcher {
    #[must_use]
    pub fn new(linger: Duration) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            linger,
        }
    }

    /// Enqueue one append, becoming the flush leader if the queue was empty.
    ///
    /// `send` receives the single encoded body and the batch's effective seq
    /// (the last non-null seq among its members) and performs the one POST for
    /// the whole batch; its result is duplicated across every waiter.
    async fn submit(
        &self,
        value: AppendValue,
        seq: Option<String>,
        content_type: &str,
        send: impl Fn(Vec<u8>, Option<String>) -> BoxFuture<'static, Result<AppendResult, DurableStreamError>>
            + Send
            + Sync,
    ) -> Result<AppendResult, DurableStreamError> {
        let (tx, rx) = oneshot::channel();
        let became_leader = {
            let mut queue = self.queue.lock().await;
            let was_empty = queue.is_empty();
            queue.push_back(QueuedAppend {
                value,
                seq,
                completion: tx,
            });
            was_empty
        };

        if became_leader {
            if !self.linger.is_zero() {
                tokio::time::sleep(self.linger).await;
            }
            loop {
                let batch: Vec<QueuedAppend> = {
                    let mut queue = self.queue.lock().await;
                    queue.drain(..).collect()
                };
                if batch.is_empty() {
                    break;
                }

                let mut values = Vec::with_capacity(batch.len());
                let mut completions = Vec::with_capacity(batch.len());
                let mut batch_seq = None;
                for item in batch {
                    if item.seq.is_some() {
                        batch_seq = item.seq.clone();
                    }
                    values.push(item.value);
                    completions.push(item.completion);
                }

                let result = match encode_append_batch(&values, content_type) {
                    Ok(body) => send(body, batch_seq).await,
                    Err(e) => Err(e),
                };

                for completion in completions {
                    let outcome = match &result {
                        Ok(ok) => Ok(ok.clone()),
                        Err(err) => Err(err.duplicate()),
                    };
                    let _ = completion.send(outcome);
                }
            }
        }

        rx.await.unwrap_or_else(|_| {
            Err(DurableStreamError::new(
                ErrorKind::InternalError,
                "append batcher dropped the completion channel".to_owned(),
            ))
        })
    }
}

/// A URL-scoped handle to a single stream: `head`, `create_stream`, `delete`,
/// `append`, and `stream` (catch-up/live reads).
pub struct StreamHandle {
    client: SharedClient,
    url: String,
    params: ParamSet,
    content_type: String,
    on_error: Option<OnErrorHook>,
    batcher: Arc<AppendBatcher>,
}

impl StreamHandle {
    /// Build a handle bound to `url`, using `client`'s connection pool. Appends
    /// default to JSON encoding; use [`with_content_type`](Self::with_content_type)
    /// for a text/binary stream.
    #[must_use]
    pub fn new(client: SharedClient, url: String) -> Self {
        Self {
            client,
            url,
            params: ParamSet::new(),
            content_type: CONTENT_TYPE_JSON.to_owned(),
            on_error: None,
            batcher: Arc::new(AppendBatcher::new(Duration::ZERO)),
        }
    }

    /// Attach static/dynamic headers and query params applied to every request
    /// this handle makes.
    #[must_use]
    pub fn with_params(mut self, params: ParamSet) -> Self {
        self.params = params;
        self
    }

    /// Set the content type this handle appends as, governing whether
    /// [`AppendValue::Json`] or [`AppendValue::Bytes`] is accepted.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Set the linger window the append batcher waits before flushing, allowing
    /// more concurrent callers to join the same batch.
    #[must_use]
    pub fn with_append_linger(mut self, linger: Duration) -> Self {
        self.batcher = Arc::new(AppendBatcher::new(linger));
        self
    }

    /// Register a hook invoked when a request fails; returning a patch retries the
    /// request once with the patch merged into this handle's headers/params.
    #[must_use]
    pub fn with_on_error(mut self, hook: OnErrorHook) -> Self {
        self.on_error = Some(hook);
        self
    }

    pub(crate) fn client(&self) -> &SharedClient {
        &self.client
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn params(&self) -> &ParamSet {
        &self.params
    }

    pub(crate) fn content_type(&self) -> &str {
        &self.content_type
    }

    /// `HEAD` the stream: content type, tail offset, cache validators.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::NotFound`] if the stream does not exist; [`ErrorKind::NetworkError`]
    /// on a transport failure.
    pub async fn head(&self) -> Result<HeadResult, DurableStreamError> {
        let (headers, query) = self.params.resolve().await;
        let mut request = self.client.get().head(&self.url).query(&query);
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        let response = request.send().await.map_err(|e| {
            DurableStreamError::new(ErrorKind::NetworkError, format!("HEAD {} failed", self.url))
                .with_source(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DurableStreamError::from_status(
                status.as_u16(),
                &self.url,
                None,
                Operation::Other,
            ));
        }

        let meta = parse_response_headers(response.headers());
        Ok(HeadResult {
            content_type: meta.content_type,
            offset: meta.next_offset,
            etag: response
                .headers()
                .get(reqwest::header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(ToOwned::to_owned),
            cache_control: response
                .headers()
                .get(reqwest::header::CACHE_CONTROL)
                .and_then(|v| v.to_str().ok())
                .map(ToOwned::to_owned),
        })
    }

    /// Create the stream with the given content type. `ttl_secs` and
    /// `expires_at_rfc3339` are mutually exclusive retention controls.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::ConflictExists`] if the stream already exists with a different
    /// configuration; [`ErrorKind::InvalidArgument`] if both retention controls are
    /// given.
    pub async fn create_stream(
        &self,
        content_type: &str,
        ttl_secs: Option<u64>,
        expires_at_rfc3339: Option<&str>,
    ) -> Result<(), DurableStreamError> {
        if ttl_secs.is_some() && expires_at_rfc3339.is_some() {
            return Err(DurableStreamError::new(
                ErrorKind::InvalidArgument,
                "ttl_secs and expires_at_rfc3339 are mutually exclusive".to_owned(),
            ));
        }

        let (headers, query) = self.params.resolve().await;
        let mut request = self
            .client
            .get()
            .put(&self.url)
            .query(&query)
            .header(reqwest::header::CONTENT_TYPE, content_type);
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        if let Some(ttl) = ttl_secs {
            request = request.header(
                durable_streams_core::constants::STREAM_TTL_HEADER,
                ttl.to_string(),
            );
        }
        if let Some(expires_at) = expires_at_rfc3339 {
            request = request.header(
                durable_streams_core::constants::STREAM_EXPIRES_AT_HEADER,
                expires_at,
            );
        }

        let response = request.send().await.map_err(|e| {
            DurableStreamError::new(ErrorKind::NetworkError, format!("PUT {} failed", self.url))
                .with_source(e)
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.ok().map(serde_json::Value::String);
            return Err(DurableStreamError::from_status(
                status.as_u16(),
                &self.url,
                body,
                Operation::Create,
            ));
        }
        Ok(())
    }

    /// Delete the stream.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::NotFound`] if the stream does not exist.
    pub async fn delete(&self) -> Result<(), DurableStreamError> {
        let (headers, query) = self.params.resolve().await;
        let mut request = self.client.get().delete(&self.url).query(&query);
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        let response = request.send().await.map_err(|e| {
            DurableStreamError::new(ErrorKind::NetworkError, format!("DELETE {} failed", self.url))
                .with_source(e)
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(DurableStreamError::from_status(
                status.as_u16(),
                &self.url,
                None,
                Operation::Other,
            ));
        }
        Ok(())
    }

    /// Append one value. `seq`, if given, is sent as `Stream-Seq` for
    /// lexicographic ordering enforcement; concurrent calls on the same handle
    /// with no `producer_headers` are coalesced by the handle's
    /// [`AppendBatcher`] into a single POST.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::BadRequest`] if `value`'s kind doesn't match this handle's
    /// content type; [`ErrorKind::ConflictSeq`] if `seq` does not exceed the
    /// last appended seq.
    pub async fn append(
        &self,
        value: AppendValue,
        seq: Option<String>,
        producer_headers: Option<Vec<(String, String)>>,
    ) -> Result<AppendResult, DurableStreamError> {
        // Producer-fenced appends must not be coalesced with unrelated callers:
        // each carries its own epoch/seq headers that only apply to its own body.
        if producer_headers.is_some() {
            let body = encode_append_batch(std::slice::from_ref(&value), &self.content_type)?;
            return self.append_once(body, seq, producer_headers).await;
        }

        let client = self.client.clone();
        let url = self.url.clone();
        let params = self.params.clone();
        let content_type = self.content_type.clone();
        self.batcher
            .submit(value, seq, &self.content_type, move |body, seq| {
                let client = client.clone();
                let url = url.clone();
                let params = params.clone();
                let content_type = content_type.clone();
                Box::pin(async move {
                    append_once_with(&client, &url, &params, body, seq, &content_type, None).await
                })
            })
            .await
    }

    async fn append_once(
        &self,
        body: Vec<u8>,
        seq: Option<String>,
        producer_headers: Option<Vec<(String, String)>>,
    ) -> Result<AppendResult, DurableStreamError> {
        append_once_with(
            &self.client,
            &self.url,
            &self.params,
            body,
            seq,
            &self.content_type,
            producer_headers,
        )
        .await
    }

    /// Open a read session for this stream.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::NotFound`] if the stream does not exist.
    pub async fn stream(
        &self,
        offset: Option<Offset>,
        live: LiveMode,
        cursor: Option<durable_streams_core::StreamCursor>,
        extra_params: Option<ParamSet>,
    ) -> Result<ReadSession, DurableStreamError> {
        let mut params = self.params.clone();
        if let Some(extra) = extra_params {
            params = params.merged_with(extra);
        }
        Ok(ReadSession::new(
            self.client.clone(),
            self.url.clone(),
            params,
            live,
            offset.unwrap_or_default(),
            cursor,
            self.on_error.clone(),
        ))
    }
}

/// Send one already-encoded batch body as a single POST, extracting producer
/// fencing details from the response headers on 403/409 so callers with
/// `producer_headers` can decide whether to auto-claim or reorder-retry.
pub(crate) async fn append_once_with(
    client: &SharedClient,
    url: &str,
    params: &ParamSet,
    body: Vec<u8>,
    seq: Option<String>,
    content_type: &str,
    producer_headers: Option<Vec<(String, String)>>,
) -> Result<AppendResult, DurableStreamError> {
    let (headers, query) = params.resolve().await;
    let mut request = client
        .get()
        .post(url)
        .query(&query)
        .header(reqwest::header::CONTENT_TYPE, content_type)
        .body(body);
    for (name, value) in &headers {
        request = request.header(name, value);
    }
    if let Some(seq) = &seq {
        request = request.header(durable_streams_core::constants::STREAM_SEQ_HEADER, seq);
    }
    if let Some(producer_headers) = &producer_headers {
        for (name, value) in producer_headers {
            request = request.header(name, value);
        }
    }

    let response = request.send().await.map_err(|e| {
        DurableStreamError::new(ErrorKind::NetworkError, format!("append to {url} failed")).with_source(e)
    })?;

    let status = response.status();
    let duplicate = status.as_u16() == 204;
    if !status.is_success() {
        // Producer fencing headers live on the response and must be read before
        // the body is consumed.
        let producer_epoch = response
            .headers()
            .get(durable_streams_core::constants::PRODUCER_EPOCH_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);
        let expected_seq = response
            .headers()
            .get(durable_streams_core::constants::PRODUCER_EXPECTED_SEQ_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);
        let received_seq = response
            .headers()
            .get(durable_streams_core::constants::PRODUCER_RECEIVED_SEQ_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);

        let status_code = status.as_u16();
        let body_text = response.text().await.ok();
        let body = body_text.clone().map(serde_json::Value::String);

        // A 403/409 on a producer-fenced append means epoch/seq fencing kicked
        // in; `from_status` has no notion of producer headers and can't tell
        // these apart from an ordinary auth failure or seq-regression.
        if producer_headers.is_some() && (status_code == 403 || status_code == 409) {
            let mut details = serde_json::Map::new();
            if let Some(epoch) = producer_epoch {
                details.insert("producer_epoch".to_owned(), serde_json::Value::String(epoch));
            }
            if let Some(expected) = expected_seq {
                details.insert("expected_seq".to_owned(), serde_json::Value::String(expected));
            }
            if let Some(received) = received_seq {
                details.insert("received_seq".to_owned(), serde_json::Value::String(received));
            }
            if let Some(text) = body_text {
                details.insert("body".to_owned(), serde_json::Value::String(text));
            }

            let (kind, message) = if status_code == 403 {
                tracing::warn!(url, "producer append fenced out by a newer epoch");
                (
                    ErrorKind::StaleEpoch,
                    format!("producer epoch was fenced out by a newer writer: {url}"),
                )
            } else {
                tracing::warn!(url, "producer append rejected for sequence mismatch");
                (
                    ErrorKind::ConflictSeq,
                    format!("producer seq did not match the server's expectation: {url}"),
                )
            };
            return Err(DurableStreamError::new(kind, message)
                .with_status(status_code)
                .with_details(serde_json::Value::Object(details)));
        }

        return Err(DurableStreamError::from_status(
            status_code,
            url,
            body,
            Operation::Other,
        ));
    }

    let meta = parse_response_headers(response.headers());
    let next_offset = meta.next_offset.ok_or_else(|| {
        DurableStreamError::new(
            ErrorKind::InternalError,
            format!("append response from {url} was missing Stream-Next-Offset"),
        )
    })?;

    Ok(AppendResult { next_offset, duplicate })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_json_batch_wraps_values_in_an_array() {
        let values = vec![AppendValue::Json(serde_json::json!({"a": 1}))];
        let body = encode_append_batch(&values, CONTENT_TYPE_JSON).unwrap();
        assert_eq!(body, br#"[{"a":1}]"#);
    }

    #[test]
    fn encode_json_batch_rejects_bytes() {
        let values = vec![AppendValue::Bytes(b"x".to_vec())];
        let err = encode_append_batch(&values, CONTENT_TYPE_JSON).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn encode_text_batch_concatenates_bytes() {
        let values = vec![AppendValue::text("ab"), AppendValue::text("cd")];
        let body = encode_append_batch(&values, "text/plain").unwrap();
        assert_eq!(body, b"abcd");
    }

    #[test]
    fn encode_text_batch_rejects_json() {
        let values = vec![AppendValue::Json(serde_json::json!(1))];
        let err = encode_append_batch(&values, "text/plain").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn encode_empty_batch_is_invalid_argument() {
        let err = encode_append_batch(&[], CONTENT_TYPE_JSON).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn batcher_completes_every_waiter_from_one_send_call() {
        let batcher = AppendBatcher::new(Duration::ZERO);
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls_clone = calls.clone();
        let send = move |body: Vec<u8>, _seq: Option<String>| -> BoxFuture<'static, Result<AppendResult, DurableStreamError>> {
            calls_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            assert_eq!(body, br#"[1,2]"#);
            Box::pin(async move {
                Ok(AppendResult {
                    next_offset: Offset::new("1"),
                    duplicate: false,
                })
            })
        };

        let a = batcher.submit(AppendValue::Json(serde_json::json!(1)), None, CONTENT_TYPE_JSON, send.clone());
        let b = batcher.submit(AppendValue::Json(serde_json::json!(2)), None, CONTENT_TYPE_JSON, send);
        let (a, b) = tokio::join!(a, b);
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batcher_picks_last_non_null_seq() {
        let batcher = AppendBatcher::new(Duration::ZERO);
        let seen_seq = Arc::new(Mutex::new(None));
        let seen_seq_clone = seen_seq.clone();
        let send = move |_body: Vec<u8>, seq: Option<String>| -> BoxFuture<'static, Result<AppendResult, DurableStreamError>> {
            let seen_seq_clone = seen_seq_clone.clone();
            Box::pin(async move {
                *seen_seq_clone.lock().await = seq;
                Ok(AppendResult {
                    next_offset: Offset::new("1"),
                    duplicate: false,
                })
            })
        };

        let a = batcher.submit(AppendValue::text("a"), Some("s1".to_owned()), "text/plain", send.clone());
        let b = batcher.submit(AppendValue::text("b"), None, "text/plain", send);
        let _ = tokio::join!(a, b);
        assert_eq!(*seen_seq.lock().await, Some("s1".to_owned()));
    }
}
