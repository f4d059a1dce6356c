// ABOUTME: Idempotent producer: fire-and-forget batching with epoch/seq fencing
// ABOUTME: A restart claims a fresh epoch, fencing out any earlier, possibly-zombie writer

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use durable_streams_core::constants::{
    is_json_content_type, PRODUCER_EPOCH_HEADER, PRODUCER_ID_HEADER, PRODUCER_SEQ_HEADER,
};
use durable_streams_core::{DurableStreamError, ErrorKind};
use tokio::sync::{Mutex, Notify, Semaphore};

use crate::stream::{append_once_with, encode_append_batch, StreamHandle};
use crate::types::AppendValue;

/// Hook invoked once per batch that fails after retries are exhausted.
pub type ProducerErrorHook = Arc<dyn Fn(&DurableStreamError) + Send + Sync>;

/// Configuration for an [`IdempotentProducer`].
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    producer_id: String,
    max_in_flight: u32,
    max_batch_bytes: u64,
    linger: Duration,
    auto_claim: bool,
}

impl ProducerConfig {
    /// Build a config for the given stable producer identity.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidArgument`] if `producer_id` is empty.
    pub fn new(producer_id: impl Into<String>) -> Result<Self, DurableStreamError> {
        let producer_id = producer_id.into();
        if producer_id.is_empty() {
            return Err(DurableStreamError::new(
                ErrorKind::InvalidArgument,
                "producer_id must not be empty".to_owned(),
            ));
        }
        Ok(Self {
            producer_id,
            max_in_flight: 16,
            max_batch_bytes: 1_000_000,
            linger: Duration::ZERO,
            auto_claim: true,
        })
    }

    /// Set how many batches may be pipelined ahead of their acknowledgement.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidArgument`] if `max_in_flight` is zero.
    pub fn with_max_in_flight(mut self, max_in_flight: u32) -> Result<Self, DurableStreamError> {
        if max_in_flight == 0 {
            return Err(DurableStreamError::new(
                ErrorKind::InvalidArgument,
                "max_in_flight must be at least 1".to_owned(),
            ));
        }
        self.max_in_flight = max_in_flight;
        Ok(self)
    }

    /// Set the cumulative payload size, in bytes, that triggers an immediate
    /// flush of the pending batch.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidArgument`] if `max_batch_bytes` is zero.
    pub fn with_max_batch_bytes(mut self, max_batch_bytes: u64) -> Result<Self, DurableStreamError> {
        if max_batch_bytes == 0 {
            return Err(DurableStreamError::new(
                ErrorKind::InvalidArgument,
                "max_batch_bytes must be at least 1".to_owned(),
            ));
        }
        self.max_batch_bytes = max_batch_bytes;
        Ok(self)
    }

    /// Set how long a pending batch waits, after its first append, for more
    /// appends to join it before sending.
    #[must_use]
    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    /// Set whether a 403 (stale epoch) is recovered from automatically by
    /// claiming `server_epoch + 1` and retrying, rather than surfaced as an
    /// error. Defaults to `true`.
    #[must_use]
    pub fn with_auto_claim(mut self, auto_claim: bool) -> Self {
        self.auto_claim = auto_claim;
        self
    }
}

fn validate_value(value: &AppendValue, content_type: &str) -> Result<(), DurableStreamError> {
    let is_json = is_json_content_type(content_type);
    match (value, is_json) {
        (AppendValue::Json(_), true) | (AppendValue::Bytes(_), false) => Ok(()),
        (AppendValue::Json(_), false) => Err(DurableStreamError::new(
            ErrorKind::BadRequest,
            "cannot append a JSON value to a non-JSON stream".to_owned(),
        )),
        (AppendValue::Bytes(_), true) => Err(DurableStreamError::new(
            ErrorKind::BadRequest,
            "cannot append raw bytes to a JSON stream".to_owned(),
        )),
    }
}

fn extract_u64_detail(err: &DurableStreamError, key: &str) -> Option<u64> {
    err.details()?.get(key)?.as_str()?.parse::<u64>().ok()
}

struct ProducerState {
    epoch: u64,
    next_seq: u64,
    /// Seqs (scoped by epoch) whose batch has resolved, success or failure.
    /// Consulted by `flush`/reorder-retry to know what's settled; pruned well
    /// behind the current seq since nothing waits on ancient entries.
    resolved: HashSet<(u64, u64)>,
    pending: Vec<AppendValue>,
    pending_bytes: u64,
    closed: bool,
    last_error: Option<DurableStreamError>,
}

impl ProducerState {
    fn prune(&mut self, current_seq: u64, max_in_flight: u64) {
        let floor = current_seq.saturating_sub(3 * max_in_flight);
        self.resolved.retain(|(_, seq)| *seq >= floor);
    }
}

struct Inner {
    handle: StreamHandle,
    config: ProducerConfig,
    state: Mutex<ProducerState>,
    in_flight: Arc<Semaphore>,
    /// Held for the whole first batch's retry loop so at most one batch is in
    /// flight while the epoch claim is unconfirmed; released once a batch
    /// succeeds under the current epoch.
    claim_lock: Mutex<()>,
    epoch_claimed: AtomicBool,
    seq_done: Notify,
    on_error: std::sync::Mutex<Option<ProducerErrorHook>>,
}

/// A fire-and-forget append producer that fences out earlier, possibly-zombie
/// instances of itself via an epoch claimed on construction/restart, and a
/// per-epoch monotone batch sequence the server uses to deduplicate retried
/// appends.
///
/// `append` enqueues into the current pending batch and returns immediately;
/// the batch is sent once it crosses `max_batch_bytes`, its linger window
/// elapses, or [`flush`](Self::flush) is called explicitly. Cheaply cloneable:
/// all clones share the same pending batch and in-flight bookkeeping.
#[derive(Clone)]
pub struct IdempotentProducer(Arc<Inner>);

impl IdempotentProducer {
    /// Claim a new epoch on `handle` and return a producer ready to append.
    ///
    /// Claiming is implicit: the first batch after construction or
    /// [`restart`](Self::restart) carries the newly claimed epoch at seq 0,
    /// which the server accepts unconditionally, fencing out any writer still
    /// using the previous epoch.
    #[must_use]
    pub fn new(handle: StreamHandle, config: ProducerConfig) -> Self {
        let max_in_flight = config.max_in_flight;
        Self(Arc::new(Inner {
            handle,
            config,
            state: Mutex::new(ProducerState {
                epoch: 0,
                next_seq: 0,
                resolved: HashSet::new(),
                pending: Vec::new(),
                pending_bytes: 0,
                closed: false,
                last_error: None,
            }),
            in_flight: Arc::new(Semaphore::new(max_in_flight as usize)),
            claim_lock: Mutex::new(()),
            epoch_claimed: AtomicBool::new(false),
            seq_done: Notify::new(),
            on_error: std::sync::Mutex::new(None),
        }))
    }

    /// Register a hook invoked once per batch that fails after retries are
    /// exhausted. The same failure is also re-raised by the next
    /// [`flush`](Self::flush) call.
    #[must_use]
    pub fn with_on_error(self, hook: impl Fn(&DurableStreamError) + Send + Sync + 'static) -> Self {
        *self.0.on_error.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Arc::new(hook));
        self
    }

    /// Enqueue `value` into the current pending batch. Returns as soon as the
    /// value is queued and validated; it is not yet sent.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::AlreadyClosed`] after [`close`](Self::close);
    /// [`ErrorKind::BadRequest`] if `value`'s kind doesn't match the stream's
    /// content type.
    pub async fn append(&self, value: AppendValue) -> Result<(), DurableStreamError> {
        validate_value(&value, self.0.handle.content_type())?;

        let (should_flush_now, start_linger) = {
            let mut state = self.0.state.lock().await;
            if state.closed {
                return Err(DurableStreamError::new(
                    ErrorKind::AlreadyClosed,
                    "producer is closed".to_owned(),
                ));
            }
            let size = value.size() as u64;
            state.pending.push(value);
            state.pending_bytes += size;
            let should_flush_now = state.pending_bytes >= self.0.config.max_batch_bytes;
            let start_linger = state.pending.len() == 1 && !should_flush_now;
            (should_flush_now, start_linger)
        };

        if should_flush_now {
            let _ = self.drain_and_send().await;
        } else if start_linger {
            self.schedule_linger();
        }
        Ok(())
    }

    /// Send the current pending batch immediately (if non-empty) and wait for
    /// it, and every previously sent batch, to resolve.
    ///
    /// # Errors
    ///
    /// The error from the most recently failed batch since the last
    /// successful `flush`, if any.
    pub async fn flush(&self) -> Result<(), DurableStreamError> {
        self.drain_and_send().await;
        let (epoch, next_seq) = {
            let state = self.0.state.lock().await;
            (state.epoch, state.next_seq)
        };
        if next_seq > 0 {
            self.await_seqs_resolved(epoch, 0, next_seq).await;
        }
        let mut state = self.0.state.lock().await;
        if let Some(err) = state.last_error.take() {
            return Err(err);
        }
        Ok(())
    }

    /// Flush pending appends, then stop accepting new ones.
    pub async fn close(&self) {
        let _ = self.flush().await;
        self.0.state.lock().await.closed = true;
    }

    /// Flush pending appends, then claim a fresh epoch, abandoning anything
    /// still in flight under the old one. Call this after observing
    /// [`ErrorKind::StaleEpoch`] with `auto_claim` disabled, or to resume
    /// writing after a crash.
    pub async fn restart(&self) {
        let _ = self.flush().await;
        let mut state = self.0.state.lock().await;
        state.epoch += 1;
        state.next_seq = 0;
        state.resolved.clear();
        state.closed = false;
        self.0.epoch_claimed.store(false, Ordering::SeqCst);
        tracing::info!(producer_id = %self.0.config.producer_id, epoch = state.epoch, "producer claimed a new epoch");
    }

    fn schedule_linger(&self) {
        let this = self.clone();
        let linger = self.0.config.linger;
        tokio::spawn(async move {
            if !linger.is_zero() {
                tokio::time::sleep(linger).await;
            }
            let _ = this.drain_and_send().await;
        });
    }

    /// Drain the current pending batch (if any) under the state lock, assign
    /// it its batch seq, and spawn the send. Returns the `(epoch, seq)`
    /// assigned, for a caller that wants to wait on it.
    async fn drain_and_send(&self) -> Option<(u64, u64)> {
        let (epoch, seq, values) = {
            let mut state = self.0.state.lock().await;
            if state.pending.is_empty() {
                return None;
            }
            let values = std::mem::take(&mut state.pending);
            state.pending_bytes = 0;
            let seq = state.next_seq;
            state.next_seq += 1;
            (state.epoch, seq, values)
        };
        self.spawn_send(epoch, seq, values);
        Some((epoch, seq))
    }

    fn spawn_send(&self, epoch: u64, seq: u64, values: Vec<AppendValue>) {
        let this = self.clone();
        tokio::spawn(async move {
            let Ok(permit) = this.0.in_flight.clone().acquire_owned().await else {
                return;
            };
            this.send_with_retries(epoch, seq, values).await;
            drop(permit);
        });
    }

    async fn send_with_retries(&self, mut epoch: u64, mut seq: u64, values: Vec<AppendValue>) {
        // While this producer hasn't yet confirmed its epoch with the server,
        // only one batch may be outstanding: pipelining ahead of an unclaimed
        // epoch would let several batches race to discover the same fencing.
        let needs_claim_lock = !self.0.epoch_claimed.load(Ordering::SeqCst);
        let _claim_guard = if needs_claim_lock {
            Some(self.0.claim_lock.lock().await)
        } else {
            None
        };

        let content_type = self.0.handle.content_type().to_owned();
        let body = match encode_append_batch(&values, &content_type) {
            Ok(body) => body,
            Err(err) => {
                self.record_outcome(epoch, seq, Err(err)).await;
                return;
            }
        };

        loop {
            let producer_headers = vec![
                (PRODUCER_ID_HEADER.to_owned(), self.0.config.producer_id.clone()),
                (PRODUCER_EPOCH_HEADER.to_owned(), epoch.to_string()),
                (PRODUCER_SEQ_HEADER.to_owned(), seq.to_string()),
            ];
            let result = append_once_with(
                self.0.handle.client(),
                self.0.handle.url(),
                self.0.handle.params(),
                body.clone(),
                None,
                &content_type,
                Some(producer_headers),
            )
            .await;

            match result {
                Ok(ok) => {
                    self.0.epoch_claimed.store(true, Ordering::SeqCst);
                    self.record_outcome(epoch, seq, Ok(ok)).await;
                    return;
                }
                Err(err) if err.kind() == ErrorKind::StaleEpoch => {
                    if !self.0.config.auto_claim {
                        self.record_outcome(epoch, seq, Err(err)).await;
                        return;
                    }
                    let server_epoch = extract_u64_detail(&err, "producer_epoch").unwrap_or(epoch);
                    let new_epoch = server_epoch + 1;
                    {
                        let mut state = self.0.state.lock().await;
                        state.epoch = new_epoch;
                        state.next_seq = 1;
                    }
                    tracing::warn!(
                        producer_id = %self.0.config.producer_id,
                        new_epoch,
                        "producer auto-claimed a new epoch after stale-epoch rejection"
                    );
                    epoch = new_epoch;
                    seq = 0;
                }
                Err(err) if err.kind() == ErrorKind::ConflictSeq => {
                    let Some(expected_seq) = extract_u64_detail(&err, "expected_seq") else {
                        self.record_outcome(epoch, seq, Err(err)).await;
                        return;
                    };
                    if expected_seq >= seq {
                        let details = err.details().cloned();
                        let mut gap = DurableStreamError::new(
                            ErrorKind::SequenceGap,
                            format!(
                                "producer seq gap: server expects {expected_seq}, this batch was sent as {seq}"
                            ),
                        );
                        if let Some(details) = details {
                            gap = gap.with_details(details);
                        }
                        self.record_outcome(epoch, seq, Err(gap)).await;
                        return;
                    }
                    // The server is behind us: wait for the batches between
                    // `expected_seq` and our own to resolve, then retry at the
                    // same (epoch, seq) rather than skip ahead.
                    self.await_seqs_resolved(epoch, expected_seq, seq).await;
                }
                Err(err) => {
                    self.record_outcome(epoch, seq, Err(err)).await;
                    return;
                }
            }
        }
    }

    async fn record_outcome(&self, epoch: u64, seq: u64, result: Result<crate::types::AppendResult, DurableStreamError>) {
        {
            let mut state = self.0.state.lock().await;
            state.resolved.insert((epoch, seq));
            state.prune(seq, u64::from(self.0.config.max_in_flight));
            if let Err(err) = &result {
                state.last_error = Some(err.duplicate());
            }
        }
        self.0.seq_done.notify_waiters();

        if let Err(err) = &result {
            let hook = self
                .0
                .on_error
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone();
            if let Some(hook) = hook {
                hook(err);
            }
        }
    }

    /// Wait until every seq in `[from, to_exclusive)` under `epoch` has
    /// resolved. Registers interest before checking to avoid missing a
    /// `notify_waiters()` that fires between the check and the await.
    async fn await_seqs_resolved(&self, epoch: u64, from: u64, to_exclusive: u64) {
        loop {
            let notified = self.0.seq_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.0.state.lock().await;
                if (from..to_exclusive).all(|seq| state.resolved.contains(&(epoch, seq))) {
                    return;
                }
            }
            notified.await;
        }
    }
}
