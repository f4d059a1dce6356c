// ABOUTME: Materializes a change-event stream into typed in-memory collections
// ABOUTME: A background task drives the read session; StreamDb only exposes readers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use durable_streams::stream::StreamHandle;
use durable_streams_core::{DurableStreamError, ErrorKind, LiveMode};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::dispatcher::{CollectionView, Dispatcher};
use crate::schema::{StateEvent, StateSchema};

/// Tracks whether the initial catch-up read has landed, and wakes anyone waiting
/// on it. A plain `Notify::notified().await` would race: if the runner reaches its
/// first commit before a caller starts waiting, `notify_waiters` has no one to wake
/// and the call would hang forever. The flag makes "already caught up" a fast
/// path; `Notified::enable()` closes the remaining race between checking the flag
/// and registering as a waiter.
#[derive(Default)]
struct CaughtUpSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl CaughtUpSignal {
    fn signal(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        if self.flag.load(Ordering::SeqCst) {
            return;
        }
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.flag.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

/// A live, typed materialization of a Durable Streams change-event stream.
///
/// Construction opens the underlying stream in [`LiveMode::Auto`] and spawns a
/// background task that stages each arriving event and commits it into the
/// declared collections once the source reports it is caught up;
/// [`StreamDb::collection`] hands out read-only, always-current views over them.
pub struct StreamDb {
    dispatcher: Arc<Dispatcher>,
    runner: JoinHandle<()>,
    caught_up: Arc<CaughtUpSignal>,
}

impl StreamDb {
    /// Open `handle`'s stream and begin materializing it according to `schema`.
    ///
    /// # Errors
    ///
    /// Propagates any error from opening the initial read session (e.g.
    /// [`ErrorKind::NotFound`]).
    pub async fn open(handle: StreamHandle, schema: StateSchema) -> Result<Self, DurableStreamError> {
        let dispatcher = Arc::new(Dispatcher::new(schema));
        let session = handle.stream(None, LiveMode::Auto, None, None).await?;
        let caught_up = Arc::new(CaughtUpSignal::default());

        let runner = {
            let dispatcher = dispatcher.clone();
            let caught_up = caught_up.clone();
            tokio::spawn(async move {
                run(session, dispatcher, caught_up).await;
            })
        };

        Ok(Self {
            dispatcher,
            runner,
            caught_up,
        })
    }

    /// Wait until the initial catch-up read has been fully applied.
    pub async fn wait_until_caught_up(&self) {
        self.caught_up.wait().await;
    }

    /// Obtain a typed, read-only view onto `name`.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidArgument`] if `name` was not declared in the schema
    /// this `StreamDb` was opened with.
    pub fn collection<T>(&self, name: &str) -> Result<CollectionView<T>, DurableStreamError>
    where
        T: DeserializeOwned,
    {
        self.dispatcher.table(name).map(CollectionView::new).ok_or_else(|| {
            DurableStreamError::new(
                ErrorKind::InvalidArgument,
                format!("collection \"{name}\" was not declared in this schema"),
            )
        })
    }

    /// Wait until a batch carrying `txid` (or later) has been committed — useful
    /// for "read your own writes" after an append whose response named a `txid`.
    pub async fn wait_for_txid(&self, txid: &str) {
        self.dispatcher.wait_for_txid(txid).await;
    }

    /// Stop the background runner. Already-materialized collections remain
    /// readable; no further updates will be applied.
    pub fn close(&self) {
        self.runner.abort();
    }
}

impl Drop for StreamDb {
    fn drop(&mut self) {
        self.runner.abort();
    }
}

async fn run(
    session: durable_streams::session::ReadSession,
    dispatcher: Arc<Dispatcher>,
    caught_up: Arc<CaughtUpSignal>,
) {
    let mut pages = session.iter_json_pages();
    let mut signaled = false;
    while let Some(page) = pages.next().await {
        let (values, up_to_date) = match page {
            Ok(page) => page,
            Err(error) => {
                tracing::warn!(%error, "stream_db: page fetch failed, stopping materialization");
                break;
            }
        };

        if let Err(error) = dispatch_page(&dispatcher, values).await {
            tracing::warn!(%error, "stream_db: stopping materialization on a fatal event");
            dispatcher.fail();
            break;
        }

        if let Err(error) = dispatcher.commit_if_up_to_date(up_to_date).await {
            tracing::warn!(%error, "stream_db: failed to commit staged changes");
            dispatcher.fail();
            break;
        }

        if !signaled && dispatcher.is_ready() {
            signaled = true;
            caught_up.signal();
        }
    }
    if !signaled {
        caught_up.signal();
    }
}

async fn dispatch_page(
    dispatcher: &Dispatcher,
    values: Vec<serde_json::Value>,
) -> Result<(), DurableStreamError> {
    for value in values {
        let event: StateEvent = serde_json::from_value(value).map_err(|e| {
            DurableStreamError::new(ErrorKind::ParseError, "malformed change/control event".to_owned())
                .with_source(e)
        })?;
        match event {
            StateEvent::Change(change) => dispatcher.dispatch_change(change).await?,
            StateEvent::Control(control) => dispatcher.dispatch_control(control).await?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    // `StreamDb::open` requires a live HTTP stream; integration coverage for the
    // runner loop lives under `tests/` with a `wiremock` server. Unit coverage
    // here is limited to what doesn't need a network round trip.
    use super::*;

    #[tokio::test]
    async fn dispatch_page_applies_a_change_event() {
        use crate::schema::{CollectionDefinition, StateSchema};
        use serde::Deserialize;

        #[derive(Debug, Deserialize)]
        struct User {
            name: String,
        }

        let users = CollectionDefinition::<User>::new("users").unwrap();
        let schema = StateSchema::builder().with_collection(&users).unwrap().build();
        let dispatcher = Dispatcher::new(schema);

        let values = vec![serde_json::json!({
            "type": "users",
            "key": "u1",
            "value": {"name": "a"},
            "headers": {"operation": "insert"},
        })];
        dispatch_page(&dispatcher, values).await.unwrap();
        dispatcher.commit_if_up_to_date(true).await.unwrap();

        let view = CollectionView::<User>::new(dispatcher.table("users").unwrap());
        assert_eq!(view.get("u1").await.unwrap().unwrap().name, "a");
    }

    #[tokio::test]
    async fn dispatch_page_rejects_a_malformed_event() {
        let dispatcher = Dispatcher::new(StateSchema::default());
        let values = vec![serde_json::json!({"nonsense": true})];
        let err = dispatch_page(&dispatcher, values).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseError);
    }
}
