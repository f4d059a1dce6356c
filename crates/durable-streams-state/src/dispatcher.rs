// ABOUTME: Stages change-event batches and applies them atomically once caught up
// ABOUTME: Nothing lands in a live table until commit_if_up_to_date(true) runs

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use durable_streams_core::{DurableStreamError, ErrorKind};
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, Notify, RwLock};

use crate::schema::{ChangeEvent, ChangeOp, ControlEvent, StateSchema};

/// A normalized mutation, after upsert has been promoted to insert or update based
/// on whether the key was already known.
#[derive(Debug, Clone)]
pub enum CollectionChange {
    /// A new row. The key must not already exist.
    Insert { key: String, value: serde_json::Value },
    /// An existing row's value is replaced. The key must already exist.
    Update { key: String, value: serde_json::Value },
    /// A row is removed. The key must already exist.
    Delete { key: String },
}

impl CollectionChange {
    fn key(&self) -> &str {
        match self {
            Self::Insert { key, .. } | Self::Update { key, .. } | Self::Delete { key } => key,
        }
    }
}

type Subscriber = Arc<dyn Fn(&[CollectionChange]) + Send + Sync>;

#[derive(Default)]
struct SubscriberList {
    next_id: AtomicU64,
    subscribers: std::sync::Mutex<Vec<(u64, Subscriber)>>,
}

impl SubscriberList {
    fn add(&self, callback: Subscriber) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, callback));
        id
    }

    fn remove(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(existing, _)| *existing != id);
    }

    fn notify(&self, changes: &[CollectionChange]) {
        if changes.is_empty() {
            return;
        }
        for (_, callback) in self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).iter() {
            callback(changes);
        }
    }
}

/// One collection's live rows, pending (uncommitted) changes, and subscribers.
struct CollectionState {
    rows: RwLock<HashMap<String, serde_json::Value>>,
    pending: Mutex<Vec<CollectionChange>>,
    subscribers: SubscriberList,
}

impl CollectionState {
    fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            subscribers: SubscriberList::default(),
        }
    }
}

pub(crate) type Table = Arc<CollectionState>;

/// A live subscription to one collection's applied changes, created by
/// [`CollectionView::subscribe`]. Dropping this without calling [`Self::unsubscribe`]
/// leaves the callback registered; call it explicitly to stop receiving changes.
pub struct Subscription {
    table: Table,
    id: u64,
}

impl Subscription {
    /// Stop receiving changes on this subscription.
    pub fn unsubscribe(self) {
        self.table.subscribers.remove(self.id);
    }
}

/// Owns every collection's materialized table, stages incoming events, and applies
/// a batch atomically only once the source reports it is caught up.
pub struct Dispatcher {
    tables: HashMap<String, Table>,
    ready: AtomicBool,
    failed: AtomicBool,
    applied_txids: RwLock<HashSet<String>>,
    pending_txids: Mutex<HashSet<String>>,
    txid_notify: Notify,
}

impl Dispatcher {
    #[must_use]
    pub(crate) fn new(schema: StateSchema) -> Self {
        let tables = schema
            .collection_names()
            .map(|name| (name.to_owned(), Arc::new(CollectionState::new())))
            .collect();
        Self {
            tables,
            ready: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            applied_txids: RwLock::new(HashSet::new()),
            pending_txids: Mutex::new(HashSet::new()),
            txid_notify: Notify::new(),
        }
    }

    pub(crate) fn table(&self, name: &str) -> Option<Table> {
        self.tables.get(name).cloned()
    }

    /// Whether at least one commit has landed.
    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Stage one change event. Events naming a collection absent from the schema
    /// are silently dropped, matching a reader that only cares about the
    /// collections it declared.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InternalError`] if a non-`delete` event carries a value that
    /// isn't a JSON object — a malformed source is unrecoverable for this client.
    pub async fn dispatch_change(&self, event: ChangeEvent) -> Result<(), DurableStreamError> {
        let Some(table) = self.tables.get(&event.collection) else {
            return Ok(());
        };

        let mut pending = table.pending.lock().await;
        let known = known_after_pending(&*table.rows.read().await, &pending, &event.key);
        let change = normalize(&event, known)?;
        pending.push(change);
        drop(pending);

        if let Some(txid) = event.txid {
            self.pending_txids.lock().await.insert(txid);
        }
        Ok(())
    }

    /// Apply a control event. `"reset"` discards every staged and committed row
    /// and clears readiness; other control kinds (e.g. snapshot markers) are
    /// acknowledged but otherwise don't change any collection's contents.
    pub async fn dispatch_control(&self, event: ControlEvent) -> Result<(), DurableStreamError> {
        if event.control == "reset" {
            for table in self.tables.values() {
                table.pending.lock().await.clear();
                table.rows.write().await.clear();
            }
            self.pending_txids.lock().await.clear();
            self.ready.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Apply every collection's staged changes to its live table, but only if
    /// `up_to_date`. Called after every event the runner reads, not just at the
    /// end of a page, so "caught up" always triggers a commit regardless of where
    /// in a page it lands.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InternalError`] if an `insert` targets an existing key or an
    /// `update`/`delete` targets a missing one.
    pub async fn commit_if_up_to_date(&self, up_to_date: bool) -> Result<(), DurableStreamError> {
        if !up_to_date {
            return Ok(());
        }

        for table in self.tables.values() {
            let mut pending = table.pending.lock().await;
            if pending.is_empty() {
                continue;
            }
            let changes = std::mem::take(&mut *pending);
            drop(pending);

            let mut rows = table.rows.write().await;
            for change in &changes {
                apply_change(&mut rows, change.clone())?;
            }
            drop(rows);
            table.subscribers.notify(&changes);
        }

        self.ready.store(true, Ordering::SeqCst);
        let txids = std::mem::take(&mut *self.pending_txids.lock().await);
        if !txids.is_empty() {
            self.applied_txids.write().await.extend(txids);
            self.txid_notify.notify_waiters();
        }
        Ok(())
    }

    /// Mark the materialization as permanently failed and wake every waiter so
    /// `wait_for_txid` doesn't hang forever on a txid that will never commit.
    pub(crate) fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.txid_notify.notify_waiters();
    }

    /// Wait until a batch carrying `txid` has been committed, or the
    /// materialization has failed.
    pub async fn wait_for_txid(&self, txid: &str) {
        loop {
            if self.failed.load(Ordering::SeqCst) {
                return;
            }
            {
                let applied = self.applied_txids.read().await;
                if applied.contains(txid) {
                    return;
                }
            }
            self.txid_notify.notified().await;
        }
    }
}

fn known_after_pending(
    rows: &HashMap<String, serde_json::Value>,
    pending: &[CollectionChange],
    key: &str,
) -> bool {
    let mut known = rows.contains_key(key);
    for change in pending {
        if change.key() != key {
            continue;
        }
        known = !matches!(change, CollectionChange::Delete { .. });
    }
    known
}

fn normalize(event: &ChangeEvent, known: bool) -> Result<CollectionChange, DurableStreamError> {
    match event.op {
        ChangeOp::Insert => Ok(CollectionChange::Insert {
            key: event.key.clone(),
            value: require_object_value(event)?,
        }),
        ChangeOp::Update => Ok(CollectionChange::Update {
            key: event.key.clone(),
            value: require_object_value(event)?,
        }),
        ChangeOp::Delete => Ok(CollectionChange::Delete {
            key: event.key.clone(),
        }),
        ChangeOp::Upsert if known => Ok(CollectionChange::Update {
            key: event.key.clone(),
            value: require_object_value(event)?,
        }),
        ChangeOp::Upsert => Ok(CollectionChange::Insert {
            key: event.key.clone(),
            value: require_object_value(event)?,
        }),
    }
}

fn require_object_value(event: &ChangeEvent) -> Result<serde_json::Value, DurableStreamError> {
    match &event.value {
        Some(value) if value.is_object() => Ok(value.clone()),
        _ => Err(DurableStreamError::new(
            ErrorKind::InternalError,
            format!(
                "{:?} event for \"{}\" in \"{}\" did not carry an object value",
                event.op, event.key, event.collection
            ),
        )),
    }
}

fn apply_change(
    rows: &mut HashMap<String, serde_json::Value>,
    change: CollectionChange,
) -> Result<(), DurableStreamError> {
    match change {
        CollectionChange::Insert { key, value } => {
            if rows.contains_key(&key) {
                return Err(DurableStreamError::new(
                    ErrorKind::InternalError,
                    format!("insert for existing key \"{key}\""),
                ));
            }
            rows.insert(key, value);
        }
        CollectionChange::Update { key, value } => {
            if !rows.contains_key(&key) {
                return Err(DurableStreamError::new(
                    ErrorKind::InternalError,
                    format!("update for missing key \"{key}\""),
                ));
            }
            rows.insert(key, value);
        }
        CollectionChange::Delete { key } => {
            if rows.remove(&key).is_none() {
                return Err(DurableStreamError::new(
                    ErrorKind::InternalError,
                    format!("delete for missing key \"{key}\""),
                ));
            }
        }
    }
    Ok(())
}

/// A typed, read-only view onto one materialized collection.
pub struct CollectionView<T> {
    table: Table,
    _marker: PhantomData<fn() -> T>,
}

impl<T> CollectionView<T>
where
    T: DeserializeOwned,
{
    pub(crate) fn new(table: Table) -> Self {
        Self {
            table,
            _marker: PhantomData,
        }
    }

    /// Look up one row by key.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::ParseError`] if the stored value no longer matches `T`.
    pub async fn get(&self, key: &str) -> Result<Option<T>, DurableStreamError> {
        let rows = self.table.rows.read().await;
        rows.get(key)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|e| {
                    DurableStreamError::new(
                        ErrorKind::ParseError,
                        format!("row \"{key}\" did not match the declared collection type"),
                    )
                    .with_source(e)
                })
            })
            .transpose()
    }

    /// Number of rows currently materialized.
    pub async fn len(&self) -> usize {
        self.table.rows.read().await.len()
    }

    /// Whether the collection currently has no rows.
    pub async fn is_empty(&self) -> bool {
        self.table.rows.read().await.is_empty()
    }

    /// Every row's key.
    pub async fn keys(&self) -> Vec<String> {
        self.table.rows.read().await.keys().cloned().collect()
    }

    /// Subscribe to changes applied to this collection. `callback` is invoked
    /// synchronously, once per commit, with every [`CollectionChange`] that
    /// landed in that commit.
    pub fn subscribe(&self, callback: impl Fn(&[CollectionChange]) + Send + Sync + 'static) -> Subscription {
        let id = self.table.subscribers.add(Arc::new(callback));
        Subscription {
            table: self.table.clone(),
            id,
        }
    }
}
