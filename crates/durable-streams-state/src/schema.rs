// ABOUTME: Typed collection schema declarations and the change/control-event wire shape
// ABOUTME: Validates collection names and shape before any events are applied

use std::collections::HashMap;
use std::marker::PhantomData;

use durable_streams_core::{DurableStreamError, ErrorKind};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};

/// Names `StreamDb` exposes as real struct members/methods; a change-event stream
/// declaring a collection under one of these would shadow part of the API.
const RESERVED_COLLECTION_NAMES: &[&str] = &["collections", "preload", "close", "utils"];

/// A single collection's declared row type, identified by name within a
/// [`StateSchema`].
pub struct CollectionDefinition<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> CollectionDefinition<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    /// Declare a collection named `name`, materializing rows of type `T`.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidArgument`] if `name` is reserved or empty.
    pub fn new(name: impl Into<String>) -> Result<Self, DurableStreamError> {
        let name = name.into();
        validate_collection_name(&name)?;
        Ok(Self {
            name,
            _marker: PhantomData,
        })
    }

    /// The collection's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn validate_collection_name(name: &str) -> Result<(), DurableStreamError> {
    if name.is_empty() {
        return Err(DurableStreamError::new(
            ErrorKind::InvalidArgument,
            "collection name must not be empty".to_owned(),
        ));
    }
    if RESERVED_COLLECTION_NAMES.contains(&name) {
        return Err(DurableStreamError::new(
            ErrorKind::InvalidArgument,
            format!("\"{name}\" is a reserved collection name"),
        ));
    }
    Ok(())
}

/// A registered set of collection names a [`crate::stream_db::StreamDb`] will
/// materialize, built with [`StateSchema::builder`].
#[derive(Debug, Clone, Default)]
pub struct StateSchema {
    names: HashMap<String, ()>,
}

/// Builds a [`StateSchema`], rejecting reserved or duplicate collection names
/// before any stream connection is opened.
#[derive(Debug, Clone, Default)]
pub struct StateSchemaBuilder {
    names: HashMap<String, ()>,
}

impl StateSchema {
    /// Start building a schema.
    #[must_use]
    pub fn builder() -> StateSchemaBuilder {
        StateSchemaBuilder::default()
    }

    /// Collection names declared in this schema.
    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.names.keys().map(String::as_str)
    }

    /// Whether `name` was declared in this schema.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }
}

impl StateSchemaBuilder {
    /// Register a collection declared by `definition`.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidArgument`] if the name was already registered.
    pub fn with_collection<T>(
        mut self,
        definition: &CollectionDefinition<T>,
    ) -> Result<Self, DurableStreamError> {
        if self.names.insert(definition.name().to_owned(), ()).is_some() {
            return Err(DurableStreamError::new(
                ErrorKind::InvalidArgument,
                format!("collection \"{}\" is already registered", definition.name()),
            ));
        }
        Ok(self)
    }

    /// Finish building the schema.
    #[must_use]
    pub fn build(self) -> StateSchema {
        StateSchema { names: self.names }
    }
}

/// The mutation kind carried by a [`ChangeEvent`], read from its `headers.operation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    /// Row must not already exist.
    Insert,
    /// Row must already exist.
    Update,
    /// Row must already exist; removed after this event.
    Delete,
    /// Insert if the key is unknown, update otherwise.
    Upsert,
}

impl ChangeOp {
    fn from_wire(value: &str) -> Result<Self, String> {
        match value {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "upsert" => Ok(Self::Upsert),
            other => Err(format!("unknown change operation \"{other}\"")),
        }
    }
}

/// A single change-event as it arrives on the wire: one mutation to one row of one
/// collection.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// The target collection name (the event's `type`).
    pub collection: String,
    /// `insert`, `update`, `delete`, or `upsert`.
    pub op: ChangeOp,
    /// The row's primary key.
    pub key: String,
    /// The row's new value. Always present except for `delete`.
    pub value: Option<serde_json::Value>,
    /// The row's value before this event, if the source sent one.
    pub old_value: Option<serde_json::Value>,
    /// Groups events that must become visible atomically.
    pub txid: Option<String>,
    /// Source-assigned event timestamp, opaque to this client.
    pub timestamp: Option<String>,
}

/// A control event: stream-level bookkeeping rather than a row mutation.
#[derive(Debug, Clone)]
pub struct ControlEvent {
    /// `"reset"`, `"snapshot-start"`, `"snapshot-end"`, or another source-defined
    /// control kind.
    pub control: String,
    /// The offset this control event applies to, if the source sent one.
    pub offset: Option<String>,
}

/// One event off a change-event stream, discriminated by whether its `headers`
/// carried `operation` or `control`.
#[derive(Debug, Clone)]
pub enum StateEvent {
    Change(ChangeEvent),
    Control(ControlEvent),
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawHeaders {
    operation: Option<String>,
    control: Option<String>,
    txid: Option<String>,
    timestamp: Option<String>,
    offset: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    collection: Option<String>,
    key: Option<String>,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    old_value: Option<serde_json::Value>,
    #[serde(default)]
    headers: RawHeaders,
}

impl<'de> Deserialize<'de> for StateEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawEvent::deserialize(deserializer)?;
        if let Some(control) = raw.headers.control {
            return Ok(Self::Control(ControlEvent {
                control,
                offset: raw.headers.offset,
            }));
        }
        let operation = raw
            .headers
            .operation
            .ok_or_else(|| D::Error::custom("event headers had neither \"operation\" nor \"control\""))?;
        let op = ChangeOp::from_wire(&operation).map_err(D::Error::custom)?;
        let collection = raw
            .collection
            .ok_or_else(|| D::Error::custom("change event was missing \"type\""))?;
        let key = raw
            .key
            .ok_or_else(|| D::Error::custom("change event was missing \"key\""))?;
        Ok(Self::Change(ChangeEvent {
            collection,
            op,
            key,
            value: raw.value,
            old_value: raw.old_value,
            txid: raw.headers.txid,
            timestamp: raw.headers.timestamp,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_collection_name_is_rejected() {
        let err = CollectionDefinition::<serde_json::Value>::new("close").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn duplicate_collection_registration_is_rejected() {
        let users = CollectionDefinition::<serde_json::Value>::new("users").unwrap();
        let users_again = CollectionDefinition::<serde_json::Value>::new("users").unwrap();
        let err = StateSchema::builder()
            .with_collection(&users)
            .unwrap()
            .with_collection(&users_again)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn change_event_deserializes_from_the_real_wire_shape() {
        let event: StateEvent = serde_json::from_str(
            r#"{"type":"users","key":"u1","value":{"name":"a"},"headers":{"operation":"upsert","txid":"tx-9"}}"#,
        )
        .unwrap();
        match event {
            StateEvent::Change(change) => {
                assert_eq!(change.collection, "users");
                assert_eq!(change.op, ChangeOp::Upsert);
                assert_eq!(change.key, "u1");
                assert_eq!(change.txid.as_deref(), Some("tx-9"));
            }
            StateEvent::Control(_) => panic!("expected a change event"),
        }
    }

    #[test]
    fn control_event_deserializes_from_the_real_wire_shape() {
        let event: StateEvent =
            serde_json::from_str(r#"{"headers":{"control":"reset","offset":"abc"}}"#).unwrap();
        match event {
            StateEvent::Control(control) => {
                assert_eq!(control.control, "reset");
                assert_eq!(control.offset.as_deref(), Some("abc"));
            }
            StateEvent::Change(_) => panic!("expected a control event"),
        }
    }

    #[test]
    fn event_with_neither_operation_nor_control_is_rejected() {
        let err = serde_json::from_str::<StateEvent>(r#"{"type":"users","key":"u1","headers":{}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("neither"));
    }

    #[test]
    fn unknown_operation_is_rejected() {
        let err = serde_json::from_str::<StateEvent>(
            r#"{"type":"users","key":"u1","headers":{"operation":"replace"}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown change operation"));
    }
}
