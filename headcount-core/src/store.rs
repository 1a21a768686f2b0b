use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::util::Id;

pub type BoxedSessionStore = Box<dyn SessionStore>;
pub type StoreResult<T> = Result<T, StoreError>;

/// A store-assigned number that increases every time a document is written.
pub type Revision = u64;

/// Represents an external document database that shared session state lives in.
///
/// Documents are JSON objects addressed by collection and id. Every write
/// advances the document's [`Revision`], and subscribers to a document are
/// notified of every committed write, including their own.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Fetch a single document.
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Snapshot>;

    /// Create a document that must not exist yet.
    async fn create(&self, collection: &str, id: &str, data: Value) -> StoreResult<Snapshot>;

    /// Write the full contents of a document, creating it if necessary.
    async fn set(&self, collection: &str, id: &str, data: Value) -> StoreResult<Snapshot>;

    /// Write the full contents of an existing document, but only if its
    /// revision still equals `expected`. Fails with [`StoreError::StaleRevision`]
    /// when another writer got there first.
    async fn replace(
        &self,
        collection: &str,
        id: &str,
        expected: Revision,
        data: Value,
    ) -> StoreResult<Snapshot>;

    /// Apply one or more field updates to an existing document as a single
    /// atomic write.
    async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        updates: Vec<FieldUpdate>,
    ) -> StoreResult<Snapshot>;

    /// Delete a document. Subscriptions to it stay registered, since a
    /// document with the same id may be created again later.
    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()>;

    /// Fetch every document in a collection matching the filter.
    async fn query(&self, collection: &str, filter: Filter) -> StoreResult<Vec<Snapshot>>;

    /// Fetch every document in a collection.
    async fn list(&self, collection: &str) -> StoreResult<Vec<Snapshot>>;

    /// Start observing a document. If the document currently exists, the
    /// observer is called with its snapshot straight away, then again for
    /// every subsequent write or deletion until the handle is unsubscribed.
    async fn subscribe(
        &self,
        collection: &str,
        id: &str,
        observer: SnapshotObserver,
    ) -> StoreResult<SubscriptionHandle>;

    /// Stop observing. Safe to call more than once with the same handle.
    async fn unsubscribe(&self, handle: &SubscriptionHandle);
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached at all. Retrying may succeed.
    #[error("store is unavailable: {0}")]
    Unavailable(Box<dyn Error + Send + Sync>),
    #[error("{collection}:{identifier} does not exist")]
    NotFound {
        collection: String,
        identifier: String,
    },
    #[error("{collection}:{identifier} already exists")]
    Conflict {
        collection: String,
        identifier: String,
    },
    /// A conditional write lost a race with another writer.
    #[error("{collection}:{identifier} was modified by someone else")]
    StaleRevision {
        collection: String,
        identifier: String,
    },
    #[error("failed to decode a {collection} document: {source}")]
    Decode {
        collection: String,
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn not_found(collection: &str, identifier: &str) -> Self {
        Self::NotFound {
            collection: collection.to_string(),
            identifier: identifier.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleRevision { .. })
    }
}

/// A full read of a document, as returned by fetches and pushed to subscribers.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub collection: String,
    pub id: String,
    pub revision: Revision,
    pub data: Value,
}

impl Snapshot {
    /// Deserialize the document contents into a typed record.
    pub fn decode<T>(&self) -> StoreResult<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_value(self.data.clone()).map_err(|source| StoreError::Decode {
            collection: self.collection.clone(),
            source,
        })
    }
}

/// An atomic mutation of a single named top-level field.
#[derive(Debug, Clone)]
pub struct FieldUpdate {
    pub field: String,
    pub op: FieldOp,
}

#[derive(Debug, Clone)]
pub enum FieldOp {
    /// Overwrite the field with a new value.
    Set(Value),
    /// Append the values not already present to an array field.
    ArrayUnion(Vec<Value>),
    /// Remove every occurrence of the values from an array field.
    ArrayRemove(Vec<Value>),
}

impl FieldUpdate {
    pub fn set<F, V>(field: F, value: V) -> Self
    where
        F: ToString,
        V: Into<Value>,
    {
        Self {
            field: field.to_string(),
            op: FieldOp::Set(value.into()),
        }
    }

    pub fn union<F>(field: F, values: Vec<Value>) -> Self
    where
        F: ToString,
    {
        Self {
            field: field.to_string(),
            op: FieldOp::ArrayUnion(values),
        }
    }

    pub fn remove<F>(field: F, values: Vec<Value>) -> Self
    where
        F: ToString,
    {
        Self {
            field: field.to_string(),
            op: FieldOp::ArrayRemove(values),
        }
    }
}

/// Criteria for [`SessionStore::query`].
#[derive(Debug, Clone)]
pub enum Filter {
    /// Matches documents where the field equals the value exactly.
    FieldEquals { field: String, value: Value },
    /// Matches documents where an array field contains the value.
    ArrayContains { field: String, value: Value },
}

impl Filter {
    pub fn field_equals<F, V>(field: F, value: V) -> Self
    where
        F: ToString,
        V: Into<Value>,
    {
        Self::FieldEquals {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn array_contains<F, V>(field: F, value: V) -> Self
    where
        F: ToString,
        V: Into<Value>,
    {
        Self::ArrayContains {
            field: field.to_string(),
            value: value.into(),
        }
    }
}

/// A change pushed to a document's subscribers.
#[derive(Debug, Clone)]
pub enum DocumentEvent {
    /// The document was written, or existed when the subscription started.
    Updated(Snapshot),
    /// The document was deleted.
    Deleted { collection: String, id: String },
}

impl DocumentEvent {
    /// The id of the document this event concerns.
    pub fn document_id(&self) -> &str {
        match self {
            Self::Updated(snapshot) => &snapshot.id,
            Self::Deleted { id, .. } => id,
        }
    }
}

/// A callback invoked by the store when an observed document changes.
pub type SnapshotObserver = Arc<dyn Fn(DocumentEvent) + Send + Sync>;

pub type SubscriptionId = Id<SubscriptionHandle>;

/// Owned proof of a live subscription. Observation continues until this is
/// passed back to [`SessionStore::unsubscribe`].
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub collection: String,
    pub document_id: String,
}

impl SubscriptionHandle {
    pub fn new(collection: &str, document_id: &str) -> Self {
        Self {
            id: Id::new(),
            collection: collection.to_string(),
            document_id: document_id.to_string(),
        }
    }
}
