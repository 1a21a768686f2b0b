use std::sync::Arc;

use async_trait::async_trait;
use crossbeam::atomic::AtomicCell;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use headcount_core::{
    DocumentEvent, FieldOp, FieldUpdate, Filter, Revision, SessionStore, Snapshot,
    SnapshotObserver, StoreError, StoreResult, SubscriptionHandle, SubscriptionId,
};

/// An in-memory [`SessionStore`] with per-document revisions and synchronous
/// subscription fan-out.
///
/// Cloning is cheap and every clone shares the same documents, so separate
/// devices in a test can be given clones of one store. [`MemoryStore::set_offline`]
/// makes every operation fail with [`StoreError::Unavailable`] until the store
/// is brought back online.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    collections: DashMap<String, DashMap<String, StoredDocument>>,
    subscribers: DashMap<SubscriptionId, Subscriber>,
    sequence: AtomicCell<u64>,
    offline: AtomicCell<bool>,
}

#[derive(Clone)]
struct StoredDocument {
    revision: Revision,
    data: Value,
}

struct Subscriber {
    collection: String,
    document_id: String,
    observer: SnapshotObserver,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing or regaining the connection to the backend.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline);
    }

    fn ensure_online(&self) -> StoreResult<()> {
        if self.inner.offline.load() {
            return Err(StoreError::Unavailable("the store is offline".into()));
        }

        Ok(())
    }

    fn next_revision(&self) -> Revision {
        self.inner.sequence.fetch_add(1) + 1
    }

    fn snapshot_of(&self, collection: &str, id: &str) -> Option<Snapshot> {
        let documents = self.inner.collections.get(collection)?;
        let document = documents.get(id)?;

        Some(Snapshot {
            collection: collection.to_string(),
            id: id.to_string(),
            revision: document.revision,
            data: document.data.clone(),
        })
    }

    /// Invoke every observer watching the document. The observers are
    /// collected first so none of them runs while a map shard is locked.
    fn fan_out(&self, event: DocumentEvent) {
        let (collection, id) = match &event {
            DocumentEvent::Updated(snapshot) => (&snapshot.collection, &snapshot.id),
            DocumentEvent::Deleted { collection, id } => (collection, id),
        };

        let observers: Vec<SnapshotObserver> = self
            .inner
            .subscribers
            .iter()
            .filter(|subscriber| {
                subscriber.collection == *collection && subscriber.document_id == *id
            })
            .map(|subscriber| subscriber.observer.clone())
            .collect();

        for observer in observers {
            observer(event.clone());
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Snapshot> {
        self.ensure_online()?;

        self.snapshot_of(collection, id)
            .ok_or_else(|| StoreError::not_found(collection, id))
    }

    async fn create(&self, collection: &str, id: &str, data: Value) -> StoreResult<Snapshot> {
        self.ensure_online()?;

        let snapshot = {
            let documents = self
                .inner
                .collections
                .entry(collection.to_string())
                .or_default();

            // Bound to a local so the entry guard drops before `documents`.
            let created = match documents.entry(id.to_string()) {
                Entry::Occupied(_) => {
                    return Err(StoreError::Conflict {
                        collection: collection.to_string(),
                        identifier: id.to_string(),
                    })
                }
                Entry::Vacant(vacant) => {
                    let revision = self.next_revision();

                    vacant.insert(StoredDocument {
                        revision,
                        data: data.clone(),
                    });

                    Snapshot {
                        collection: collection.to_string(),
                        id: id.to_string(),
                        revision,
                        data,
                    }
                }
            };

            created
        };

        self.fan_out(DocumentEvent::Updated(snapshot.clone()));
        Ok(snapshot)
    }

    async fn set(&self, collection: &str, id: &str, data: Value) -> StoreResult<Snapshot> {
        self.ensure_online()?;

        let snapshot = {
            let documents = self
                .inner
                .collections
                .entry(collection.to_string())
                .or_default();

            let revision = self.next_revision();

            documents.insert(
                id.to_string(),
                StoredDocument {
                    revision,
                    data: data.clone(),
                },
            );

            Snapshot {
                collection: collection.to_string(),
                id: id.to_string(),
                revision,
                data,
            }
        };

        self.fan_out(DocumentEvent::Updated(snapshot.clone()));
        Ok(snapshot)
    }

    async fn replace(
        &self,
        collection: &str,
        id: &str,
        expected: Revision,
        data: Value,
    ) -> StoreResult<Snapshot> {
        self.ensure_online()?;

        let snapshot = {
            let documents = self
                .inner
                .collections
                .get(collection)
                .ok_or_else(|| StoreError::not_found(collection, id))?;

            let mut document = documents
                .get_mut(id)
                .ok_or_else(|| StoreError::not_found(collection, id))?;

            if document.revision != expected {
                return Err(StoreError::StaleRevision {
                    collection: collection.to_string(),
                    identifier: id.to_string(),
                });
            }

            let revision = self.next_revision();

            *document = StoredDocument {
                revision,
                data: data.clone(),
            };

            Snapshot {
                collection: collection.to_string(),
                id: id.to_string(),
                revision,
                data,
            }
        };

        self.fan_out(DocumentEvent::Updated(snapshot.clone()));
        Ok(snapshot)
    }

    async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        updates: Vec<FieldUpdate>,
    ) -> StoreResult<Snapshot> {
        self.ensure_online()?;

        let snapshot = {
            let documents = self
                .inner
                .collections
                .get(collection)
                .ok_or_else(|| StoreError::not_found(collection, id))?;

            let mut document = documents
                .get_mut(id)
                .ok_or_else(|| StoreError::not_found(collection, id))?;

            for update in &updates {
                apply_update(&mut document.data, update);
            }

            let revision = self.next_revision();
            document.revision = revision;

            Snapshot {
                collection: collection.to_string(),
                id: id.to_string(),
                revision,
                data: document.data.clone(),
            }
        };

        self.fan_out(DocumentEvent::Updated(snapshot.clone()));
        Ok(snapshot)
    }

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()> {
        self.ensure_online()?;

        let removed = match self.inner.collections.get(collection) {
            Some(documents) => documents.remove(id),
            None => None,
        };

        if removed.is_none() {
            return Err(StoreError::not_found(collection, id));
        }

        self.fan_out(DocumentEvent::Deleted {
            collection: collection.to_string(),
            id: id.to_string(),
        });

        Ok(())
    }

    async fn query(&self, collection: &str, filter: Filter) -> StoreResult<Vec<Snapshot>> {
        self.ensure_online()?;

        let mut snapshots: Vec<Snapshot> = match self.inner.collections.get(collection) {
            Some(documents) => documents
                .iter()
                .filter(|document| matches_filter(&document.data, &filter))
                .map(|document| Snapshot {
                    collection: collection.to_string(),
                    id: document.key().clone(),
                    revision: document.revision,
                    data: document.data.clone(),
                })
                .collect(),
            None => Vec::new(),
        };

        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(snapshots)
    }

    async fn list(&self, collection: &str) -> StoreResult<Vec<Snapshot>> {
        self.ensure_online()?;

        let mut snapshots: Vec<Snapshot> = match self.inner.collections.get(collection) {
            Some(documents) => documents
                .iter()
                .map(|document| Snapshot {
                    collection: collection.to_string(),
                    id: document.key().clone(),
                    revision: document.revision,
                    data: document.data.clone(),
                })
                .collect(),
            None => Vec::new(),
        };

        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(snapshots)
    }

    async fn subscribe(
        &self,
        collection: &str,
        id: &str,
        observer: SnapshotObserver,
    ) -> StoreResult<SubscriptionHandle> {
        self.ensure_online()?;

        let handle = SubscriptionHandle::new(collection, id);

        self.inner.subscribers.insert(
            handle.id,
            Subscriber {
                collection: collection.to_string(),
                document_id: id.to_string(),
                observer: observer.clone(),
            },
        );

        if let Some(snapshot) = self.snapshot_of(collection, id) {
            observer(DocumentEvent::Updated(snapshot));
        }

        Ok(handle)
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.inner.subscribers.remove(&handle.id);
    }
}

fn apply_update(data: &mut Value, update: &FieldUpdate) {
    let Some(object) = data.as_object_mut() else {
        return;
    };

    match &update.op {
        FieldOp::Set(value) => {
            object.insert(update.field.clone(), value.clone());
        }
        FieldOp::ArrayUnion(values) => {
            let entry = object
                .entry(update.field.clone())
                .or_insert_with(|| Value::Array(Vec::new()));

            // A non-array field is overwritten, like the real thing does.
            if !entry.is_array() {
                *entry = Value::Array(Vec::new());
            }

            if let Value::Array(array) = entry {
                for value in values {
                    if !array.contains(value) {
                        array.push(value.clone());
                    }
                }
            }
        }
        FieldOp::ArrayRemove(values) => {
            let entry = object
                .entry(update.field.clone())
                .or_insert_with(|| Value::Array(Vec::new()));

            if !entry.is_array() {
                *entry = Value::Array(Vec::new());
            }

            if let Value::Array(array) = entry {
                array.retain(|existing| !values.contains(existing));
            }
        }
    }
}

fn matches_filter(data: &Value, filter: &Filter) -> bool {
    match filter {
        Filter::FieldEquals { field, value } => data.get(field) == Some(value),
        Filter::ArrayContains { field, value } => data
            .get(field)
            .and_then(Value::as_array)
            .map(|array| array.contains(value))
            .unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use crossbeam::channel::unbounded;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn creates_and_fetches_documents() {
        let store = MemoryStore::new();

        store
            .create("party", "a", json!({ "name": "Picnic" }))
            .await
            .unwrap();

        let snapshot = store.get("party", "a").await.unwrap();
        assert_eq!(snapshot.data["name"], "Picnic");

        let error = store.create("party", "a", json!({})).await.unwrap_err();
        assert!(matches!(error, StoreError::Conflict { .. }));

        let error = store.get("party", "missing").await.unwrap_err();
        assert!(matches!(error, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn replace_rejects_stale_revisions() {
        let store = MemoryStore::new();

        let first = store
            .create("party", "a", json!({ "name": "Picnic" }))
            .await
            .unwrap();

        let second = store
            .replace("party", "a", first.revision, json!({ "name": "Brunch" }))
            .await
            .unwrap();

        assert!(second.revision > first.revision);

        let error = store
            .replace("party", "a", first.revision, json!({ "name": "Dinner" }))
            .await
            .unwrap_err();

        assert!(matches!(error, StoreError::StaleRevision { .. }));
        assert_eq!(store.get("party", "a").await.unwrap().data["name"], "Brunch");
    }

    #[tokio::test]
    async fn field_updates_apply_in_one_write() {
        let store = MemoryStore::new();

        store
            .create("party", "a", json!({ "people": [] }))
            .await
            .unwrap();

        let before = store.get("party", "a").await.unwrap().revision;

        let snapshot = store
            .update_fields(
                "party",
                "a",
                vec![
                    FieldUpdate::union("people", vec![json!({ "id": "p1" })]),
                    FieldUpdate::set("updatedAt", "2026-08-22T10:00:00Z"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(snapshot.revision, before + 1);
        assert_eq!(snapshot.data["people"].as_array().unwrap().len(), 1);
        assert_eq!(snapshot.data["updatedAt"], "2026-08-22T10:00:00Z");

        // Unioning the same value twice keeps a single copy.
        let snapshot = store
            .update_fields(
                "party",
                "a",
                vec![FieldUpdate::union("people", vec![json!({ "id": "p1" })])],
            )
            .await
            .unwrap();

        assert_eq!(snapshot.data["people"].as_array().unwrap().len(), 1);

        let snapshot = store
            .update_fields(
                "party",
                "a",
                vec![FieldUpdate::remove("people", vec![json!({ "id": "p1" })])],
            )
            .await
            .unwrap();

        assert!(snapshot.data["people"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscribers_receive_current_and_subsequent_snapshots() {
        let store = MemoryStore::new();
        let (sender, receiver) = unbounded();

        store
            .create("party", "a", json!({ "name": "Picnic" }))
            .await
            .unwrap();

        let observer: SnapshotObserver = Arc::new(move |event| {
            sender.send(event).unwrap();
        });

        let handle = store.subscribe("party", "a", observer).await.unwrap();

        // The current contents arrive immediately.
        let event = receiver.try_recv().unwrap();
        assert!(matches!(event, DocumentEvent::Updated(ref snapshot) if snapshot.data["name"] == "Picnic"));

        store
            .set("party", "a", json!({ "name": "Brunch" }))
            .await
            .unwrap();

        let event = receiver.try_recv().unwrap();
        assert!(matches!(event, DocumentEvent::Updated(ref snapshot) if snapshot.data["name"] == "Brunch"));

        store.delete("party", "a").await.unwrap();

        let event = receiver.try_recv().unwrap();
        assert!(matches!(event, DocumentEvent::Deleted { ref id, .. } if id == "a"));

        store.unsubscribe(&handle).await;
        store.unsubscribe(&handle).await;

        store
            .set("party", "a", json!({ "name": "Dinner" }))
            .await
            .unwrap();

        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn offline_store_refuses_operations() {
        let store = MemoryStore::new();

        store.create("party", "a", json!({})).await.unwrap();
        store.set_offline(true);

        let error = store.get("party", "a").await.unwrap_err();
        assert!(matches!(error, StoreError::Unavailable(_)));

        let error = store.set("party", "a", json!({})).await.unwrap_err();
        assert!(matches!(error, StoreError::Unavailable(_)));

        store.set_offline(false);
        assert!(store.get("party", "a").await.is_ok());
    }

    #[tokio::test]
    async fn queries_filter_documents() {
        let store = MemoryStore::new();

        store
            .create("party", "a", json!({ "passcode": "111111", "editors": ["u1"] }))
            .await
            .unwrap();
        store
            .create("party", "b", json!({ "passcode": "222222", "editors": ["u1", "u2"] }))
            .await
            .unwrap();
        store
            .create("party", "c", json!({ "passcode": "222222", "editors": [] }))
            .await
            .unwrap();

        let by_passcode = store
            .query("party", Filter::field_equals("passcode", "222222"))
            .await
            .unwrap();

        assert_eq!(by_passcode.len(), 2);
        assert_eq!(by_passcode[0].id, "b");

        let by_editor = store
            .query("party", Filter::array_contains("editors", "u2"))
            .await
            .unwrap();

        assert_eq!(by_editor.len(), 1);
        assert_eq!(by_editor[0].id, "b");

        let everything = store.list("party").await.unwrap();
        assert_eq!(everything.len(), 3);
    }
}
