//! In-memory document store with live queries.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

use crate::errors::{CoreError, CoreResult};
use crate::observe::Unsubscribe;
use crate::ports::{
    Document, DocumentQuery, DocumentStore, Fields, Filter, LiveQuery, SnapshotCallback,
};

type SharedCallback = Arc<dyn Fn(CoreResult<Vec<Document>>) + Send + Sync>;

/// Live-query lifecycle as observed by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveLogEntry {
    Opened { id: u64, query: DocumentQuery },
    Closed { id: u64 },
}

struct LiveEntry {
    query: DocumentQuery,
    callback: SharedCallback,
}

#[derive(Default)]
struct StoreState {
    collections: HashMap<String, BTreeMap<String, Fields>>,
    live: BTreeMap<u64, LiveEntry>,
    next_live_id: u64,
    log: Vec<LiveLogEntry>,
    denied: HashSet<String>,
    offline: bool,
}

impl StoreState {
    fn check(&self, collection: &str) -> CoreResult<()> {
        if self.offline {
            return Err(CoreError::TransientNetwork("store unreachable".to_string()));
        }
        if self.denied.contains(collection) {
            return Err(CoreError::Permission(format!(
                "missing or insufficient permissions for {}",
                collection
            )));
        }
        Ok(())
    }

    fn results(&self, query: &DocumentQuery) -> CoreResult<Vec<Document>> {
        self.check(&query.collection)?;
        let mut docs: Vec<Document> = self
            .collections
            .get(&query.collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, fields)| query.filters.iter().all(|f| f.matches(fields)))
                    .map(|(id, fields)| Document {
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        if let Some(order) = &query.order_by {
            docs.sort_by(|a, b| {
                let key = |d: &Document| d.fields.get(&order.field).map(sort_key);
                let ordering = key(a).cmp(&key(b));
                if order.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }
        Ok(docs)
    }

    /// Pending deliveries for every live query over `collection`.
    fn deliveries(&self, collection: &str) -> Vec<(SharedCallback, CoreResult<Vec<Document>>)> {
        self.live
            .values()
            .filter(|entry| entry.query.collection == collection)
            .map(|entry| (entry.callback.clone(), self.results(&entry.query)))
            .collect()
    }
}

fn sort_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct StoreInner {
    state: Mutex<StoreState>,
    reads: AtomicUsize,
    reads_paused: watch::Sender<bool>,
}

impl StoreInner {
    fn deliver(deliveries: Vec<(SharedCallback, CoreResult<Vec<Document>>)>) {
        for (callback, result) in deliveries {
            callback(result);
        }
    }

    async fn wait_for_reads(&self) {
        let mut rx = self.reads_paused.subscribe();
        // A closed channel cannot happen while `self` is alive.
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}

/// Document store held entirely in memory.
#[derive(Clone)]
pub struct MemoryDocumentStore {
    inner: Arc<StoreInner>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        let (reads_paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState::default()),
                reads: AtomicUsize::new(0),
                reads_paused,
            }),
        }
    }

    /// Seed a document without notifying listeners or counting as a client write.
    pub fn insert(&self, collection: &str, id: &str, fields: Fields) {
        self.inner
            .state
            .lock()
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), fields);
    }

    pub fn document(&self, collection: &str, id: &str) -> Option<Fields> {
        self.inner
            .state
            .lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// Reject every operation on `collection` with a permission error.
    pub fn deny(&self, collection: &str) {
        self.inner.state.lock().denied.insert(collection.to_string());
    }

    pub fn set_offline(&self, offline: bool) {
        self.inner.state.lock().offline = offline;
    }

    /// Hold every `get` until [`resume_reads`](Self::resume_reads) is called.
    pub fn pause_reads(&self) {
        self.inner.reads_paused.send_replace(true);
    }

    pub fn resume_reads(&self) {
        self.inner.reads_paused.send_replace(false);
    }

    /// Number of `get` calls issued so far.
    pub fn read_count(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    pub fn active_live_queries(&self) -> usize {
        self.inner.state.lock().live.len()
    }

    pub fn live_log(&self) -> Vec<LiveLogEntry> {
        self.inner.state.lock().log.clone()
    }

    /// Push an error to every live query over `collection`.
    pub fn emit_error(&self, collection: &str, error: CoreError) {
        let callbacks: Vec<SharedCallback> = self
            .inner
            .state
            .lock()
            .live
            .values()
            .filter(|entry| entry.query.collection == collection)
            .map(|entry| entry.callback.clone())
            .collect();
        for callback in callbacks {
            callback(Err(error.clone()));
        }
    }

    fn mutate<F, T>(&self, collection: &str, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut BTreeMap<String, Fields>) -> CoreResult<T>,
    {
        let (out, deliveries) = {
            let mut state = self.inner.state.lock();
            state.check(collection)?;
            let out = f(state.collections.entry(collection.to_string()).or_default())?;
            (out, state.deliveries(collection))
        };
        StoreInner::deliver(deliveries);
        Ok(out)
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryLiveQuery {
    store: Weak<StoreInner>,
    query: DocumentQuery,
}

impl LiveQuery for MemoryLiveQuery {
    fn on_snapshot(&self, callback: SnapshotCallback) -> Unsubscribe {
        let Some(inner) = self.store.upgrade() else {
            return Unsubscribe::noop();
        };
        let callback: SharedCallback = Arc::from(callback);

        let (id, initial) = {
            let mut state = inner.state.lock();
            let id = state.next_live_id;
            state.next_live_id += 1;
            state.live.insert(
                id,
                LiveEntry {
                    query: self.query.clone(),
                    callback: callback.clone(),
                },
            );
            state.log.push(LiveLogEntry::Opened {
                id,
                query: self.query.clone(),
            });
            (id, state.results(&self.query))
        };
        callback(initial);

        let weak = Arc::downgrade(&inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.state.lock();
                if state.live.remove(&id).is_some() {
                    state.log.push(LiveLogEntry::Closed { id });
                }
            }
        })
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn query(&self, query: &DocumentQuery) -> CoreResult<Arc<dyn LiveQuery>> {
        Ok(Arc::new(MemoryLiveQuery {
            store: Arc::downgrade(&self.inner),
            query: query.clone(),
        }))
    }

    async fn get(&self, collection: &str, id: &str) -> CoreResult<Option<Document>> {
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.wait_for_reads().await;

        let state = self.inner.state.lock();
        state.check(collection)?;
        Ok(state
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|fields| Document {
                id: id.to_string(),
                fields: fields.clone(),
            }))
    }

    async fn find(
        &self,
        collection: &str,
        filters: &[Filter],
        limit: Option<usize>,
    ) -> CoreResult<Vec<Document>> {
        let state = self.inner.state.lock();
        let mut docs = state.results(&DocumentQuery {
            collection: collection.to_string(),
            filters: filters.to_vec(),
            order_by: None,
        })?;
        if let Some(limit) = limit {
            docs.truncate(limit);
        }
        Ok(docs)
    }

    async fn create(&self, collection: &str, fields: Fields) -> CoreResult<String> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let doc_id = id.clone();
        self.mutate(collection, move |docs| {
            docs.insert(doc_id, fields);
            Ok(())
        })?;
        Ok(id)
    }

    async fn write(&self, collection: &str, id: &str, patch: Fields) -> CoreResult<()> {
        self.mutate(collection, |docs| {
            let doc = docs.entry(id.to_string()).or_default();
            for (key, value) in patch {
                doc.insert(key, value);
            }
            Ok(())
        })
    }

    async fn append_unique(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        value: Value,
        patch: Fields,
    ) -> CoreResult<bool> {
        self.mutate(collection, |docs| {
            let doc = docs
                .get_mut(id)
                .ok_or_else(|| CoreError::NotFound(format!("{}/{}", collection, id)))?;
            let slot = doc
                .entry(field.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            let Value::Array(items) = slot else {
                return Ok(false);
            };
            if items.contains(&value) {
                return Ok(false);
            }
            items.push(value);
            for (key, value) in patch {
                doc.insert(key, value);
            }
            Ok(true)
        })
    }

    async fn delete(&self, collection: &str, id: &str) -> CoreResult<()> {
        self.mutate(collection, |docs| {
            docs.remove(id);
            Ok(())
        })
    }

    async fn count_of(&self, collection: &str, filters: &[Filter]) -> CoreResult<u64> {
        let state = self.inner.state.lock();
        state.check(collection)?;
        Ok(state
            .collections
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|fields| filters.iter().all(|f| f.matches(fields)))
                    .count() as u64
            })
            .unwrap_or(0))
    }
}
