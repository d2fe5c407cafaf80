//! In-process document store with live queries.

use super::{Delivery, DocumentSource, Listener, ListenerHandle};
use crate::error::SourceError;
use crate::types::{ChangeSet, Document, DocumentId, Query};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Unique identifier for a listener registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Internal listener state.
struct Registration {
    query: Query,
    listener: Arc<dyn Fn(Delivery) + Send + Sync>,
}

struct Registry {
    /// Documents by (collection, key).
    documents: RwLock<HashMap<(String, DocumentId), Document>>,
    /// Live listeners by ID.
    listeners: RwLock<HashMap<ListenerId, Registration>>,
    /// Counter for generating listener IDs.
    next_id: AtomicU64,
    /// Listeners ever opened.
    opened: AtomicU64,
    /// Listeners ever cancelled.
    cancelled: AtomicU64,
}

impl Registry {
    fn unregister(&self, id: ListenerId) {
        if self.listeners.write().remove(&id).is_some() {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            debug!(listener = id.0, "listener cancelled");
        }
    }
}

/// Handle for a listener on a [`MemoryDocumentStore`].
pub struct MemoryListenerHandle {
    id: ListenerId,
    registry: Weak<Registry>,
    cancelled: AtomicBool,
}

impl MemoryListenerHandle {
    pub fn id(&self) -> ListenerId {
        self.id
    }
}

impl ListenerHandle for MemoryListenerHandle {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Document store kept in memory.
///
/// Listeners are invoked on the writer's thread after all internal locks
/// are released, so a listener may open or cancel other listeners.
/// Deliveries caused by concurrent writers may interleave.
#[derive(Clone)]
pub struct MemoryDocumentStore {
    registry: Arc<Registry>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                documents: RwLock::new(HashMap::new()),
                listeners: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                opened: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
            }),
        }
    }

    // --- Writes ---

    /// Insert or replace a document.
    pub fn put(&self, doc: Document) {
        self.write_batch(vec![doc]);
    }

    /// Insert or replace several documents; each listener receives at most
    /// one delivery for the whole batch.
    pub fn write_batch(&self, docs: Vec<Document>) {
        let mut changes: Vec<(Document, Option<Document>)> = Vec::with_capacity(docs.len());
        {
            let mut documents = self.registry.documents.write();
            for doc in docs {
                let previous = documents.insert((doc.collection.clone(), doc.key()), doc.clone());
                changes.push((doc, previous));
            }
        }

        let deliveries = self.collect(|query| {
            let mut set = ChangeSet::default();
            for (doc, previous) in &changes {
                if query.matches(doc) {
                    set.upserted.push(doc.clone());
                } else if previous.as_ref().is_some_and(|p| query.matches(p)) {
                    set.removed.push(doc.key());
                }
            }
            set
        });
        Self::dispatch(deliveries);
    }

    /// Delete a document by collection and key. Returns the removed document.
    pub fn delete(&self, collection: &str, key: &DocumentId) -> Option<Document> {
        let removed = self
            .registry
            .documents
            .write()
            .remove(&(collection.to_string(), key.clone()))?;

        let deliveries = self.collect(|query| {
            if query.matches(&removed) {
                ChangeSet::removals(vec![removed.key()])
            } else {
                ChangeSet::default()
            }
        });
        Self::dispatch(deliveries);
        Some(removed)
    }

    /// Deliver `error` to every listener whose query satisfies `predicate`.
    /// Returns the number of listeners notified.
    pub fn fail_matching<F>(&self, predicate: F, error: SourceError) -> usize
    where
        F: Fn(&Query) -> bool,
    {
        let targets: Vec<_> = {
            let listeners = self.registry.listeners.read();
            listeners
                .values()
                .filter(|reg| predicate(&reg.query))
                .map(|reg| Arc::clone(&reg.listener))
                .collect()
        };
        for listener in &targets {
            listener(Err(error.clone()));
        }
        targets.len()
    }

    // --- Reads ---

    pub fn get(&self, collection: &str, key: &DocumentId) -> Option<Document> {
        self.registry
            .documents
            .read()
            .get(&(collection.to_string(), key.clone()))
            .cloned()
    }

    /// Current documents matching a query, in the query's order.
    pub fn query(&self, query: &Query) -> Vec<Document> {
        let mut docs: Vec<Document> = self
            .registry
            .documents
            .read()
            .values()
            .filter(|doc| query.matches(doc))
            .cloned()
            .collect();
        sort_for_query(query, &mut docs);
        docs
    }

    pub fn document_count(&self) -> usize {
        self.registry.documents.read().len()
    }

    // --- Listener accounting ---

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        self.registry.listeners.read().len()
    }

    /// Queries of all live listeners.
    pub fn active_queries(&self) -> Vec<Query> {
        self.registry
            .listeners
            .read()
            .values()
            .map(|reg| reg.query.clone())
            .collect()
    }

    /// Listeners opened over the store's lifetime.
    pub fn opened_count(&self) -> u64 {
        self.registry.opened.load(Ordering::SeqCst)
    }

    /// Listeners cancelled over the store's lifetime.
    pub fn cancelled_count(&self) -> u64 {
        self.registry.cancelled.load(Ordering::SeqCst)
    }

    // --- Internals ---

    /// Build a change set per live listener; empty sets are skipped.
    fn collect<F>(&self, mut changes_for: F) -> Vec<(Arc<dyn Fn(Delivery) + Send + Sync>, ChangeSet)>
    where
        F: FnMut(&Query) -> ChangeSet,
    {
        let listeners = self.registry.listeners.read();
        let mut deliveries = Vec::new();
        for reg in listeners.values() {
            let mut set = changes_for(&reg.query);
            if !set.is_empty() {
                sort_for_query(&reg.query, &mut set.upserted);
                deliveries.push((Arc::clone(&reg.listener), set));
            }
        }
        deliveries
    }

    /// Invoke listeners with no locks held.
    fn dispatch(deliveries: Vec<(Arc<dyn Fn(Delivery) + Send + Sync>, ChangeSet)>) {
        for (listener, set) in deliveries {
            listener(Ok(set));
        }
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentSource for MemoryDocumentStore {
    fn listen(&self, query: Query, listener: Listener) -> Box<dyn ListenerHandle> {
        let id = ListenerId(self.registry.next_id.fetch_add(1, Ordering::SeqCst));
        let listener: Arc<dyn Fn(Delivery) + Send + Sync> = Arc::from(listener);

        // Register before reading so no concurrent write falls in between.
        self.registry.listeners.write().insert(
            id,
            Registration {
                query: query.clone(),
                listener: Arc::clone(&listener),
            },
        );
        self.registry.opened.fetch_add(1, Ordering::SeqCst);

        let initial = self.query(&query);
        debug!(listener = id.0, ?query, initial = initial.len(), "listener opened");
        listener(Ok(ChangeSet::upserts(initial)));

        Box::new(MemoryListenerHandle {
            id,
            registry: Arc::downgrade(&self.registry),
            cancelled: AtomicBool::new(false),
        })
    }
}

/// Posts come newest first; everything else by key.
fn sort_for_query(query: &Query, docs: &mut [Document]) {
    match query {
        Query::ApprovedPosts { .. } => docs.sort_by(|a, b| {
            b.i64_field("createdAt")
                .cmp(&a.i64_field("createdAt"))
                .then_with(|| a.id.cmp(&b.id))
        }),
        _ => docs.sort_by_key(Document::key),
    }
}
