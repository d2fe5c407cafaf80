//! Keyed, mutex-guarded collection merged from every dependent listener.

use crate::model::FeedItem;
use crate::subscriptions::FeedEvent;
use crate::types::Generation;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::collections::HashMap;

/// A batch of changes from one dependent delivery.
#[derive(Clone, Debug)]
pub struct Batch<T> {
    pub upserted: Vec<T>,
    pub removed: Vec<String>,
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self {
            upserted: Vec::new(),
            removed: Vec::new(),
        }
    }
}

/// What happened to a generation-checked batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Mutations applied and a snapshot emitted.
    Applied,
    /// The batch came from a retired generation (or the store is sealed).
    Stale,
    /// The gate refused; nothing was applied or emitted.
    Gated,
}

struct StoreInner<T> {
    items: HashMap<String, T>,
    generation: Generation,
    /// No further mutations or snapshots once set.
    sealed: bool,
    output: Option<Sender<FeedEvent<T>>>,
}

impl<T: FeedItem> StoreInner<T> {
    fn snapshot(&self) -> Vec<T> {
        let mut items: Vec<T> = self.items.values().cloned().collect();
        items.sort_by(T::feed_order);
        items
    }

    fn emit(&self) {
        if let Some(ref output) = self.output {
            let event = FeedEvent::Snapshot {
                generation: self.generation,
                items: self.snapshot(),
            };
            // A consumer that went away is handled by unsubscribe, not here.
            let _ = output.send(event);
        }
    }
}

/// Aggregation store shared by all dependent listeners of one feed.
///
/// Every read and write goes through a single mutex, and snapshots are
/// pushed to the output while that mutex is held, so consumers observe
/// snapshots in the order mutations were applied.
pub struct AggregationStore<T: FeedItem> {
    inner: Mutex<StoreInner<T>>,
}

impl<T: FeedItem> AggregationStore<T> {
    /// Create a store without an output channel.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                items: HashMap::new(),
                generation: Generation::default(),
                sealed: false,
                output: None,
            }),
        }
    }

    /// Create a store that pushes a snapshot to `output` after every mutation.
    pub fn with_output(output: Sender<FeedEvent<T>>) -> Self {
        let store = Self::new();
        store.inner.lock().output = Some(output);
        store
    }

    // --- Plain operations (current generation) ---

    /// Insert or replace an item. Last writer wins.
    pub fn upsert(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.sealed {
            return false;
        }
        inner.items.insert(item.id().to_string(), item);
        inner.emit();
        true
    }

    /// Remove an item by id. Returns false if it was not present.
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.sealed || inner.items.remove(id).is_none() {
            return false;
        }
        inner.emit();
        true
    }

    /// Drop every item and emit the (empty) snapshot.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        if inner.sealed {
            return;
        }
        inner.items.clear();
        inner.emit();
    }

    /// Point-in-time copy of the current items, in feed order.
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.lock().snapshot()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn generation(&self) -> Generation {
        self.inner.lock().generation
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.lock().sealed
    }

    // --- Generation-aware operations ---

    /// Apply a batch delivered by a listener opened under `generation`.
    ///
    /// Batches from any other generation are discarded. `gate` runs under
    /// the store lock right before anything is mutated; when it returns
    /// false nothing is applied or emitted.
    pub fn apply<G>(&self, generation: Generation, batch: Batch<T>, gate: G) -> ApplyOutcome
    where
        G: FnOnce() -> bool,
    {
        let mut inner = self.inner.lock();
        if inner.sealed || inner.generation != generation {
            return ApplyOutcome::Stale;
        }
        if !gate() {
            return ApplyOutcome::Gated;
        }

        for id in &batch.removed {
            inner.items.remove(id);
        }
        for item in batch.upserted {
            inner.items.insert(item.id().to_string(), item);
        }
        inner.emit();
        ApplyOutcome::Applied
    }

    /// Clear the store and switch to `generation`.
    ///
    /// With `emit` unset the cleared state is not published; the first batch
    /// of the new generation publishes the repopulated snapshot instead.
    pub fn reset(&self, generation: Generation, emit: bool) {
        let mut inner = self.inner.lock();
        if inner.sealed {
            return;
        }
        inner.items.clear();
        inner.generation = generation;
        if emit {
            inner.emit();
        }
    }

    /// Clear and freeze the store, emitting one empty snapshot.
    ///
    /// Returns false if the store was already sealed (nothing emitted).
    pub fn seal_empty(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.sealed {
            return false;
        }
        inner.items.clear();
        inner.emit();
        inner.sealed = true;
        true
    }

    /// Clear and freeze the store, emitting `event` instead of a snapshot.
    pub fn seal_with(&self, event: FeedEvent<T>) -> bool {
        let mut inner = self.inner.lock();
        if inner.sealed {
            return false;
        }
        inner.items.clear();
        inner.sealed = true;
        if let Some(ref output) = inner.output {
            let _ = output.send(event);
        }
        true
    }

    /// Seal (if needed), send a final event and drop the output sender.
    pub fn close(&self, event: FeedEvent<T>) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        inner.sealed = true;
        if let Some(output) = inner.output.take() {
            let _ = output.send(event);
        }
    }
}

impl<T: FeedItem> Default for AggregationStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Post;
    use crate::subscriptions::CloseReason;
    use crate::types::Timestamp;
    use crossbeam_channel::unbounded;
    use std::sync::Arc;
    use std::thread;

    fn post(id: &str, created: i64) -> Post {
        Post {
            id: id.to_string(),
            created_at: Timestamp(created),
            ..Default::default()
        }
    }

    fn snapshot_ids(event: FeedEvent<Post>) -> Vec<String> {
        match event {
            FeedEvent::Snapshot { items, .. } => items.into_iter().map(|p| p.id).collect(),
            other => panic!("Expected Snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_upsert_last_writer_wins() {
        let store = AggregationStore::new();
        store.upsert(post("p1", 1));
        let mut updated = post("p1", 1);
        updated.text = "edited".to_string();
        store.upsert(updated);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].text, "edited");
    }

    #[test]
    fn test_snapshot_in_feed_order() {
        let store = AggregationStore::new();
        store.upsert(post("old", 1));
        store.upsert(post("new", 3));
        store.upsert(post("mid", 2));

        let ids: Vec<String> = store.snapshot().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn test_every_mutation_emits() {
        let (tx, rx) = unbounded();
        let store = AggregationStore::with_output(tx);

        store.upsert(post("p1", 1));
        assert_eq!(snapshot_ids(rx.try_recv().unwrap()), vec!["p1"]);

        assert!(store.remove("p1"));
        assert!(snapshot_ids(rx.try_recv().unwrap()).is_empty());

        // Removing something absent is not a mutation
        assert!(!store.remove("p1"));
        assert!(rx.try_recv().is_err());

        store.clear();
        assert!(snapshot_ids(rx.try_recv().unwrap()).is_empty());
    }

    #[test]
    fn test_stale_generation_discarded() {
        let (tx, rx) = unbounded();
        let store = AggregationStore::with_output(tx);
        store.reset(Generation(1), false);

        let batch = Batch {
            upserted: vec![post("p1", 1)],
            removed: vec![],
        };
        assert_eq!(store.apply(Generation(0), batch, || true), ApplyOutcome::Stale);
        assert!(store.is_empty());
        assert!(rx.try_recv().is_err());

        let batch = Batch {
            upserted: vec![post("p1", 1)],
            removed: vec![],
        };
        assert_eq!(store.apply(Generation(1), batch, || true), ApplyOutcome::Applied);
        assert_eq!(snapshot_ids(rx.try_recv().unwrap()), vec!["p1"]);
    }

    #[test]
    fn test_gate_blocks_mutation_and_emission() {
        let (tx, rx) = unbounded();
        let store = AggregationStore::with_output(tx);

        let batch = Batch {
            upserted: vec![post("p1", 1)],
            removed: vec![],
        };
        assert_eq!(store.apply(Generation(0), batch, || false), ApplyOutcome::Gated);
        assert!(store.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reset_clears_and_optionally_emits() {
        let (tx, rx) = unbounded();
        let store = AggregationStore::with_output(tx);
        store.upsert(post("p1", 1));
        let _ = rx.try_recv();

        store.reset(Generation(1), false);
        assert!(store.is_empty());
        assert!(rx.try_recv().is_err());

        store.reset(Generation(2), true);
        match rx.try_recv().unwrap() {
            FeedEvent::Snapshot { generation, items } => {
                assert_eq!(generation, Generation(2));
                assert!(items.is_empty());
            }
            other => panic!("Expected Snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_seal_empty_emits_once() {
        let (tx, rx) = unbounded();
        let store = AggregationStore::with_output(tx);
        store.upsert(post("p1", 1));
        let _ = rx.try_recv();

        assert!(store.seal_empty());
        assert!(snapshot_ids(rx.try_recv().unwrap()).is_empty());

        assert!(!store.seal_empty());
        assert!(!store.upsert(post("p2", 2)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_close_sends_final_event_and_disconnects() {
        let (tx, rx) = unbounded();
        let store: AggregationStore<Post> = AggregationStore::with_output(tx);
        store.seal_empty();
        let _ = rx.try_recv();

        store.close(FeedEvent::Closed {
            reason: CloseReason::Unsubscribed,
        });
        assert!(matches!(rx.try_recv().unwrap(), FeedEvent::Closed { .. }));
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_concurrent_writers_lose_nothing() {
        let store = Arc::new(AggregationStore::new());
        let writers = 8;
        let per_writer = 200;

        let handles: Vec<_> = (0..writers)
            .map(|w| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..per_writer {
                        let id = format!("w{}-{}", w, i);
                        store.upsert(post(&id, i));
                        // Every third item is transient
                        if i % 3 == 0 {
                            store.remove(&id);
                        }
                        let snapshot = store.snapshot();
                        // Our own most recent survivor must be visible
                        if i % 3 != 0 {
                            assert!(snapshot.iter().any(|p| p.id == id));
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let expected = writers * (0..per_writer).filter(|i| i % 3 != 0).count();
        assert_eq!(store.len(), expected);
    }
}
