//! Membership feeds: one driving listener fanned out to chunked dependents.

use crate::aggregate::{AggregationStore, ApplyOutcome, Batch};
use crate::config::FeedConfig;
use crate::error::{FeedError, Result, SourceError};
use crate::model::{membership_key, DrivingQuery, FeedItem, Group, Post};
use crate::session::{Admission, ListenerRole, SessionGuard, SessionState};
use crate::source::{Delivery, DocumentSource, ListenerHandle};
use crate::subscriptions::{
    CloseReason, DependentSubscription, FanOutManager, FanOutStats, FeedEvent, FeedStatus,
    Reprovision,
};
use crate::types::{ChangeSet, DocumentId, Generation};
use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Opens membership feeds against one source and session.
#[derive(Clone)]
pub struct Aggregator {
    source: Arc<dyn DocumentSource>,
    session: Arc<dyn SessionState>,
    config: FeedConfig,
}

impl Aggregator {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        session: Arc<dyn SessionState>,
        config: FeedConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            session,
            config,
        })
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Open a feed of `T` driven by `query`.
    ///
    /// If the session is not authenticated the returned feed is already
    /// halted and has emitted one empty snapshot.
    pub fn subscribe<T: FeedItem>(&self, query: DrivingQuery) -> FeedHandle<T> {
        let (sender, receiver) = unbounded();
        let shared = Arc::new(Shared {
            query,
            source: Arc::clone(&self.source),
            guard: SessionGuard::new(Arc::clone(&self.session)),
            status: Mutex::new(FeedStatus::Active),
            driving: Mutex::new(DrivingState::default()),
            fanout: Mutex::new(FanOutManager::new(self.config.chunk_size)),
            store: AggregationStore::with_output(sender),
        });

        if shared.guard.is_authenticated() {
            shared.start();
        } else {
            info!(user = %shared.query.user_id, "not signed in; feed starts halted");
            shared.halt();
        }

        FeedHandle { shared, receiver }
    }

    /// Groups the user belongs to.
    pub fn user_groups(&self, user_id: impl Into<String>) -> FeedHandle<Group> {
        self.subscribe(DrivingQuery::member(user_id))
    }

    /// Groups the user administers.
    pub fn admin_groups(&self, user_id: impl Into<String>) -> FeedHandle<Group> {
        self.subscribe(DrivingQuery::admin(user_id))
    }

    /// Approved posts from every group the user belongs to, newest first.
    pub fn group_posts(&self, user_id: impl Into<String>) -> FeedHandle<Post> {
        self.subscribe(DrivingQuery::member(user_id))
    }
}

/// Consumer side of a feed.
///
/// Dropping the handle unsubscribes.
pub struct FeedHandle<T: FeedItem> {
    shared: Arc<Shared<T>>,
    receiver: Receiver<FeedEvent<T>>,
}

impl<T: FeedItem> FeedHandle<T> {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> std::result::Result<FeedEvent<T>, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<FeedEvent<T>, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> std::result::Result<FeedEvent<T>, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Block until the next snapshot.
    ///
    /// A driving failure comes back as `FeedError::Source`; an unsubscribed
    /// feed as `FeedError::Closed`.
    pub fn next_snapshot(&self) -> Result<Vec<T>> {
        match self.receiver.recv() {
            Ok(FeedEvent::Snapshot { items, .. }) => Ok(items),
            Ok(FeedEvent::Failed { error }) => Err(error.into()),
            Ok(FeedEvent::Closed { .. }) | Err(_) => Err(FeedError::Closed),
        }
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<FeedEvent<T>> {
        self.receiver.try_iter().collect()
    }

    pub fn receiver(&self) -> &Receiver<FeedEvent<T>> {
        &self.receiver
    }

    pub fn status(&self) -> FeedStatus {
        *self.shared.status.lock()
    }

    /// Current aggregated items.
    pub fn snapshot(&self) -> Vec<T> {
        self.shared.store.snapshot()
    }

    pub fn generation(&self) -> Generation {
        self.shared.fanout.lock().generation()
    }

    pub fn stats(&self) -> FanOutStats {
        self.shared.fanout.lock().stats()
    }

    /// Driving keys currently served.
    pub fn keys(&self) -> BTreeSet<String> {
        self.shared.fanout.lock().served().clone()
    }

    /// Re-check the session now instead of at the next delivery. Halts the
    /// feed if the user signed out.
    pub fn check_session(&self) -> FeedStatus {
        if !self.shared.guard.is_authenticated() {
            self.shared.halt();
        }
        self.status()
    }

    /// Stop everything and emit `Closed`. Idempotent.
    pub fn unsubscribe(&self) {
        self.shared.unsubscribe();
    }
}

impl<T: FeedItem> Drop for FeedHandle<T> {
    fn drop(&mut self) {
        self.shared.unsubscribe();
    }
}

/// Driving listener state.
#[derive(Default)]
struct DrivingState {
    handle: Option<Box<dyn ListenerHandle>>,
    /// Membership document key -> group id.
    memberships: HashMap<DocumentId, String>,
}

/// Everything one feed owns. Listener callbacks hold it weakly.
///
/// Lock order: `driving`, then `fanout`, then the store. `status` is only
/// held for the duration of a transition. No lock is held while calling the
/// source.
struct Shared<T: FeedItem> {
    query: DrivingQuery,
    source: Arc<dyn DocumentSource>,
    guard: SessionGuard,
    status: Mutex<FeedStatus>,
    driving: Mutex<DrivingState>,
    fanout: Mutex<FanOutManager>,
    store: AggregationStore<T>,
}

impl<T: FeedItem> Shared<T> {
    fn is_active(&self) -> bool {
        *self.status.lock() == FeedStatus::Active
    }

    /// Move from `Active` to `to`. Returns false if already left `Active`.
    fn leave_active(&self, to: FeedStatus) -> bool {
        let mut status = self.status.lock();
        if *status != FeedStatus::Active {
            return false;
        }
        *status = to;
        true
    }

    fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        debug!(user = %self.query.user_id, role = ?self.query.role, "opening driving listener");

        let handle = self.source.listen(
            self.query.to_query(),
            Box::new(move |delivery| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_driving(delivery);
                }
            }),
        );

        // The initial delivery may already have torn the feed down.
        let mut driving = self.driving.lock();
        if self.is_active() {
            driving.handle = Some(handle);
        } else {
            drop(driving);
            handle.cancel();
        }
    }

    fn on_driving(self: &Arc<Self>, delivery: Delivery) {
        if !self.is_active() {
            return;
        }

        let changes = match self.guard.admit(ListenerRole::Driving, delivery) {
            Admission::Deliver(changes) => changes,
            Admission::AuthorizationLoss => return self.halt(),
            Admission::Fatal(error) | Admission::Transient(error) => return self.fail(error),
        };

        // Fold and plan under one `driving` hold so concurrent deliveries
        // reach the fan-out in the order they were folded.
        let reprovision = {
            let mut driving = self.driving.lock();
            let keys = apply_memberships(&mut driving, changes);
            let mut fanout = self.fanout.lock();
            let Some(reprovision) = fanout.on_keys(keys) else {
                return;
            };
            self.store
                .reset(reprovision.generation, reprovision.plan.is_empty());
            reprovision
        };
        self.provision(reprovision);
    }

    /// Cancel retired listeners and open one per chunk. No lock is held
    /// across source calls.
    fn provision(self: &Arc<Self>, reprovision: Reprovision) {
        for retired in reprovision.retired {
            retired.cancel();
        }

        let generation = reprovision.generation;
        for (index, chunk) in reprovision.plan.into_chunks().into_iter().enumerate() {
            if !self.fanout.lock().is_current(generation) {
                debug!(generation = generation.0, "generation superseded mid-provisioning");
                break;
            }

            let weak = Arc::downgrade(self);
            let handle = self.source.listen(
                T::dependent_query(chunk.clone()),
                Box::new(move |delivery| {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_dependent(generation, index, delivery);
                    }
                }),
            );

            let subscription = DependentSubscription::new(generation, index, chunk, handle);
            let stale = self.fanout.lock().install(subscription);
            if let Some(stale) = stale {
                stale.cancel();
            }
        }
    }

    fn on_dependent(self: &Arc<Self>, generation: Generation, chunk: usize, delivery: Delivery) {
        if !self.is_active() {
            return;
        }

        match self.guard.admit(ListenerRole::Dependent, delivery) {
            Admission::Deliver(changes) => {
                let batch = decode_batch::<T>(changes);
                let outcome = self
                    .store
                    .apply(generation, batch, || self.guard.is_authenticated());
                match outcome {
                    ApplyOutcome::Applied => {}
                    ApplyOutcome::Stale => {
                        debug!(generation = generation.0, chunk, "discarding delivery from retired listener");
                    }
                    ApplyOutcome::Gated => self.halt(),
                }
            }
            Admission::AuthorizationLoss => self.halt(),
            Admission::Fatal(error) | Admission::Transient(error) => {
                warn!(
                    generation = generation.0,
                    chunk,
                    %error,
                    "dependent listener failed; keeping last known items"
                );
            }
        }
    }

    /// Authorization lost: emit one empty snapshot and stop.
    fn halt(&self) {
        if !self.leave_active(FeedStatus::Halted) {
            return;
        }
        info!(user = %self.query.user_id, "authorization lost; halting feed");
        let (driving, dependents) = self.teardown();
        self.store.seal_empty();
        cancel_all(driving, dependents);
    }

    /// Driving query failed: surface the error and stop.
    fn fail(&self, error: SourceError) {
        if !self.leave_active(FeedStatus::Failed) {
            return;
        }
        error!(user = %self.query.user_id, %error, "driving listener failed");
        let (driving, dependents) = self.teardown();
        self.store.seal_with(FeedEvent::Failed { error });
        cancel_all(driving, dependents);
    }

    fn unsubscribe(&self) {
        {
            let mut status = self.status.lock();
            if *status == FeedStatus::Terminated {
                return;
            }
            *status = FeedStatus::Terminated;
        }
        debug!(user = %self.query.user_id, "feed unsubscribed");
        let (driving, dependents) = self.teardown();
        cancel_all(driving, dependents);
        self.store.close(FeedEvent::Closed {
            reason: CloseReason::Unsubscribed,
        });
    }

    /// Take every handle out of the feed. The caller cancels them with no
    /// locks held.
    fn teardown(&self) -> (Option<Box<dyn ListenerHandle>>, Vec<DependentSubscription>) {
        let mut driving = self.driving.lock();
        let handle = driving.handle.take();
        driving.memberships.clear();
        let dependents = self.fanout.lock().terminate();
        (handle, dependents)
    }
}

fn cancel_all(driving: Option<Box<dyn ListenerHandle>>, dependents: Vec<DependentSubscription>) {
    if let Some(handle) = driving {
        handle.cancel();
    }
    for subscription in dependents {
        subscription.cancel();
    }
}

/// Fold a membership delivery into the driving state and return the
/// resulting key set.
fn apply_memberships(driving: &mut DrivingState, changes: ChangeSet) -> BTreeSet<String> {
    for key in &changes.removed {
        driving.memberships.remove(key);
    }
    for doc in &changes.upserted {
        match membership_key(doc) {
            Some(group_id) => {
                driving.memberships.insert(doc.key(), group_id);
            }
            None => {
                warn!(document = %doc.key(), "membership without a group id; ignoring");
                driving.memberships.remove(&doc.key());
            }
        }
    }
    driving.memberships.values().cloned().collect()
}

/// Decode a dependent delivery; undecodable documents are skipped.
fn decode_batch<T: FeedItem>(changes: ChangeSet) -> Batch<T> {
    let mut upserted = Vec::with_capacity(changes.upserted.len());
    for doc in &changes.upserted {
        match T::from_document(doc) {
            Ok(item) => upserted.push(item),
            Err(e) => warn!(document = %doc.key(), error = %e, "skipping undecodable document"),
        }
    }
    Batch {
        upserted,
        removed: changes.removed.into_iter().map(|id| id.0).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionFlag;
    use crate::source::{Listener, MemoryDocumentStore};
    use crate::types::{collections, Document, Query, Timestamp};

    /// Source that keeps every listener, cancelled or not, so tests can
    /// fire deliveries after cancellation.
    #[derive(Default)]
    struct ScriptedSource {
        listeners: Mutex<Vec<(Query, Arc<dyn Fn(Delivery) + Send + Sync>)>>,
    }

    struct NoopHandle;

    impl ListenerHandle for NoopHandle {
        fn cancel(&self) {}

        fn is_cancelled(&self) -> bool {
            false
        }
    }

    impl ScriptedSource {
        fn fire(&self, index: usize, delivery: Delivery) {
            let listener = Arc::clone(&self.listeners.lock()[index].1);
            listener(delivery);
        }
    }

    impl DocumentSource for ScriptedSource {
        fn listen(&self, query: Query, listener: Listener) -> Box<dyn ListenerHandle> {
            self.listeners.lock().push((query, Arc::from(listener)));
            Box::new(NoopHandle)
        }
    }

    fn membership(group: &str, user: &str) -> Document {
        Document::new(collections::MEMBERS, user)
            .with_parent(group)
            .with_field("userId", user)
            .with_field("role", "MEMBER")
    }

    fn post_doc(id: &str, group: &str, created: i64) -> Document {
        Document::new(collections::POSTS, id)
            .with_field("groupId", group)
            .with_field("approvalStatus", "APPROVED")
            .with_field("createdAt", created)
    }

    fn last_items<T: FeedItem>(events: Vec<FeedEvent<T>>) -> Vec<T> {
        events
            .into_iter()
            .rev()
            .find_map(|e| match e {
                FeedEvent::Snapshot { items, .. } => Some(items),
                _ => None,
            })
            .expect("no snapshot emitted")
    }

    #[test]
    fn test_late_delivery_from_retired_listener_is_discarded() {
        let source = Arc::new(ScriptedSource::default());
        let aggregator =
            Aggregator::new(source.clone(), SessionFlag::signed_in(), FeedConfig::default()).unwrap();
        let feed: FeedHandle<Post> = aggregator.group_posts("u1");

        // Listener 0 is the driving query
        source.fire(0, Ok(ChangeSet::upserts(vec![membership("g1", "u1")])));
        source.fire(1, Ok(ChangeSet::upserts(vec![post_doc("p1", "g1", 1)])));
        assert_eq!(feed.snapshot().len(), 1);

        // Membership grows: listener 1 retired, listener 2 serves {g1, g2}
        source.fire(0, Ok(ChangeSet::upserts(vec![membership("g2", "u1")])));
        assert!(feed.snapshot().is_empty());
        assert_eq!(feed.generation(), Generation(2));

        // A late callback from the retired listener must not leak in
        source.fire(1, Ok(ChangeSet::upserts(vec![post_doc("stale", "g1", 9)])));
        assert!(feed.snapshot().is_empty());

        source.fire(2, Ok(ChangeSet::upserts(vec![post_doc("p2", "g2", 2)])));
        let ids: Vec<String> = feed.snapshot().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["p2"]);
    }

    #[test]
    fn test_reordered_redelivery_keeps_listeners() {
        let source = Arc::new(ScriptedSource::default());
        let aggregator =
            Aggregator::new(source.clone(), SessionFlag::signed_in(), FeedConfig::default()).unwrap();
        let feed: FeedHandle<Group> = aggregator.user_groups("u1");

        source.fire(
            0,
            Ok(ChangeSet::upserts(vec![membership("g1", "u1"), membership("g2", "u1")])),
        );
        let stats = feed.stats();

        // Same memberships delivered again in a different order
        source.fire(
            0,
            Ok(ChangeSet::upserts(vec![membership("g2", "u1"), membership("g1", "u1")])),
        );
        assert_eq!(feed.stats(), stats);
        assert_eq!(source.listeners.lock().len(), 2);
    }

    #[test]
    fn test_gate_checked_at_emission() {
        let source = Arc::new(ScriptedSource::default());
        let flag = SessionFlag::signed_in();
        let aggregator =
            Aggregator::new(source.clone(), flag.clone(), FeedConfig::default()).unwrap();
        let feed: FeedHandle<Post> = aggregator.group_posts("u1");

        source.fire(0, Ok(ChangeSet::upserts(vec![membership("g1", "u1")])));
        source.fire(1, Ok(ChangeSet::upserts(vec![post_doc("p1", "g1", 1)])));
        let _ = feed.drain();

        flag.sign_out();
        source.fire(1, Ok(ChangeSet::upserts(vec![post_doc("p2", "g1", 2)])));

        let events = feed.drain();
        assert_eq!(events.len(), 1);
        assert!(last_items(events).is_empty());
        assert_eq!(feed.status(), FeedStatus::Halted);
    }

    #[test]
    fn test_undecodable_documents_skipped() {
        let store = MemoryDocumentStore::new();
        store.put(membership("g1", "u1"));
        store.put(post_doc("good", "g1", 1));
        store.put(post_doc("bad", "g1", 2).with_field("likeCount", "lots"));

        let aggregator = Aggregator::new(
            Arc::new(store.clone()),
            SessionFlag::signed_in(),
            FeedConfig::default(),
        )
        .unwrap();
        let feed = aggregator.group_posts("u1");

        let ids: Vec<String> = feed.snapshot().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["good"]);
        assert_eq!(feed.snapshot()[0].created_at, Timestamp(1));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Aggregator::new(
            Arc::new(MemoryDocumentStore::new()),
            SessionFlag::signed_in(),
            FeedConfig { chunk_size: 0 },
        );
        assert!(result.is_err());
    }
}
