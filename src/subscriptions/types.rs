//! Types shared by the fan-out manager and feed consumers.

use crate::error::SourceError;
use crate::source::ListenerHandle;
use crate::types::Generation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Events emitted on a feed's output channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent<T> {
    /// Current aggregated items, in feed order.
    Snapshot {
        /// Provisioning epoch the snapshot belongs to.
        generation: Generation,
        items: Vec<T>,
    },

    /// The driving query failed; no further snapshots follow.
    Failed { error: SourceError },

    /// The feed was closed; the channel disconnects after this.
    Closed { reason: CloseReason },
}

impl<T> FeedEvent<T> {
    /// Items of a snapshot event.
    pub fn items(&self) -> Option<&[T]> {
        match self {
            FeedEvent::Snapshot { items, .. } => Some(items),
            _ => None,
        }
    }
}

/// Why a feed was closed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The consumer unsubscribed or dropped its handle.
    Unsubscribed,
}

/// Lifecycle of a feed as seen by its consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    /// Listening and emitting snapshots.
    Active,
    /// Authorization was lost; an empty snapshot was emitted. Subscribe
    /// again after signing in.
    Halted,
    /// The driving query failed.
    Failed,
    /// Unsubscribed.
    Terminated,
}

/// Counters kept by the fan-out manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutStats {
    /// Dependent handles ever installed (including stale ones).
    pub opened: u64,
    /// Dependent handles ever handed back for cancellation.
    pub cancelled: u64,
    /// Times a new chunk plan was provisioned.
    pub provisions: u64,
    /// Dependent handles currently live.
    pub live: usize,
}

/// A dependent listener serving one chunk of driving keys.
pub struct DependentSubscription {
    pub generation: Generation,
    pub chunk_index: usize,
    pub keys: Vec<String>,
    handle: Box<dyn ListenerHandle>,
}

impl DependentSubscription {
    pub fn new(
        generation: Generation,
        chunk_index: usize,
        keys: Vec<String>,
        handle: Box<dyn ListenerHandle>,
    ) -> Self {
        Self {
            generation,
            chunk_index,
            keys,
            handle,
        }
    }

    /// Cancel the underlying listener. Consumes the subscription so it can
    /// only happen once.
    pub fn cancel(self) {
        self.handle.cancel();
    }
}

impl fmt::Debug for DependentSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependentSubscription")
            .field("generation", &self.generation)
            .field("chunk_index", &self.chunk_index)
            .field("keys", &self.keys.len())
            .finish()
    }
}

/// The live dependent subscriptions of one feed.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    members: Vec<DependentSubscription>,
}

impl SubscriptionSet {
    pub fn push(&mut self, subscription: DependentSubscription) {
        self.members.push(subscription);
    }

    /// Remove and return every member.
    pub fn drain(&mut self) -> Vec<DependentSubscription> {
        std::mem::take(&mut self.members)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DependentSubscription> {
        self.members.iter()
    }
}
