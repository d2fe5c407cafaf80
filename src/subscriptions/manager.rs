//! Fan-out manager: maps driving key sets to chunked dependent listeners.

use crate::planner::ChunkPlan;
use crate::types::Generation;
use std::collections::BTreeSet;
use tracing::debug;

use super::types::{DependentSubscription, FanOutStats, SubscriptionSet};

/// Where the manager is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FanOutPhase {
    /// No key set seen yet.
    Idle,
    /// Serving a key set (possibly empty).
    Active,
    /// Torn down; key sets are ignored.
    Terminated,
}

/// Work handed to the caller when the key set changed.
#[derive(Debug)]
pub struct Reprovision {
    /// Generation the new listeners must be opened under.
    pub generation: Generation,
    /// Chunks to open one dependent listener each for.
    pub plan: ChunkPlan,
    /// Previously live subscriptions; the caller must cancel each of them.
    pub retired: Vec<DependentSubscription>,
}

/// Owns the dependent subscriptions of a feed.
///
/// The manager never talks to a source itself. It decides what to open and
/// what to cancel and hands ownership of retired handles back to the caller,
/// so every handle is cancelled exactly once and no lock needs to be held
/// while the source is called.
pub struct FanOutManager {
    chunk_size: usize,
    phase: FanOutPhase,
    /// Key set currently served.
    served: BTreeSet<String>,
    generation: Generation,
    live: SubscriptionSet,
    stats: FanOutStats,
}

impl FanOutManager {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            phase: FanOutPhase::Idle,
            served: BTreeSet::new(),
            generation: Generation::default(),
            live: SubscriptionSet::default(),
            stats: FanOutStats::default(),
        }
    }

    /// Feed a driving key set.
    ///
    /// Returns `None` when nothing needs to change: the set equals the one
    /// being served (order is irrelevant) or the manager is terminated.
    pub fn on_keys(&mut self, keys: BTreeSet<String>) -> Option<Reprovision> {
        match self.phase {
            FanOutPhase::Terminated => return None,
            FanOutPhase::Active if keys == self.served => {
                debug!(keys = keys.len(), "key set unchanged; keeping listeners");
                return None;
            }
            _ => {}
        }

        let retired = self.live.drain();
        self.stats.cancelled += retired.len() as u64;
        self.generation = self.generation.next();
        self.served = keys;
        self.phase = FanOutPhase::Active;
        self.stats.provisions += 1;

        let plan = ChunkPlan::new(&self.served, self.chunk_size);
        debug!(
            generation = self.generation.0,
            keys = self.served.len(),
            chunks = plan.len(),
            retired = retired.len(),
            "provisioning dependent listeners"
        );

        Some(Reprovision {
            generation: self.generation,
            plan,
            retired,
        })
    }

    /// Record a freshly opened dependent subscription.
    ///
    /// If it belongs to a generation that is no longer current (or the
    /// manager was terminated meanwhile) it is handed back for cancellation.
    pub fn install(&mut self, subscription: DependentSubscription) -> Option<DependentSubscription> {
        self.stats.opened += 1;
        if self.phase != FanOutPhase::Active || subscription.generation != self.generation {
            self.stats.cancelled += 1;
            return Some(subscription);
        }
        self.live.push(subscription);
        None
    }

    /// Tear down. Returns every live subscription for cancellation.
    pub fn terminate(&mut self) -> Vec<DependentSubscription> {
        self.phase = FanOutPhase::Terminated;
        self.served.clear();
        let retired = self.live.drain();
        self.stats.cancelled += retired.len() as u64;
        retired
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        self.phase == FanOutPhase::Active && self.generation == generation
    }

    pub fn phase(&self) -> FanOutPhase {
        self.phase
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Key set currently served.
    pub fn served(&self) -> &BTreeSet<String> {
        &self.served
    }

    pub fn live(&self) -> &SubscriptionSet {
        &self.live
    }

    pub fn stats(&self) -> FanOutStats {
        FanOutStats {
            live: self.live.len(),
            ..self.stats
        }
    }
}
