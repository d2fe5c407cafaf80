//! Fan-out subscriptions for membership feeds.
//!
//! A feed keeps one driving listener on the user's memberships and a set of
//! dependent listeners, one per chunk of group ids:
//! - The driving key set is diffed as an unordered set, so re-deliveries and
//!   reordering never reopen listeners
//! - Every (re)provisioning bumps a generation; deliveries from retired
//!   listeners are discarded
//! - Retired handles are returned to the caller and cancelled exactly once
//!
//! # Example
//!
//! ```ignore
//! let mut manager = FanOutManager::new(10);
//!
//! if let Some(reprovision) = manager.on_keys(keys) {
//!     for retired in reprovision.retired {
//!         retired.cancel();
//!     }
//!     for (index, chunk) in reprovision.plan.into_chunks().into_iter().enumerate() {
//!         let handle = source.listen(Post::dependent_query(chunk.clone()), listener);
//!         let sub = DependentSubscription::new(reprovision.generation, index, chunk, handle);
//!         if let Some(stale) = manager.install(sub) {
//!             stale.cancel();
//!         }
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::{FanOutManager, FanOutPhase, Reprovision};
pub use types::{
    CloseReason, DependentSubscription, FanOutStats, FeedEvent, FeedStatus, SubscriptionSet,
};
