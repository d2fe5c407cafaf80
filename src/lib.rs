//! # Cohort
//!
//! Live feeds of everything relevant to a user's group memberships, built on
//! a document store that only answers point queries and bounded `IN` queries.
//!
//! ## Core Concepts
//!
//! - **Driving listener**: one live query over the user's memberships
//! - **Chunk plan**: the membership key set split into `IN` queries of at most ten keys
//! - **Fan-out**: dependent listeners reopened only when the key set changes by value
//! - **Aggregation store**: one mutex-guarded map merged from every dependent listener
//! - **Session guard**: sign-out and permission loss end in an empty snapshot, not an error
//! - **Reconciliation**: collapsing local and server copies of the same message
//!
//! ## Example
//!
//! ```ignore
//! use cohort::{Aggregator, FeedConfig, FeedEvent, MemoryDocumentStore, SessionFlag};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryDocumentStore::new());
//! let session = SessionFlag::signed_in();
//! let aggregator = Aggregator::new(store, session, FeedConfig::default())?;
//!
//! let feed = aggregator.group_posts("user-1");
//! while let Ok(event) = feed.recv() {
//!     match event {
//!         FeedEvent::Snapshot { items, .. } => println!("{} posts", items.len()),
//!         FeedEvent::Failed { error } => eprintln!("feed failed: {}", error),
//!         FeedEvent::Closed { .. } => break,
//!     }
//! }
//! ```

pub mod aggregate;
pub mod config;
pub mod error;
pub mod feed;
pub mod model;
pub mod planner;
pub mod reconcile;
pub mod session;
pub mod source;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use aggregate::{AggregationStore, ApplyOutcome, Batch};
pub use config::{FeedConfig, ReconcileConfig, DEFAULT_CHUNK_SIZE};
pub use error::{FeedError, Result, SourceError, SourceErrorKind};
pub use feed::{Aggregator, FeedHandle};
pub use model::{
    membership_key, ApprovalStatus, DrivingQuery, FeedItem, Group, GroupPrivacy, Message, Post,
};
pub use planner::{plan, ChunkPlan};
pub use reconcile::{looks_server_assigned, reconcile, Reconcilable};
pub use session::{Admission, ListenerRole, SessionFlag, SessionGuard, SessionState};
pub use source::{
    Delivery, DocumentSource, Listener, ListenerHandle, ListenerId, MemoryDocumentStore,
    MemoryListenerHandle,
};
pub use subscriptions::{
    CloseReason, DependentSubscription, FanOutManager, FanOutPhase, FanOutStats, FeedEvent,
    FeedStatus, Reprovision, SubscriptionSet,
};
pub use types::*;
