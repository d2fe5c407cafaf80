//! Document source abstraction.
//!
//! A source answers live queries: every listener receives an initial
//! delivery with the documents currently matching, followed by incremental
//! deliveries as documents enter, change in, or leave the result set.
//!
//! Removal ids are document keys (see [`Document::key`]), which differ from
//! the plain id only for sub-collection documents.
//!
//! [`Document::key`]: crate::types::Document::key

mod memory;

use crate::error::SourceError;
use crate::types::{ChangeSet, Query};

pub use memory::{ListenerId, MemoryDocumentStore, MemoryListenerHandle};

/// Result of one listener callback.
pub type Delivery = std::result::Result<ChangeSet, SourceError>;

/// Callback invoked for every delivery on a live query.
pub type Listener = Box<dyn Fn(Delivery) + Send + Sync>;

/// Cancellable registration of a live query.
pub trait ListenerHandle: Send + Sync {
    /// Stop the listener. Safe to call more than once.
    fn cancel(&self);

    fn is_cancelled(&self) -> bool;
}

/// A store that can answer live queries.
pub trait DocumentSource: Send + Sync {
    /// Open a live query. The listener may be invoked before this returns.
    fn listen(&self, query: Query, listener: Listener) -> Box<dyn ListenerHandle>;
}
