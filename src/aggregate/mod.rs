//! Aggregation of many dependent listeners into one collection.

mod store;

pub use store::{AggregationStore, ApplyOutcome, Batch};
