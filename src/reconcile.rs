//! Near-duplicate reconciliation for search results.
//!
//! A message sent from this device can match a query twice: once as the
//! locally created record (UUID id) and once as the server-confirmed copy
//! (short server id). Entries with the same content and sender whose
//! timestamps fall within the merge window of the last kept entry are
//! collapsed into one. Timestamps are compared in whole seconds, so
//! sub-second precision never decides whether two entries merge.
//!
//! This is a best-effort heuristic. It assumes server ids are shorter than
//! locally generated ones, which holds for the current id schemes but is not
//! guaranteed in general.

use crate::config::ReconcileConfig;
use crate::model::Message;
use crate::types::Timestamp;
use std::collections::HashMap;

/// An entry the reconciliation pass can merge.
pub trait Reconcilable: Clone {
    fn reconcile_id(&self) -> &str;
    fn content(&self) -> &str;
    fn originator(&self) -> &str;
    fn timestamp(&self) -> Timestamp;
}

impl Reconcilable for Message {
    fn reconcile_id(&self) -> &str {
        &self.id
    }

    fn content(&self) -> &str {
        &self.content
    }

    fn originator(&self) -> &str {
        &self.sender_id
    }

    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// True if `id` looks server-assigned rather than locally generated.
pub fn looks_server_assigned(id: &str, config: &ReconcileConfig) -> bool {
    id.len() < config.server_id_max_len
}

/// Collapse near-duplicates. Output is newest first.
pub fn reconcile<T: Reconcilable>(entries: Vec<T>, config: &ReconcileConfig) -> Vec<T> {
    // Negative windows merge nothing.
    let window = u64::try_from(config.merge_window_secs).unwrap_or(0);

    let mut groups: HashMap<(String, String), Vec<T>> = HashMap::new();
    for entry in entries {
        let key = (entry.content().to_string(), entry.originator().to_string());
        groups.entry(key).or_default().push(entry);
    }

    let mut kept = Vec::new();
    for (_, mut group) in groups {
        if group.len() == 1 {
            kept.append(&mut group);
            continue;
        }

        // Stable: equal timestamps keep their input order.
        group.sort_by_key(|e| e.timestamp());

        let mut merged: Vec<T> = Vec::with_capacity(group.len());
        for candidate in group {
            let Some(last) = merged.last_mut() else {
                merged.push(candidate);
                continue;
            };

            let gap = candidate
                .timestamp()
                .as_secs()
                .abs_diff(last.timestamp().as_secs());
            if gap < window {
                let candidate_server = looks_server_assigned(candidate.reconcile_id(), config);
                let last_server = looks_server_assigned(last.reconcile_id(), config);
                if candidate_server && !last_server {
                    *last = candidate;
                }
            } else {
                merged.push(candidate);
            }
        }
        kept.append(&mut merged);
    }

    kept.sort_by(|a, b| {
        b.timestamp()
            .cmp(&a.timestamp())
            .then_with(|| a.reconcile_id().cmp(b.reconcile_id()))
    });
    kept
}
