//! Pending set: dispatched requests that have not settled yet.
//!
//! An entry leaves the set exactly once. Whoever removes it (the caller on
//! response, or a recovery round promoting it into a queue) owns settling the
//! caller, so removal doubles as the "already queued" guard.

use std::collections::BTreeMap;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tower::BoxError;

use crate::request::{Request, Response};

/// Sender half of a caller's unresolved result.
pub(crate) type Reply = oneshot::Sender<Result<Response, BoxError>>;

pub(crate) struct PendingEntry {
    pub request: Request,
    /// Indices of the policies this request is admissible to
    pub policies: Vec<usize>,
    /// Aborts the in-flight attempt when the entry is promoted
    pub abort: CancellationToken,
    pub reply: Reply,
}

/// Entries keyed by dispatch sequence, so iteration follows dispatch order.
#[derive(Default)]
pub(crate) struct PendingSet {
    entries: BTreeMap<u64, PendingEntry>,
}

impl PendingSet {
    pub fn insert(&mut self, seq: u64, entry: PendingEntry) {
        self.entries.insert(seq, entry);
    }

    pub fn remove(&mut self, seq: u64) -> Option<PendingEntry> {
        self.entries.remove(&seq)
    }

    pub fn get(&self, seq: u64) -> Option<&PendingEntry> {
        self.entries.get(&seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remove every entry admissible to `policy`, oldest dispatch first.
    pub fn drain_admissible(&mut self, policy: usize) -> Vec<(u64, PendingEntry)> {
        let seqs: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.policies.contains(&policy))
            .map(|(seq, _)| *seq)
            .collect();
        seqs.into_iter()
            .filter_map(|seq| self.entries.remove(&seq).map(|entry| (seq, entry)))
            .collect()
    }
}
