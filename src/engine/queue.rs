use std::collections::VecDeque;

use tower::BoxError;

use crate::pending::{PendingEntry, Reply};
use crate::request::{Request, Response};

/// A suspended request waiting for its policy's round to finish.
pub(crate) struct QueueItem {
    /// Dispatch sequence of the original call
    pub seq: u64,
    pub request: Request,
    pub reply: Reply,
    /// Whether an attempt was ever sent downstream
    pub dispatched: bool,
    /// Re-queued because its replay triggered again
    pub retriggered: bool,
}

impl QueueItem {
    /// Request suspended on arrival, never dispatched.
    pub fn arrived(seq: u64, request: Request, reply: Reply) -> Self {
        Self {
            seq,
            request,
            reply,
            dispatched: false,
            retriggered: false,
        }
    }

    /// Request promoted out of the pending set.
    pub fn promoted(seq: u64, entry: PendingEntry) -> Self {
        Self {
            seq,
            request: entry.request,
            reply: entry.reply,
            dispatched: true,
            retriggered: false,
        }
    }

    pub fn settle(self, result: Result<Response, BoxError>) {
        // The caller may have dropped its future; nothing left to notify then.
        let _ = self.reply.send(result);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Recovering,
}

/// Mutable coordination state private to one policy.
pub(crate) struct PolicyState {
    pub phase: Phase,
    queue: VecDeque<QueueItem>,
    /// Recovery handler invocations so far
    rounds: u64,
}

impl PolicyState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            queue: VecDeque::new(),
            rounds: 0,
        }
    }

    pub fn is_recovering(&self) -> bool {
        self.phase == Phase::Recovering
    }

    pub fn push(&mut self, item: QueueItem) {
        self.queue.push_back(item);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    pub fn begin_round(&mut self) -> u64 {
        self.rounds += 1;
        self.rounds
    }

    pub fn has_retriggered(&self) -> bool {
        self.queue.iter().any(|item| item.retriggered)
    }

    /// Empty the queue in original dispatch order.
    ///
    /// Items promoted from the pending set carry their dispatch sequence, so
    /// they land ahead of anything that arrived after they were sent, no
    /// matter which path queued them first.
    pub fn take_batch(&mut self) -> Vec<QueueItem> {
        let mut batch: Vec<QueueItem> = self.queue.drain(..).collect();
        batch.sort_by_key(|item| item.seq);
        batch
    }
}
