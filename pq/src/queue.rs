//! Per-endpoint backlog view
//!
//! Built fresh from the store at the start of every cycle. Items come out in
//! ascending schedule order; the first item scheduled in the future halts the
//! queue for the rest of the cycle.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::{ActionId, ExecutionRecord};

/// A Queued execution record together with the action fields that order it
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRecord {
    pub record: ExecutionRecord,
    pub action_name: String,
    pub scheduled_at: DateTime<Utc>,
}

impl PendingRecord {
    pub fn action_id(&self) -> ActionId {
        self.record.action_id
    }
}

/// Ordered backlog of one endpoint for one cycle
#[derive(Debug)]
pub struct EndpointQueue {
    endpoint: String,
    items: VecDeque<PendingRecord>,
    halted: bool,
}

impl EndpointQueue {
    /// Build a queue from pending records in any order
    pub fn new(endpoint: impl Into<String>, mut pending: Vec<PendingRecord>) -> Self {
        let endpoint = endpoint.into();
        debug!(%endpoint, count = pending.len(), "EndpointQueue::new: called");
        pending.sort_by(|a, b| {
            a.scheduled_at
                .cmp(&b.scheduled_at)
                .then_with(|| a.action_id().cmp(&b.action_id()))
        });
        Self {
            endpoint,
            items: pending.into(),
            halted: false,
        }
    }

    /// Remove and return the next item if it is due at `now`
    ///
    /// Returns `None` once the backlog is drained or the head is scheduled in
    /// the future. A halted queue stays halted even if `now` advances.
    pub fn next_due(&mut self, now: DateTime<Utc>) -> Option<PendingRecord> {
        if self.halted {
            return None;
        }
        match self.items.front() {
            Some(head) if head.scheduled_at <= now => self.items.pop_front(),
            Some(head) => {
                debug!(endpoint = %self.endpoint, action_id = head.action_id(), scheduled_at = %head.scheduled_at, "EndpointQueue::next_due: head not due, halting");
                self.halted = true;
                None
            }
            None => None,
        }
    }

    /// Items left in the backlog, including deferred ones
    pub fn remaining(&self) -> usize {
        self.items.len()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
